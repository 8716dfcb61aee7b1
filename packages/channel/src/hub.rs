// ABOUTME: ZeroMQ broker relaying events from workers to gateways
// ABOUTME: Workers PUSH to the ingress, gateways SUB to the egress; one loop keeps per-producer order

use crate::error::Result;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use zeromq::{PubSocket, PullSocket, Socket, SocketRecv, SocketSend};

/// Frames per message: `[topic, json(event)]`
pub(crate) const FRAME_COUNT: usize = 2;

pub struct EventHub {
    ingress: PullSocket,
    egress: PubSocket,
    ingress_endpoint: String,
    egress_endpoint: String,
}

impl EventHub {
    /// Bind both sockets. Port 0 picks a free port; see the `*_endpoint` accessors.
    pub async fn bind(ingress: &str, egress: &str) -> Result<Self> {
        let mut pull = PullSocket::new();
        let ingress_endpoint = pull.bind(ingress).await?.to_string();

        let mut publisher = PubSocket::new();
        let egress_endpoint = publisher.bind(egress).await?.to_string();

        info!(
            "Event hub listening: ingress {}, egress {}",
            ingress_endpoint, egress_endpoint
        );

        Ok(Self {
            ingress: pull,
            egress: publisher,
            ingress_endpoint,
            egress_endpoint,
        })
    }

    pub fn ingress_endpoint(&self) -> &str {
        &self.ingress_endpoint
    }

    pub fn egress_endpoint(&self) -> &str {
        &self.egress_endpoint
    }

    /// Forward until shutdown is signalled. Returns the number of relayed messages.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<u64> {
        let mut relayed: u64 = 0;

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                message = self.ingress.recv() => {
                    let message = message?;
                    if message.len() != FRAME_COUNT {
                        warn!("Dropping message with {} frames, expected {}", message.len(), FRAME_COUNT);
                        continue;
                    }
                    if let Err(e) = self.egress.send(message).await {
                        warn!("Failed to relay event: {}", e);
                        continue;
                    }
                    relayed += 1;
                    debug!(relayed = relayed, "Relayed event");
                }
            }
        }

        info!("Event hub stopped after relaying {} events", relayed);
        Ok(relayed)
    }
}
