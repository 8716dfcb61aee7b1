// ABOUTME: Gateway: authorizes room joins and bridges channel subscriptions into the registry
// ABOUTME: One forwarder task per room with members, started on first join and stopped on last leave

use crate::auth::{Authenticator, Identity};
use crate::error::{GatewayError, Result};
use crate::protocol::{ClientMessage, ServerMessage};
use crate::registry::{ConnectionId, ConnectionRegistry, Registration};
use futures::StreamExt;
use runhub_channel::{EventChannel, Subscription};
use runhub_core::{ErrorCode, Event, JobCanceller, Topic, TopicKind};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const DEFAULT_CANCEL_REASON: &str = "cancelled by user";

pub struct Gateway {
    registry: Arc<ConnectionRegistry>,
    channel: Arc<dyn EventChannel>,
    authenticator: Arc<dyn Authenticator>,
    canceller: Option<Arc<dyn JobCanceller>>,
    // Held across room transitions so subscribe/unsubscribe never interleave
    forwarders: Mutex<HashMap<Topic, JoinHandle<()>>>,
}

impl Gateway {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        channel: Arc<dyn EventChannel>,
        authenticator: Arc<dyn Authenticator>,
    ) -> Self {
        Self {
            registry,
            channel,
            authenticator,
            canceller: None,
            forwarders: Mutex::new(HashMap::new()),
        }
    }

    /// Let clients cancel jobs over their connection
    pub fn with_canceller(mut self, canceller: Arc<dyn JobCanceller>) -> Self {
        self.canceller = Some(canceller);
        self
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Resolve a handshake token. Unknown tokens yield an unauthenticated connection.
    pub async fn authenticate(&self, token: Option<&str>) -> Option<Identity> {
        let token = token?;
        let identity = self.authenticator.authenticate(token).await;
        if identity.is_none() {
            warn!(audit = true, "Connection presented an unknown token");
        }
        identity
    }

    pub fn connect(&self, identity: Option<Identity>) -> Registration {
        let registration = self.registry.register(identity.clone());
        info!(
            connection_id = registration.id,
            user_id = identity.as_ref().map(|i| i.user_id.as_str()).unwrap_or("-"),
            "Client connected"
        );
        registration
    }

    /// Join a room, subscribing to the channel if this is its first member
    pub async fn join(&self, id: ConnectionId, topic: &Topic) -> Result<()> {
        let identity = self.registry.identity(id);
        authorize(identity.as_ref(), topic).inspect_err(|e| {
            warn!(
                audit = true,
                connection_id = id,
                topic = %topic,
                "Refused join: {}",
                e
            );
        })?;

        let mut forwarders = self.forwarders.lock().await;
        self.registry.join(id, topic)?;
        if forwarders.contains_key(topic) {
            return Ok(());
        }

        match self.channel.subscribe(topic).await {
            Ok(subscription) => {
                let registry = self.registry.clone();
                let handle = tokio::spawn(forward(registry, subscription));
                forwarders.insert(topic.clone(), handle);
                debug!(topic = %topic, "Started room forwarder");
                Ok(())
            }
            Err(e) => {
                self.registry.leave(id, topic);
                Err(e.into())
            }
        }
    }

    pub async fn leave(&self, id: ConnectionId, topic: &Topic) {
        let mut forwarders = self.forwarders.lock().await;
        if self.registry.leave(id, topic) {
            self.close_room(&mut forwarders, topic).await;
        }
    }

    pub async fn disconnect(&self, id: ConnectionId) {
        let mut forwarders = self.forwarders.lock().await;
        for topic in self.registry.on_disconnect(id) {
            self.close_room(&mut forwarders, &topic).await;
        }
        info!(connection_id = id, "Client disconnected");
    }

    async fn close_room(&self, forwarders: &mut HashMap<Topic, JoinHandle<()>>, topic: &Topic) {
        if let Some(handle) = forwarders.remove(topic) {
            handle.abort();
            // Let the aborted task drop its subscription before releasing interest
            let _ = handle.await;
        }
        if let Err(e) = self.channel.unsubscribe(topic).await {
            warn!(topic = %topic, "Failed to unsubscribe: {}", e);
        }
        debug!(topic = %topic, "Closed room");
    }

    /// Push an event to every connection of a user, regardless of rooms
    pub fn emit_to_user(&self, user_id: &str, event: &Event) -> usize {
        self.registry.emit_to_user(user_id, event)
    }

    pub async fn room_count(&self) -> usize {
        self.forwarders.lock().await.len()
    }

    /// Apply one client message and produce the reply
    pub async fn handle_message(&self, id: ConnectionId, message: ClientMessage) -> ServerMessage {
        match message {
            ClientMessage::Subscribe { topic } => {
                let result = match Topic::parse(&topic) {
                    Ok(topic) => self.join(id, &topic).await.map(|_| topic),
                    Err(e) => Err(e.into()),
                };
                match result {
                    Ok(topic) => ServerMessage::Subscribed { topic },
                    Err(e) => error_reply(e),
                }
            }
            ClientMessage::Unsubscribe { topic } => match Topic::parse(&topic) {
                Ok(topic) => {
                    self.leave(id, &topic).await;
                    ServerMessage::Unsubscribed { topic }
                }
                Err(e) => error_reply(e.into()),
            },
            ClientMessage::Cancel { job_id, reason } => self.cancel(id, &job_id, reason).await,
            ClientMessage::Ping => ServerMessage::Pong,
        }
    }

    async fn cancel(&self, id: ConnectionId, job_id: &str, reason: Option<String>) -> ServerMessage {
        let Some(identity) = self.registry.identity(id) else {
            warn!(audit = true, connection_id = id, job_id = %job_id, "Refused unauthenticated cancel");
            return error_reply(GatewayError::Unauthenticated);
        };
        let Some(canceller) = &self.canceller else {
            return ServerMessage::error(ErrorCode::InternalError, "cancellation is not available");
        };

        let reason = reason
            .filter(|r| !r.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_CANCEL_REASON.to_string());
        info!(job_id = %job_id, user_id = %identity.user_id, "Cancel requested over websocket");

        match canceller.cancel_job(job_id, &reason).await {
            Ok(ack) => ServerMessage::CancelAck {
                job_id: ack.job_id,
                status: ack.status,
            },
            Err((code, message)) => ServerMessage::error(code, message),
        }
    }
}

/// Unauthenticated connections join nothing; approvals rooms are per workspace
fn authorize(identity: Option<&Identity>, topic: &Topic) -> Result<()> {
    let identity = identity.ok_or(GatewayError::Unauthenticated)?;
    if topic.kind() == TopicKind::Approvals && topic.id() != identity.workspace_id {
        return Err(GatewayError::Forbidden(topic.to_string()));
    }
    Ok(())
}

fn error_reply(error: GatewayError) -> ServerMessage {
    let message = match &error {
        GatewayError::Channel(_) => "event channel unavailable".to_string(),
        other => other.to_string(),
    };
    ServerMessage::error(error.code(), message)
}

/// Deliver a room's events in order, skipping redeliveries and stale attempts
async fn forward(registry: Arc<ConnectionRegistry>, mut subscription: Subscription) {
    let topic = subscription.topic().clone();
    let mut last_sequence: Option<u64> = None;

    while let Some(event) = subscription.next().await {
        if last_sequence.is_some_and(|last| event.sequence <= last) {
            debug!(
                topic = %topic,
                sequence = event.sequence,
                "Dropping duplicate or stale event"
            );
            continue;
        }
        last_sequence = Some(event.sequence);
        registry.deliver(&event);
    }

    debug!(topic = %topic, "Room subscription ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticTokenAuthenticator;
    use pretty_assertions::assert_eq;
    use runhub_channel::LocalEventBus;
    use runhub_config::AuthToken;
    use runhub_core::{CancelAck, CancelStatus, EventKind, EventSequencer};
    use std::time::Duration;

    fn token(token: &str, user: &str, workspace: &str) -> AuthToken {
        AuthToken {
            token: token.to_string(),
            user_id: user.to_string(),
            workspace_id: workspace.to_string(),
        }
    }

    fn setup() -> (Gateway, Arc<LocalEventBus>) {
        let bus = Arc::new(LocalEventBus::default());
        let auth = StaticTokenAuthenticator::new(&[
            token("t-alice", "alice", "ws-1"),
            token("t-bob", "bob", "ws-2"),
        ]);
        let gateway = Gateway::new(
            Arc::new(ConnectionRegistry::new(16)),
            bus.clone(),
            Arc::new(auth),
        );
        (gateway, bus)
    }

    async fn recv(registration: &mut Registration) -> Event {
        tokio::time::timeout(Duration::from_secs(1), registration.events.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_room_lifecycle_follows_membership() {
        let (gateway, bus) = setup();
        let topic = Topic::execution("job_1");
        let alice = gateway.authenticate(Some("t-alice")).await;
        let a = gateway.connect(alice.clone());
        let b = gateway.connect(alice);

        gateway.join(a.id, &topic).await.unwrap();
        gateway.join(b.id, &topic).await.unwrap();
        assert_eq!(gateway.room_count().await, 1);
        assert_eq!(bus.subscriber_count(&topic), 1);

        gateway.leave(a.id, &topic).await;
        assert_eq!(gateway.room_count().await, 1);

        gateway.disconnect(b.id).await;
        assert_eq!(gateway.room_count().await, 0);
        assert_eq!(bus.subscriber_count(&topic), 0);
    }

    #[tokio::test]
    async fn test_forwarder_delivers_in_order_and_drops_duplicates() {
        let (gateway, bus) = setup();
        let topic = Topic::execution("job_1");
        let mut conn = gateway.connect(gateway.authenticate(Some("t-alice")).await);
        gateway.join(conn.id, &topic).await.unwrap();

        let mut seq = EventSequencer::for_attempt(topic.clone(), 1);
        let first = seq.next(EventKind::Progress { percent: 10 });
        let second = seq.next(EventKind::Progress { percent: 30 });
        bus.send(&first);
        bus.send(&first);
        bus.send(&second);

        assert_eq!(recv(&mut conn).await, first);
        assert_eq!(recv(&mut conn).await, second);
    }

    #[tokio::test]
    async fn test_no_delivery_after_leave() {
        let (gateway, bus) = setup();
        let topic = Topic::execution("job_1");
        let alice = gateway.authenticate(Some("t-alice")).await;
        let mut leaving = gateway.connect(alice.clone());
        let mut staying = gateway.connect(alice);
        gateway.join(leaving.id, &topic).await.unwrap();
        gateway.join(staying.id, &topic).await.unwrap();

        gateway.leave(leaving.id, &topic).await;

        let mut seq = EventSequencer::for_attempt(topic.clone(), 1);
        let event = seq.next(EventKind::Progress { percent: 10 });
        bus.send(&event);

        // Once the remaining member has it, the forwarder has finished delivering
        assert_eq!(recv(&mut staying).await, event);
        assert!(leaving.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unauthenticated_join_is_refused() {
        let (gateway, bus) = setup();
        let conn = gateway.connect(gateway.authenticate(Some("bogus")).await);

        let reply = gateway
            .handle_message(
                conn.id,
                ClientMessage::Subscribe {
                    topic: "execution:job_1".to_string(),
                },
            )
            .await;
        assert!(matches!(
            reply,
            ServerMessage::Error {
                code: ErrorCode::Unauthenticated,
                ..
            }
        ));
        assert_eq!(bus.topic_count(), 0);
    }

    #[tokio::test]
    async fn test_approvals_limited_to_own_workspace() {
        let (gateway, _bus) = setup();
        let conn = gateway.connect(gateway.authenticate(Some("t-alice")).await);

        let own = gateway
            .handle_message(
                conn.id,
                ClientMessage::Subscribe {
                    topic: "approvals:ws-1".to_string(),
                },
            )
            .await;
        assert_eq!(
            own,
            ServerMessage::Subscribed {
                topic: Topic::approvals("ws-1")
            }
        );

        let other = gateway
            .handle_message(
                conn.id,
                ClientMessage::Subscribe {
                    topic: "approvals:ws-2".to_string(),
                },
            )
            .await;
        assert!(matches!(
            other,
            ServerMessage::Error {
                code: ErrorCode::Forbidden,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_malformed_topic_is_invalid_message() {
        let (gateway, _bus) = setup();
        let conn = gateway.connect(gateway.authenticate(Some("t-alice")).await);
        let reply = gateway
            .handle_message(
                conn.id,
                ClientMessage::Subscribe {
                    topic: "nonsense".to_string(),
                },
            )
            .await;
        assert!(matches!(
            reply,
            ServerMessage::Error {
                code: ErrorCode::InvalidMessage,
                ..
            }
        ));
    }

    struct RecordingCanceller;

    #[async_trait::async_trait]
    impl JobCanceller for RecordingCanceller {
        async fn cancel_job(
            &self,
            job_id: &str,
            reason: &str,
        ) -> std::result::Result<CancelAck, (ErrorCode, String)> {
            assert_eq!(reason, DEFAULT_CANCEL_REASON);
            Ok(CancelAck {
                job_id: job_id.to_string(),
                status: CancelStatus::Requested,
            })
        }
    }

    #[tokio::test]
    async fn test_cancel_goes_through_canceller() {
        let (gateway, _bus) = setup();
        let gateway = gateway.with_canceller(Arc::new(RecordingCanceller));
        let conn = gateway.connect(gateway.authenticate(Some("t-alice")).await);

        let reply = gateway
            .handle_message(
                conn.id,
                ClientMessage::Cancel {
                    job_id: "job_1".to_string(),
                    reason: None,
                },
            )
            .await;
        assert_eq!(
            reply,
            ServerMessage::CancelAck {
                job_id: "job_1".to_string(),
                status: CancelStatus::Requested
            }
        );

        let anonymous = gateway.connect(None);
        let reply = gateway
            .handle_message(
                anonymous.id,
                ClientMessage::Cancel {
                    job_id: "job_1".to_string(),
                    reason: None,
                },
            )
            .await;
        assert!(matches!(
            reply,
            ServerMessage::Error {
                code: ErrorCode::Unauthenticated,
                ..
            }
        ));
    }
}
