// ABOUTME: Event channel bridged over the ZeroMQ hub for multi-process deployments
// ABOUTME: Publishes through PUSH, receives through SUB, and falls back to in-process delivery when the hub is gone

use crate::channel::{EventChannel, Subscription};
use crate::error::{ChannelError, Result};
use crate::hub::FRAME_COUNT;
use crate::local::LocalEventBus;
use async_trait::async_trait;
use runhub_config::ChannelConfig;
use runhub_core::{ErrorCode, Event, Topic};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use zeromq::{PushSocket, Socket, SocketRecv, SocketSend, SubSocket, ZmqMessage};

/// Payload of the frame pushed through the hub to confirm a subscription is live.
/// Never valid JSON, so it cannot collide with an event.
const MARKER: &[u8] = b"\0runhub:subscribed";

/// Pause between marker pushes while the hub learns about a new subscription
const MARKER_RETRY: Duration = Duration::from_millis(25);

enum SubscriberCommand {
    Subscribe {
        topic: String,
        /// Fires once the SUB socket carries the filter
        registered: oneshot::Sender<()>,
        /// Fires on the first frame received for the topic
        live: oneshot::Sender<()>,
    },
    Unsubscribe(String),
}

/// Subscriptions waiting for their first relayed frame
#[derive(Default)]
struct Pending {
    registered: Vec<oneshot::Sender<()>>,
    live: HashMap<String, oneshot::Sender<()>>,
}

struct Publisher {
    socket: Option<PushSocket>,
    last_failure: Option<Instant>,
}

/// Channel connected to an [`EventHub`](crate::EventHub).
///
/// Everything received from the hub is fanned out through an in-process bus,
/// which is also where publishes land while the hub is unreachable. The
/// fallback only reaches subscribers in this process.
pub struct ZmqChannel {
    config: ChannelConfig,
    publisher: tokio::sync::Mutex<Publisher>,
    inbound: Arc<LocalEventBus>,
    commands: mpsc::UnboundedSender<SubscriberCommand>,
    refcounts: Mutex<HashMap<Topic, usize>>,
    degraded: AtomicBool,
    receiver: JoinHandle<()>,
}

impl ZmqChannel {
    /// Start the bridge. Never fails: an unreachable hub only degrades delivery.
    pub fn connect(config: ChannelConfig) -> Self {
        let inbound = Arc::new(LocalEventBus::new(config.topic_capacity));
        let (commands, command_rx) = mpsc::unbounded_channel();

        let receiver = tokio::spawn(run_subscriber(
            config.hub_egress.clone(),
            command_rx,
            inbound.clone(),
            config.reconnect_interval,
        ));

        Self {
            config,
            publisher: tokio::sync::Mutex::new(Publisher {
                socket: None,
                last_failure: None,
            }),
            inbound,
            commands,
            refcounts: Mutex::new(HashMap::new()),
            degraded: AtomicBool::new(false),
            receiver,
        }
    }

    async fn push(&self, topic: &Topic, payload: Vec<u8>) -> Result<()> {
        let mut publisher = self.publisher.lock().await;

        if publisher.socket.is_none() {
            if let Some(failed_at) = publisher.last_failure {
                if failed_at.elapsed() < self.config.reconnect_interval {
                    return Err(ChannelError::Unavailable(
                        "hub unreachable, waiting to reconnect".to_string(),
                    ));
                }
            }

            let mut socket = PushSocket::new();
            let connected =
                tokio::time::timeout(self.config.publish_timeout, socket.connect(&self.config.hub_ingress))
                    .await;
            match connected {
                Ok(Ok(())) => {
                    debug!("Connected to hub ingress {}", self.config.hub_ingress);
                    publisher.socket = Some(socket);
                }
                Ok(Err(e)) => {
                    publisher.last_failure = Some(Instant::now());
                    return Err(e.into());
                }
                Err(_) => {
                    publisher.last_failure = Some(Instant::now());
                    return Err(ChannelError::Unavailable(format!(
                        "connect to {} timed out",
                        self.config.hub_ingress
                    )));
                }
            }
        }

        let mut message = ZmqMessage::from(topic.as_str().as_bytes().to_vec());
        message.push_back(payload.into());

        let Some(socket) = publisher.socket.as_mut() else {
            return Err(ChannelError::Unavailable("no hub connection".to_string()));
        };
        let sent = tokio::time::timeout(self.config.publish_timeout, socket.send(message)).await;

        let failure = match sent {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => ChannelError::from(e),
            Err(_) => ChannelError::Unavailable(format!(
                "publish timed out after {:?}",
                self.config.publish_timeout
            )),
        };

        // Reconnect on the next attempt
        publisher.socket = None;
        publisher.last_failure = Some(Instant::now());
        Err(failure)
    }

    /// Wait until the hub relays `topic` to this node.
    ///
    /// PUB sockets learn subscriptions asynchronously, so a marker is pushed
    /// through the hub until one comes back. While the hub is unreachable the
    /// wait is abandoned; delivery is then in-process only anyway.
    async fn await_live(
        &self,
        topic: &Topic,
        registered: oneshot::Receiver<()>,
        live: oneshot::Receiver<()>,
    ) {
        let confirmed = tokio::time::timeout(
            self.config.subscribe_timeout,
            self.confirm_live(topic, registered, live),
        )
        .await;

        match confirmed {
            Ok(Ok(())) => debug!(topic = %topic, "Hub relaying topic"),
            Ok(Err(e)) => debug!(topic = %topic, "Subscription not confirmed: {}", e),
            Err(_) => warn!(
                topic = %topic,
                code = %ErrorCode::ChannelUnavailable,
                "Hub did not confirm subscription within {:?}",
                self.config.subscribe_timeout
            ),
        }
    }

    async fn confirm_live(
        &self,
        topic: &Topic,
        registered: oneshot::Receiver<()>,
        mut live: oneshot::Receiver<()>,
    ) -> Result<()> {
        registered
            .await
            .map_err(|_| ChannelError::Unavailable("hub egress unreachable".to_string()))?;

        loop {
            self.push(topic, MARKER.to_vec()).await?;
            match tokio::time::timeout(MARKER_RETRY, &mut live).await {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(_)) => {
                    return Err(ChannelError::Unavailable(
                        "subscriber task dropped the subscription".to_string(),
                    ))
                }
                Err(_) => continue,
            }
        }
    }

    /// Deliver to this process only
    fn fall_back(&self, event: &Event, error: &ChannelError) {
        if !self.degraded.swap(true, Ordering::SeqCst) {
            warn!(
                code = %ErrorCode::ChannelUnavailable,
                error = %error,
                "Event hub unreachable, delivering in-process only"
            );
        } else {
            debug!(topic = %event.topic, error = %error, "Hub still unreachable");
        }
        self.inbound.send(event);
    }
}

impl Drop for ZmqChannel {
    fn drop(&mut self) {
        self.receiver.abort();
    }
}

#[async_trait]
impl EventChannel for ZmqChannel {
    async fn publish(&self, event: &Event) -> Result<()> {
        let payload = serde_json::to_vec(event)?;

        match self.push(&event.topic, payload).await {
            Ok(()) => {
                if self.degraded.swap(false, Ordering::SeqCst) {
                    info!("Event hub reachable again");
                }
            }
            Err(e) => self.fall_back(event, &e),
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &Topic) -> Result<Subscription> {
        // Listen locally before asking the hub so nothing relayed is missed
        let subscription = self.inbound.subscribe_local(topic);

        let first = {
            let mut refcounts = self
                .refcounts
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let count = refcounts.entry(topic.clone()).or_insert(0);
            *count += 1;
            *count == 1
        };

        if first {
            let (registered, registered_rx) = oneshot::channel();
            let (live, live_rx) = oneshot::channel();
            self.commands
                .send(SubscriberCommand::Subscribe {
                    topic: topic.to_string(),
                    registered,
                    live,
                })
                .map_err(|_| ChannelError::Unavailable("subscriber task stopped".to_string()))?;
            self.await_live(topic, registered_rx, live_rx).await;
        }
        Ok(subscription)
    }

    async fn unsubscribe(&self, topic: &Topic) -> Result<()> {
        let last = {
            let mut refcounts = self
                .refcounts
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            match refcounts.get_mut(topic) {
                Some(count) if *count > 1 => {
                    *count -= 1;
                    false
                }
                Some(_) => {
                    refcounts.remove(topic);
                    true
                }
                None => false,
            }
        };

        if last {
            self.inbound.prune(topic);
            self.commands
                .send(SubscriberCommand::Unsubscribe(topic.to_string()))
                .map_err(|_| ChannelError::Unavailable("subscriber task stopped".to_string()))?;
        }
        Ok(())
    }

    fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }
}

async fn connect_subscriber(
    endpoint: &str,
    topics: &HashSet<String>,
    timeout: Duration,
) -> Result<SubSocket> {
    let mut socket = SubSocket::new();
    tokio::time::timeout(timeout, socket.connect(endpoint))
        .await
        .map_err(|_| ChannelError::Unavailable(format!("connect to {} timed out", endpoint)))??;
    for topic in topics {
        socket.subscribe(topic).await?;
    }
    Ok(socket)
}

/// Apply commands queued while disconnected. Returns false once the channel is gone.
fn drain_commands(
    commands: &mut mpsc::UnboundedReceiver<SubscriberCommand>,
    topics: &mut HashSet<String>,
    pending: &mut Pending,
) -> bool {
    loop {
        match commands.try_recv() {
            Ok(SubscriberCommand::Subscribe {
                topic,
                registered,
                live,
            }) => {
                pending.registered.push(registered);
                pending.live.insert(topic.clone(), live);
                topics.insert(topic);
            }
            Ok(SubscriberCommand::Unsubscribe(topic)) => {
                topics.remove(&topic);
            }
            Err(mpsc::error::TryRecvError::Empty) => return true,
            Err(mpsc::error::TryRecvError::Disconnected) => return false,
        }
    }
}

async fn run_subscriber(
    endpoint: String,
    mut commands: mpsc::UnboundedReceiver<SubscriberCommand>,
    inbound: Arc<LocalEventBus>,
    reconnect_interval: Duration,
) {
    let mut topics: HashSet<String> = HashSet::new();
    let mut pending = Pending::default();

    loop {
        if !drain_commands(&mut commands, &mut topics, &mut pending) {
            return;
        }
        pending.live.retain(|_, live| !live.is_closed());

        let mut socket = match connect_subscriber(&endpoint, &topics, reconnect_interval).await {
            Ok(socket) => {
                debug!("Subscribed to hub egress {}", endpoint);
                for registered in pending.registered.drain(..) {
                    let _ = registered.send(());
                }
                socket
            }
            Err(e) => {
                debug!("Hub egress {} unavailable: {}", endpoint, e);
                // Waiting subscribers give up; topics resubscribe on reconnect
                pending.registered.clear();
                tokio::time::sleep(reconnect_interval).await;
                continue;
            }
        };

        loop {
            tokio::select! {
                command = commands.recv() => {
                    let result = match command {
                        Some(SubscriberCommand::Subscribe { topic, registered, live }) => {
                            pending.live.insert(topic.clone(), live);
                            let result = if topics.insert(topic.clone()) {
                                socket.subscribe(&topic).await
                            } else {
                                Ok(())
                            };
                            if result.is_ok() {
                                let _ = registered.send(());
                            }
                            result
                        }
                        Some(SubscriberCommand::Unsubscribe(topic)) => {
                            pending.live.remove(&topic);
                            if topics.remove(&topic) {
                                socket.unsubscribe(&topic).await
                            } else {
                                Ok(())
                            }
                        }
                        None => return,
                    };
                    if let Err(e) = result {
                        warn!("Hub subscription update failed: {}", e);
                        break;
                    }
                }
                message = socket.recv() => {
                    match message {
                        Ok(message) => dispatch(message, &topics, &mut pending.live, &inbound),
                        Err(e) => {
                            warn!(code = %ErrorCode::ChannelUnavailable, "Hub connection lost: {}", e);
                            break;
                        }
                    }
                }
            }
        }

        tokio::time::sleep(reconnect_interval).await;
    }
}

/// Hand a relayed message to local subscribers of exactly its topic.
/// ZeroMQ filters by prefix, so `execution:job_1` also receives `execution:job_10`.
fn dispatch(
    message: ZmqMessage,
    topics: &HashSet<String>,
    live: &mut HashMap<String, oneshot::Sender<()>>,
    inbound: &LocalEventBus,
) {
    let frames = message.into_vec();
    if frames.len() != FRAME_COUNT {
        warn!("Ignoring message with {} frames", frames.len());
        return;
    }

    let topic = String::from_utf8_lossy(&frames[0]);
    if !topics.contains(&*topic) {
        return;
    }

    // Any frame on the topic proves the hub relays it
    if let Some(waiting) = live.remove(&*topic) {
        let _ = waiting.send(());
    }
    if &frames[1][..] == MARKER {
        return;
    }

    match serde_json::from_slice::<Event>(&frames[1]) {
        Ok(event) if event.topic.as_str() == topic => {
            inbound.send(&event);
        }
        Ok(event) => warn!(
            "Topic frame {} does not match event topic {}",
            topic, event.topic
        ),
        Err(e) => warn!("Ignoring malformed event on {}: {}", topic, e),
    }
}
