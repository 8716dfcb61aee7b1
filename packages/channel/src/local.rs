// ABOUTME: In-process event bus with one broadcast channel per topic
// ABOUTME: Used alone in single-process deployments and as the local fan-out behind the ZeroMQ bridge

use crate::channel::{EventChannel, Subscription};
use crate::error::Result;
use async_trait::async_trait;
use runhub_core::{Event, Topic};
use std::collections::HashMap;
use std::sync::RwLock;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::{debug, warn};

pub const DEFAULT_TOPIC_CAPACITY: usize = 1024;

/// Per-topic broadcast channels.
///
/// Each topic has its own ordered channel, so a busy topic never reorders or
/// delays another. Channels are created on first subscribe and pruned once
/// their last receiver is gone.
pub struct LocalEventBus {
    topics: RwLock<HashMap<Topic, broadcast::Sender<Event>>>,
    capacity: usize,
}

impl Default for LocalEventBus {
    fn default() -> Self {
        Self::new(DEFAULT_TOPIC_CAPACITY)
    }
}

impl LocalEventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Deliver to current local subscribers. Returns how many received it.
    pub fn send(&self, event: &Event) -> usize {
        let sender = {
            let topics = self
                .topics
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            topics.get(&event.topic).cloned()
        };

        match sender {
            Some(sender) => match sender.send(event.clone()) {
                Ok(receivers) => receivers,
                Err(_) => {
                    self.prune(&event.topic);
                    0
                }
            },
            None => 0,
        }
    }

    /// Subscribe without going through the async trait
    pub fn subscribe_local(&self, topic: &Topic) -> Subscription {
        let receiver = {
            let mut topics = self
                .topics
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            topics
                .entry(topic.clone())
                .or_insert_with(|| broadcast::channel(self.capacity).0)
                .subscribe()
        };

        let name = topic.clone();
        let events = BroadcastStream::new(receiver).filter_map(move |result| match result {
            Ok(event) => Some(event),
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!(topic = %name, skipped = skipped, "Local subscriber lagged, events skipped");
                None
            }
        });
        Subscription::new(topic.clone(), events)
    }

    /// Drop the topic's channel if nobody is listening
    pub fn prune(&self, topic: &Topic) {
        let mut topics = self
            .topics
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(sender) = topics.get(topic) {
            if sender.receiver_count() == 0 {
                topics.remove(topic);
                debug!(topic = %topic, "Pruned idle topic");
            }
        }
    }

    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        self.topics
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(topic)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }

    pub fn topic_count(&self) -> usize {
        self.topics
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

#[async_trait]
impl EventChannel for LocalEventBus {
    async fn publish(&self, event: &Event) -> Result<()> {
        self.send(event);
        Ok(())
    }

    async fn subscribe(&self, topic: &Topic) -> Result<Subscription> {
        Ok(self.subscribe_local(topic))
    }

    async fn unsubscribe(&self, topic: &Topic) -> Result<()> {
        self.prune(topic);
        Ok(())
    }
}
