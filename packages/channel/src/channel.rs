// ABOUTME: Event channel capability shared by producers (workers) and consumers (gateways)
// ABOUTME: A subscription is an ordered stream of the events published on one topic

use crate::error::Result;
use async_trait::async_trait;
use futures::Stream;
use runhub_core::{Event, Topic};
use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Topic-keyed publish/subscribe medium.
///
/// Delivery is at-least-once while the channel is reachable, in publish order
/// per topic. There is no replay: a subscriber only sees events published after
/// it subscribed.
#[async_trait]
pub trait EventChannel: Send + Sync {
    async fn publish(&self, event: &Event) -> Result<()>;

    async fn subscribe(&self, topic: &Topic) -> Result<Subscription>;

    /// Release interest in a topic. Call after dropping the subscription stream.
    async fn unsubscribe(&self, topic: &Topic) -> Result<()>;

    /// Whether events are currently only delivered in-process
    fn is_degraded(&self) -> bool {
        false
    }
}

/// Stream of events for a single topic
pub struct Subscription {
    topic: Topic,
    events: Pin<Box<dyn Stream<Item = Event> + Send>>,
}

impl Subscription {
    pub fn new(topic: Topic, events: impl Stream<Item = Event> + Send + 'static) -> Self {
        Self {
            topic,
            events: Box::pin(events),
        }
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .finish_non_exhaustive()
    }
}

impl Stream for Subscription {
    type Item = Event;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.events.as_mut().poll_next(cx)
    }
}
