// ABOUTME: Per-attempt event publisher owning the topic's sequence numbers
// ABOUTME: Channel failures are logged and never change the job outcome

use runhub_channel::EventChannel;
use runhub_core::{ErrorCode, Event, EventKind, EventSequencer, Topic};
use std::sync::Arc;
use tracing::{debug, warn};

/// The single producer of a job's topic for one attempt
pub struct JobEventPublisher {
    channel: Arc<dyn EventChannel>,
    sequencer: EventSequencer,
}

impl JobEventPublisher {
    pub fn new(channel: Arc<dyn EventChannel>, topic: Topic, attempt: u32) -> Self {
        Self {
            channel,
            sequencer: EventSequencer::for_attempt(topic, attempt),
        }
    }

    /// Publisher for a job's execution topic
    pub fn for_job(channel: Arc<dyn EventChannel>, job_id: &str, attempt: u32) -> Self {
        Self::new(channel, Topic::execution(job_id), attempt)
    }

    pub fn topic(&self) -> &Topic {
        self.sequencer.topic()
    }

    pub async fn publish(&mut self, kind: EventKind) -> Event {
        let event = self.sequencer.next(kind);
        match self.channel.publish(&event).await {
            Ok(()) => debug!(
                topic = %event.topic,
                sequence = event.sequence,
                kind = event.kind.name(),
                "Published event"
            ),
            Err(e) => warn!(
                code = %ErrorCode::ChannelUnavailable,
                topic = %event.topic,
                sequence = event.sequence,
                "Failed to publish event: {}",
                e
            ),
        }
        event
    }

    pub async fn progress(&mut self, percent: u8) -> Event {
        self.publish(EventKind::Progress { percent }).await
    }

    pub async fn error(&mut self, code: ErrorCode, message: impl Into<String>) -> Event {
        self.publish(EventKind::Error {
            code,
            message: message.into(),
        })
        .await
    }
}
