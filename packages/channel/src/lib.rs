// ABOUTME: Topic-keyed event channel decoupling workers from gateways
// ABOUTME: In-process bus for single-node runs, ZeroMQ hub and bridge for multi-process deployments

mod channel;
mod error;
mod hub;
mod local;
mod zmq;

pub use channel::{EventChannel, Subscription};
pub use error::{ChannelError, Result};
pub use hub::EventHub;
pub use local::{LocalEventBus, DEFAULT_TOPIC_CAPACITY};
pub use zmq::ZmqChannel;

use runhub_config::{ChannelConfig, ChannelMode};
use std::sync::Arc;

/// Build the channel selected by configuration
pub fn build_channel(config: &ChannelConfig) -> Arc<dyn EventChannel> {
    match config.mode {
        ChannelMode::Local => Arc::new(LocalEventBus::new(config.topic_capacity)),
        ChannelMode::Zmq => Arc::new(ZmqChannel::connect(config.clone())),
    }
}
