// # Broker Trait
//
// Defines the retained publish/subscribe contract consumed by the publisher,
// the device agent and the liveness tracker.
//
// ## Contract
//
// The broker guarantees that a late subscriber receives the most recent
// retained message published to a topic, with no history of earlier
// messages. Any broker offering this last-value-cache contract is a valid
// implementation.
//
// ## Implementations
//
// - In-memory: [`crate::broker::MemoryBroker`]
// - MQTT: `hostcfg-broker-mqtt` crate

use async_trait::async_trait;
use std::pin::Pin;
use tokio_stream::Stream;

/// A message delivered to a subscriber
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    /// Concrete topic the message was published on
    pub topic: String,
    /// Raw payload
    pub payload: Vec<u8>,
    /// Whether this delivery came from the retained store
    pub retained: bool,
}

impl BrokerMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>, retained: bool) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            retained,
        }
    }
}

/// Stream of messages for one subscription
pub type MessageStream = Pin<Box<dyn Stream<Item = BrokerMessage> + Send + 'static>>;

/// Trait for broker implementations
///
/// Implementations must be thread-safe and usable across async tasks.
///
/// ## Rules
///
/// - `publish` is single-shot: no retry loop inside (callers retry on their
///   next tick)
/// - `publish` with `retain = true` replaces the topic's retained message
/// - `subscribe` delivers matching retained messages first, then live ones
/// - Topic filters follow MQTT wildcards: `+` for one level, `#` for the rest
#[async_trait]
pub trait ConfigBroker: Send + Sync {
    /// Publish a payload to a topic
    ///
    /// # Returns
    ///
    /// - `Ok(())`: accepted by the broker
    /// - `Err(Error::Broker)`: broker unreachable; nothing was published
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        retain: bool,
    ) -> Result<(), crate::Error>;

    /// Subscribe to a topic filter
    async fn subscribe(&self, filter: &str) -> Result<MessageStream, crate::Error>;

    /// Name of the broker (for logging)
    fn broker_name(&self) -> &'static str;
}
