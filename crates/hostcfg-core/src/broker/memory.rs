// # Memory Broker
//
// In-process implementation of ConfigBroker with retained-message
// semantics.
//
// ## Purpose
//
// Lets the publisher, device agents and the liveness tracker run against
// each other without an external broker: tests, demos, and single-process
// deployments.
//
// ## Semantics
//
// - One retained message per topic; a retained publish overwrites it
// - A retained publish with an empty payload clears the topic
// - New subscribers receive matching retained messages first, then live ones
// - No history: earlier values are gone once overwritten

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, trace};

use super::topic_matches;
use crate::Error;
use crate::traits::broker::{BrokerMessage, ConfigBroker, MessageStream};

/// In-memory broker with a last-value cache per topic
///
/// Clones share the same broker.
///
/// # Example
///
/// ```rust,no_run
/// use hostcfg_core::{ConfigBroker, MemoryBroker};
/// use tokio_stream::StreamExt;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let broker = MemoryBroker::new();
///     broker.publish("hostcfg/ward-a/config", b"{}".to_vec(), true).await?;
///
///     // A late subscriber still gets the retained value
///     let mut stream = broker.subscribe("hostcfg/ward-a/config").await?;
///     let message = stream.next().await.unwrap();
///     assert!(message.retained);
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone)]
pub struct MemoryBroker {
    inner: Arc<Mutex<BrokerState>>,
}

#[derive(Debug)]
struct BrokerState {
    retained: HashMap<String, Vec<u8>>,
    subscribers: Vec<Subscriber>,
    reachable: bool,
    publish_count: usize,
}

#[derive(Debug)]
struct Subscriber {
    filter: String,
    tx: mpsc::UnboundedSender<BrokerMessage>,
}

impl MemoryBroker {
    /// Create an empty, reachable broker
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(BrokerState {
                retained: HashMap::new(),
                subscribers: Vec::new(),
                reachable: true,
                publish_count: 0,
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the broker refuse (or accept again) publishes and subscriptions
    pub fn set_reachable(&self, reachable: bool) {
        self.state().reachable = reachable;
    }

    /// Retained payload currently held for `topic`
    pub fn retained(&self, topic: &str) -> Option<Vec<u8>> {
        self.state().retained.get(topic).cloned()
    }

    /// Number of accepted publishes since creation
    pub fn publish_count(&self) -> usize {
        self.state().publish_count
    }

    /// Number of live subscriptions
    pub fn subscriber_count(&self) -> usize {
        let mut state = self.state();
        state.subscribers.retain(|s| !s.tx.is_closed());
        state.subscribers.len()
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConfigBroker for MemoryBroker {
    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<(), Error> {
        let mut state = self.state();
        if !state.reachable {
            return Err(Error::broker("memory broker is unreachable"));
        }

        state.publish_count += 1;
        if retain {
            if payload.is_empty() {
                state.retained.remove(topic);
                debug!("Cleared retained message on {}", topic);
            } else {
                state.retained.insert(topic.to_string(), payload.clone());
            }
        }

        // Live deliveries carry retained = false, like MQTT
        state.subscribers.retain(|subscriber| {
            if !topic_matches(&subscriber.filter, topic) {
                return !subscriber.tx.is_closed();
            }
            subscriber
                .tx
                .send(BrokerMessage::new(topic, payload.clone(), false))
                .is_ok()
        });

        trace!("Published {} bytes to {} (retain={})", payload.len(), topic, retain);
        Ok(())
    }

    async fn subscribe(&self, filter: &str) -> Result<MessageStream, Error> {
        let mut state = self.state();
        if !state.reachable {
            return Err(Error::broker("memory broker is unreachable"));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        for (topic, payload) in &state.retained {
            if topic_matches(filter, topic) {
                // Receiver is alive: it is still in scope
                let _ = tx.send(BrokerMessage::new(topic.clone(), payload.clone(), true));
            }
        }
        state.subscribers.push(Subscriber {
            filter: filter.to_string(),
            tx,
        });

        debug!("New subscription on {}", filter);
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    fn broker_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt;

    #[tokio::test]
    async fn late_subscriber_gets_latest_retained_only() {
        let broker = MemoryBroker::new();
        broker.publish("t/config", b"first".to_vec(), true).await.unwrap();
        broker.publish("t/config", b"second".to_vec(), true).await.unwrap();

        let mut stream = broker.subscribe("t/config").await.unwrap();
        let message = stream.next().await.unwrap();

        assert_eq!(message.payload, b"second");
        assert!(message.retained);
        assert_eq!(broker.retained("t/config"), Some(b"second".to_vec()));
    }

    #[tokio::test]
    async fn live_messages_follow_retained() {
        let broker = MemoryBroker::new();
        let mut stream = broker.subscribe("t/+/status").await.unwrap();

        broker.publish("t/a/status", b"online".to_vec(), false).await.unwrap();
        broker.publish("t/other", b"ignored".to_vec(), false).await.unwrap();

        let message = stream.next().await.unwrap();
        assert_eq!(message.topic, "t/a/status");
        assert!(!message.retained);
        assert!(broker.retained("t/a/status").is_none());
    }

    #[tokio::test]
    async fn empty_retained_payload_clears_topic() {
        let broker = MemoryBroker::new();
        broker.publish("t/config", b"value".to_vec(), true).await.unwrap();
        broker.publish("t/config", Vec::new(), true).await.unwrap();

        assert!(broker.retained("t/config").is_none());
    }

    #[tokio::test]
    async fn unreachable_broker_rejects_publish() {
        let broker = MemoryBroker::new();
        broker.set_reachable(false);

        let err = broker.publish("t/config", b"x".to_vec(), true).await.unwrap_err();
        assert!(matches!(err, Error::Broker(_)));
        assert_eq!(broker.publish_count(), 0);
        assert!(broker.retained("t/config").is_none());
    }

    #[tokio::test]
    async fn dropped_subscribers_are_pruned() {
        let broker = MemoryBroker::new();
        let stream = broker.subscribe("t/#").await.unwrap();
        assert_eq!(broker.subscriber_count(), 1);

        drop(stream);
        broker.publish("t/x", b"x".to_vec(), false).await.unwrap();
        assert_eq!(broker.subscriber_count(), 0);
    }
}
