// # MQTT Broker
//
// ConfigBroker over MQTT 3.1.1 (rumqttc).
//
// ## Architecture
//
// ```text
// ┌────────────┐  publish/subscribe  ┌─────────────┐   poll()   ┌───────────┐
// │ MqttBroker │ ──────────────────▶ │ AsyncClient │ ◀────────▶ │ EventLoop │ ◀──▶ broker
// └────────────┘                     └─────────────┘            └───────────┘
//       ▲                                                             │
//       └──────────── BrokerMessage (per-subscription channel) ───────┘
// ```
//
// The event loop runs on its own task. It reconnects by itself; after every
// ConnAck the remembered subscriptions are issued again, because a clean
// session forgets them. Retained messages arrive on (re)subscribe, which is
// exactly what lets an offline device converge.
//
// ## Birth and Last Will
//
// A configured birth message is published retained after the resubscriptions
// on every ConnAck. A broker that fired the last will on a dropped link
// therefore sees the birth again as soon as the client is back.
//
// ## Publishing
//
// `publish` fails fast with `Error::Broker` while the connection is down so
// the publisher retries on its next tick instead of queueing stale config.

use async_trait::async_trait;
use hostcfg_core::traits::{BrokerMessage, ConfigBroker, MessageStream};
use hostcfg_core::{Error, Result, topic_matches};
use rumqttc::{AsyncClient, Event, EventLoop, LastWill, MqttOptions, Packet, QoS};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, trace, warn};

/// Pause between reconnect attempts of the event loop
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Retained message sent on the client's behalf
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetainedMessage {
    pub topic: String,
    pub payload: String,
}

impl RetainedMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }

    fn validate(&self, role: &str) -> Result<()> {
        if self.topic.is_empty() {
            return Err(Error::config(format!("MQTT {} topic cannot be empty", role)));
        }
        if self.topic.contains(['+', '#']) {
            return Err(Error::config(format!(
                "MQTT {} topic {} cannot contain wildcards",
                role, self.topic
            )));
        }
        Ok(())
    }
}

/// MQTT connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    pub client_id: String,

    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    /// Published retained by the broker if this client vanishes
    #[serde(default)]
    pub last_will: Option<RetainedMessage>,

    /// Published retained by this client after every ConnAck
    #[serde(default)]
    pub birth: Option<RetainedMessage>,

    /// Capacity of the client request queue
    #[serde(default = "default_request_capacity")]
    pub request_capacity: usize,
}

impl MqttConfig {
    pub fn new(host: impl Into<String>, port: u16, client_id: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            client_id: client_id.into(),
            keep_alive_secs: default_keep_alive_secs(),
            username: None,
            password: None,
            last_will: None,
            birth: None,
            request_capacity: default_request_capacity(),
        }
    }

    pub fn with_last_will(mut self, topic: impl Into<String>, payload: impl Into<String>) -> Self {
        self.last_will = Some(RetainedMessage::new(topic, payload));
        self
    }

    pub fn with_birth(mut self, topic: impl Into<String>, payload: impl Into<String>) -> Self {
        self.birth = Some(RetainedMessage::new(topic, payload));
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(Error::config("MQTT host cannot be empty"));
        }
        if self.port == 0 {
            return Err(Error::config("MQTT port must be > 0"));
        }
        if self.client_id.is_empty() {
            return Err(Error::config("MQTT client id cannot be empty"));
        }
        if self.keep_alive_secs == 0 {
            return Err(Error::config("MQTT keep-alive must be >= 1 second"));
        }
        if self.request_capacity == 0 {
            return Err(Error::config("MQTT request capacity must be > 0"));
        }
        if self.password.is_some() && self.username.is_none() {
            return Err(Error::config("MQTT password given without a username"));
        }
        if let Some(will) = &self.last_will {
            will.validate("last will")?;
        }
        if let Some(birth) = &self.birth {
            birth.validate("birth")?;
        }
        Ok(())
    }

    fn to_options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(self.client_id.clone(), self.host.clone(), self.port);
        options.set_keep_alive(Duration::from_secs(self.keep_alive_secs));
        options.set_clean_session(true);

        if let Some(username) = &self.username {
            options.set_credentials(username.clone(), self.password.clone().unwrap_or_default());
        }

        if let Some(will) = &self.last_will {
            options.set_last_will(LastWill::new(
                will.topic.clone(),
                will.payload.clone().into_bytes(),
                QoS::AtLeastOnce,
                true,
            ));
        }

        options
    }
}

fn default_port() -> u16 {
    1883
}

fn default_keep_alive_secs() -> u64 {
    5
}

fn default_request_capacity() -> usize {
    64
}

/// Request issued on the event loop task after a ConnAck
#[derive(Debug, Clone, PartialEq, Eq)]
enum SessionRequest {
    Subscribe(String),
    Publish(RetainedMessage),
}

/// Requests that restore a fresh session: every filter, then the birth
fn session_requests(filters: Vec<String>, birth: Option<&RetainedMessage>) -> Vec<SessionRequest> {
    filters
        .into_iter()
        .map(SessionRequest::Subscribe)
        .chain(birth.cloned().map(SessionRequest::Publish))
        .collect()
}

struct Subscription {
    filter: String,
    tx: mpsc::UnboundedSender<BrokerMessage>,
}

#[derive(Default)]
struct Shared {
    connected: AtomicBool,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl Shared {
    fn filters(&self) -> Vec<String> {
        let mut subscriptions = self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subscriptions.retain(|s| !s.tx.is_closed());

        let mut filters: Vec<String> = subscriptions.iter().map(|s| s.filter.clone()).collect();
        filters.sort();
        filters.dedup();
        filters
    }

    fn dispatch(&self, message: BrokerMessage) {
        let mut subscriptions = self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subscriptions.retain(|subscription| {
            if !topic_matches(&subscription.filter, &message.topic) {
                return !subscription.tx.is_closed();
            }
            subscription.tx.send(message.clone()).is_ok()
        });
    }
}

/// MQTT-backed [`ConfigBroker`]
///
/// Must be created inside a tokio runtime. Dropping it stops the event loop.
pub struct MqttBroker {
    client: AsyncClient,
    shared: Arc<Shared>,
    driver: JoinHandle<()>,
    address: String,
}

impl MqttBroker {
    /// Start the client; the connection is established in the background
    pub fn connect(config: MqttConfig) -> Result<Self> {
        config.validate()?;

        let (client, eventloop) = AsyncClient::new(config.to_options(), config.request_capacity);
        let shared = Arc::new(Shared::default());
        let address = format!("{}:{}", config.host, config.port);

        info!("Connecting to MQTT broker at {} as {}", address, config.client_id);
        let driver = tokio::spawn(drive(
            eventloop,
            client.clone(),
            Arc::clone(&shared),
            config.birth.clone(),
            address.clone(),
        ));

        Ok(Self {
            client,
            shared,
            driver,
            address,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Wait until connected, up to `timeout`
    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while !self.is_connected() {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        true
    }

    /// Disconnect cleanly and stop the event loop
    pub async fn shutdown(&self) {
        if self.is_connected()
            && let Err(e) = self.client.disconnect().await
        {
            debug!("MQTT disconnect: {}", e);
        }
        self.shared.connected.store(false, Ordering::SeqCst);
        self.driver.abort();
        info!("MQTT client for {} stopped", self.address);
    }
}

impl Drop for MqttBroker {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

async fn drive(
    mut eventloop: EventLoop,
    client: AsyncClient,
    shared: Arc<Shared>,
    birth: Option<RetainedMessage>,
    address: String,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                shared.connected.store(true, Ordering::SeqCst);
                info!("MQTT connected to {} ({:?})", address, ack.code);

                // Issued from the event loop task: never wait on the request queue here
                for request in session_requests(shared.filters(), birth.as_ref()) {
                    issue(&client, request);
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                trace!(
                    "MQTT message on {} ({} bytes, retain={})",
                    publish.topic,
                    publish.payload.len(),
                    publish.retain
                );
                shared.dispatch(BrokerMessage::new(
                    publish.topic.clone(),
                    publish.payload.to_vec(),
                    publish.retain,
                ));
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                shared.connected.store(false, Ordering::SeqCst);
                warn!("MQTT broker {} closed the session", address);
            }
            Ok(_) => {}
            Err(e) => {
                if shared.connected.swap(false, Ordering::SeqCst) {
                    warn!("MQTT connection to {} lost: {}", address, e);
                } else {
                    debug!("MQTT connection to {} failed: {}", address, e);
                }
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

fn issue(client: &AsyncClient, request: SessionRequest) {
    match request {
        SessionRequest::Subscribe(filter) => {
            if let Err(e) = client.try_subscribe(filter.clone(), QoS::AtLeastOnce) {
                warn!("Failed to resubscribe to {}: {}", filter, e);
            }
        }
        SessionRequest::Publish(message) => {
            let payload = message.payload.into_bytes();
            match client.try_publish(message.topic.clone(), QoS::AtLeastOnce, true, payload) {
                Ok(()) => debug!("Queued birth message on {}", message.topic),
                Err(e) => warn!("Failed to publish birth message on {}: {}", message.topic, e),
            }
        }
    }
}

#[async_trait]
impl ConfigBroker for MqttBroker {
    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::broker(format!("not connected to {}", self.address)));
        }

        self.client
            .publish(topic, QoS::AtLeastOnce, retain, payload)
            .await
            .map_err(|e| Error::broker(format!("publish to {}: {}", topic, e)))?;

        debug!("Queued publish on {} (retain={})", topic, retain);
        Ok(())
    }

    async fn subscribe(&self, filter: &str) -> Result<MessageStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Subscription {
                filter: filter.to_string(),
                tx,
            });

        // Otherwise issued on the next ConnAck
        if self.is_connected() {
            self.client
                .subscribe(filter, QoS::AtLeastOnce)
                .await
                .map_err(|e| Error::broker(format!("subscribe to {}: {}", filter, e)))?;
        }

        debug!("Subscribed to {}", filter);
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    fn broker_name(&self) -> &'static str {
        "mqtt"
    }
}
