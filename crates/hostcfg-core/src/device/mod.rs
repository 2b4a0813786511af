//! Device-side config subscriber
//!
//! The DeviceAgent runs on each embedded client. It is the only writer of
//! the client's [`DeviceConfigState`] and the only caller of its
//! [`ServiceLink`].
//!
//! ## State Machine
//!
//! ```text
//!                 connect ok, no config seen yet
//!  ┌──────────────┐ ─────────────────────────────▶ ┌──────────────────────┐
//!  │ Disconnected │                                │ ConnectedStaleConfig │
//!  └──────────────┘ ◀──────────── link drop ────── └──────────────────────┘
//!     ▲     │                                               │ config == active
//!     │     │ connect ok, config seen                       ▼
//!     │     └───────────────────────────────▶ ┌────────────────────────┐
//!     └── config != active (forced close) ─── │ ConnectedCurrentConfig │
//!                                             └────────────────────────┘
//! ```
//!
//! ## Event Flow
//!
//! 1. Config payload arrives (retained on subscribe, or live)
//! 2. Malformed → discard, keep prior state
//! 3. Equal to active → no-op (zero reconnect attempts)
//! 4. Different → overwrite state, persist, force-close the link, attempt
//!    reconnection immediately with the new endpoints
//! 5. Failed attempts are retried on later ticks with bounded backoff
//!
//! ## Tick Budget
//!
//! A connect attempt is polled for at most the tick budget per tick. One
//! that is still running when the budget runs out stays in flight and is
//! polled again on the next tick, so a slow handshake still completes. Only
//! a config change abandons it.

pub mod backoff;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use crate::config::DeviceAgentConfig;
use crate::error::Result;
use crate::message::{ConfigMessage, ServiceEndpoints};
use crate::traits::{ConfigStore, MessageStream, ServiceLink};
pub use backoff::Backoff;

/// Connection state of a device's service links
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    /// No service link is up
    Disconnected,
    /// Link is up, but no config message has confirmed the endpoints yet
    ConnectedStaleConfig,
    /// Link is up on endpoints confirmed by the latest config message
    ConnectedCurrentConfig,
}

/// Configuration currently applied on a device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfigState {
    /// Endpoints the service links use
    pub active: ServiceEndpoints,
    /// Digest of the last applied config message (None: compiled-in defaults)
    pub last_applied_digest: Option<u64>,
    /// When the last config message was applied
    pub last_applied_at: Option<DateTime<Utc>>,
}

impl DeviceConfigState {
    /// State at first boot
    pub fn from_defaults(active: ServiceEndpoints) -> Self {
        Self {
            active,
            last_applied_digest: None,
            last_applied_at: None,
        }
    }

    /// Host of the primary service
    pub fn active_host(&self) -> &str {
        &self.active.primary.host
    }

    /// Port of the primary service
    pub fn active_port(&self) -> u16 {
        self.active.primary.port
    }

    /// Whether `message` carries exactly the active endpoints
    pub fn matches(&self, message: &ConfigMessage) -> bool {
        &self.active == message.endpoints()
    }
}

/// Result of handing a config payload to the agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// New endpoints were applied and a reconnect was forced
    Applied {
        previous: ServiceEndpoints,
        current: ServiceEndpoints,
    },
    /// The payload matched the active config
    Unchanged,
    /// The payload was discarded; prior state kept
    Rejected { reason: String },
}

type ConnectFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// Connect attempt that outlived a tick budget
struct InFlightConnect {
    endpoints: ServiceEndpoints,
    future: ConnectFuture,
}

/// Device-side subscriber and reconnect state machine
///
/// ## Lifecycle
///
/// 1. Create with [`DeviceAgent::new()`] or [`DeviceAgent::with_store()`]
/// 2. Subscribe to the config topic on a broker
/// 3. Drive with [`DeviceAgent::run()`], or call [`DeviceAgent::handle_payload()`]
///    and [`DeviceAgent::tick()`] from the device's own loop
///
/// Reconnection never blocks longer than the configured tick budget; an
/// attempt that overruns keeps running and is resumed on the next tick.
pub struct DeviceAgent {
    link: Arc<dyn ServiceLink>,
    store: Option<Box<dyn ConfigStore>>,
    config: DeviceAgentConfig,
    state: DeviceConfigState,
    link_state: LinkState,
    config_confirmed: bool,
    backoff: Backoff,
    next_attempt_at: Option<Instant>,
    in_flight: Option<InFlightConnect>,
    connect_attempts: usize,
}

impl DeviceAgent {
    /// Create an agent that boots from compiled-in defaults
    pub fn new(link: Box<dyn ServiceLink>, config: DeviceAgentConfig) -> Result<Self> {
        config.validate()?;
        let state = DeviceConfigState::from_defaults(config.default_endpoints.clone());
        Ok(Self::with_state(link, None, config, state))
    }

    /// Create an agent that boots from persisted state when available
    ///
    /// A store that fails to load is logged and the defaults are used.
    pub async fn with_store(
        link: Box<dyn ServiceLink>,
        store: Box<dyn ConfigStore>,
        config: DeviceAgentConfig,
    ) -> Result<Self> {
        config.validate()?;
        let state = match store.load().await {
            Ok(Some(state)) => {
                info!(
                    "Device {} restored config {} / {}",
                    config.device_id, state.active.primary, state.active.secondary
                );
                state
            }
            Ok(None) => DeviceConfigState::from_defaults(config.default_endpoints.clone()),
            Err(e) => {
                warn!("Failed to load persisted config, using defaults: {}", e);
                DeviceConfigState::from_defaults(config.default_endpoints.clone())
            }
        };
        Ok(Self::with_state(link, Some(store), config, state))
    }

    fn with_state(
        link: Box<dyn ServiceLink>,
        store: Option<Box<dyn ConfigStore>>,
        config: DeviceAgentConfig,
        state: DeviceConfigState,
    ) -> Self {
        let backoff = Backoff::new(&config.reconnect);
        Self {
            link: Arc::from(link),
            store,
            config,
            state,
            link_state: LinkState::Disconnected,
            config_confirmed: false,
            backoff,
            next_attempt_at: None,
            in_flight: None,
            connect_attempts: 0,
        }
    }

    pub fn state(&self) -> &DeviceConfigState {
        &self.state
    }

    pub fn link_state(&self) -> LinkState {
        self.link_state
    }

    /// Total connect attempts started so far
    pub fn connect_attempts(&self) -> usize {
        self.connect_attempts
    }

    /// Whether a connect attempt is still running from an earlier tick
    pub fn is_connecting(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn device_id(&self) -> &str {
        &self.config.device_id
    }

    /// Handle a raw config payload from the subscription
    ///
    /// Malformed payloads are discarded and never disturb the prior state.
    pub async fn handle_payload(&mut self, payload: &[u8]) -> ApplyOutcome {
        match ConfigMessage::parse(payload) {
            Ok(message) => self.apply(&message).await,
            Err(e) => {
                warn!("Device {} discarding config message: {}", self.config.device_id, e);
                ApplyOutcome::Rejected {
                    reason: e.to_string(),
                }
            }
        }
    }

    /// Apply a parsed config message
    pub async fn apply(&mut self, message: &ConfigMessage) -> ApplyOutcome {
        if self.state.matches(message) {
            self.config_confirmed = true;
            if self.link_state == LinkState::ConnectedStaleConfig {
                self.link_state = LinkState::ConnectedCurrentConfig;
            }
            debug!(
                "Device {} already on {}, nothing to apply",
                self.config.device_id,
                message.primary()
            );
            return ApplyOutcome::Unchanged;
        }

        let current = message.endpoints().clone();
        let previous = std::mem::replace(&mut self.state.active, current.clone());
        self.state.last_applied_digest = Some(message.digest());
        self.state.last_applied_at = Some(Utc::now());
        self.config_confirmed = true;
        info!(
            "Device {} applying config {} -> {}",
            self.config.device_id, previous.primary, current.primary
        );
        self.persist().await;

        // The old endpoint is presumed gone for good: abandon any attempt
        // towards it, close, and go straight to a fresh attempt.
        if let Some(abandoned) = self.in_flight.take() {
            debug!(
                "Device {} abandoning connect to {}",
                self.config.device_id, abandoned.endpoints.primary
            );
        }
        self.link.close().await;
        self.link_state = LinkState::Disconnected;
        self.backoff.reset();
        self.next_attempt_at = None;
        self.attempt_connect().await;

        ApplyOutcome::Applied { previous, current }
    }

    /// One pass of the reconnect loop
    ///
    /// Resumes an in-flight connect attempt, notices dropped links, and
    /// starts at most one new attempt when one is due. Never blocks longer
    /// than the tick budget.
    pub async fn tick(&mut self) {
        if self.in_flight.is_some() {
            self.poll_connect().await;
            return;
        }

        if self.link_state != LinkState::Disconnected {
            if self.link.is_connected() {
                return;
            }
            warn!(
                "Device {} lost its service link to {}",
                self.config.device_id, self.state.active.primary
            );
            self.link_state = LinkState::Disconnected;
            self.next_attempt_at = None;
        }

        if let Some(due) = self.next_attempt_at
            && Instant::now() < due
        {
            return;
        }

        self.attempt_connect().await;
    }

    /// Start a connect attempt towards the active endpoints and poll it
    async fn attempt_connect(&mut self) {
        self.connect_attempts += 1;
        let endpoints = self.state.active.clone();
        let link = Arc::clone(&self.link);
        let target = endpoints.clone();
        self.in_flight = Some(InFlightConnect {
            endpoints,
            future: Box::pin(async move { link.connect(&target).await }),
        });
        self.poll_connect().await;
    }

    /// Drive the in-flight attempt for at most one tick budget
    async fn poll_connect(&mut self) {
        let Some(attempt) = self.in_flight.as_mut() else {
            return;
        };
        let budget = self.config.tick_budget();

        let result = match tokio::time::timeout(budget, attempt.future.as_mut()).await {
            Ok(result) => result,
            Err(_) => {
                debug!(
                    "Device {} still connecting to {}, resuming next tick",
                    self.config.device_id, attempt.endpoints.primary
                );
                self.link_state = LinkState::Disconnected;
                return;
            }
        };

        let Some(InFlightConnect { endpoints, .. }) = self.in_flight.take() else {
            return;
        };

        match result {
            Ok(()) => {
                self.backoff.reset();
                self.next_attempt_at = None;
                self.link_state = if self.config_confirmed {
                    LinkState::ConnectedCurrentConfig
                } else {
                    LinkState::ConnectedStaleConfig
                };
                info!(
                    "Device {} connected to {} ({:?})",
                    self.config.device_id, endpoints.primary, self.link_state
                );
            }
            Err(e) => {
                // Drop anything half-open before the next attempt
                self.link.close().await;
                let delay = self.backoff.next_delay();
                self.next_attempt_at = Some(Instant::now() + delay);
                self.link_state = LinkState::Disconnected;
                warn!(
                    "Device {} reconnect to {} failed: {} (next attempt in {:?})",
                    self.config.device_id, endpoints.primary, e, delay
                );
            }
        }
    }

    async fn persist(&mut self) {
        if let Some(store) = &self.store
            && let Err(e) = store.save(&self.state).await
        {
            warn!(
                "Device {} failed to persist config (kept in memory): {}",
                self.config.device_id, e
            );
        }
    }

    /// Run the agent until Ctrl-C
    ///
    /// # Parameters
    ///
    /// - `feed`: subscription to the config topic
    pub async fn run(&mut self, feed: MessageStream) -> Result<()> {
        self.run_internal(feed, None).await
    }

    /// Run the agent until `shutdown_rx` fires
    pub async fn run_with_shutdown(
        &mut self,
        feed: MessageStream,
        shutdown_rx: Option<oneshot::Receiver<()>>,
    ) -> Result<()> {
        self.run_internal(feed, shutdown_rx).await
    }

    async fn run_internal(
        &mut self,
        mut feed: MessageStream,
        shutdown_rx: Option<oneshot::Receiver<()>>,
    ) -> Result<()> {
        info!(
            "Device {} starting on {} (topic {})",
            self.config.device_id, self.state.active.primary, self.config.topic
        );

        let shutdown = async move {
            match shutdown_rx {
                Some(rx) => {
                    let _ = rx.await;
                }
                None => {
                    let _ = tokio::signal::ctrl_c().await;
                }
            }
        };
        tokio::pin!(shutdown);

        let mut ticker = tokio::time::interval(self.config.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut feed_open = true;

        loop {
            tokio::select! {
                message = feed.next(), if feed_open => match message {
                    Some(message) => {
                        self.handle_payload(&message.payload).await;
                    }
                    None => {
                        warn!("Device {} config subscription ended", self.config.device_id);
                        feed_open = false;
                    }
                },

                _ = ticker.tick() => self.tick().await,

                _ = &mut shutdown => {
                    info!("Device {} shutting down", self.config.device_id);
                    break;
                }
            }
        }

        self.in_flight = None;
        self.link.close().await;
        self.link_state = LinkState::Disconnected;
        Ok(())
    }
}
