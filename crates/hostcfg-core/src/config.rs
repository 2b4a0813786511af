//! Configuration types for hostcfg
//!
//! This module defines all configuration structures used throughout the crate.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::message::ServiceEndpoints;

/// Topic prefix shared by config and status topics
pub const TOPIC_PREFIX: &str = "hostcfg";

/// Retained config topic for a device group
pub fn config_topic(group: &str) -> String {
    format!("{}/{}/config", TOPIC_PREFIX, group)
}

/// Liveness topic for a single device
pub fn status_topic(device_id: &str) -> String {
    format!("{}/{}/status", TOPIC_PREFIX, device_id)
}

/// Filter matching every device's liveness topic
pub fn status_filter() -> String {
    format!("{}/+/status", TOPIC_PREFIX)
}

fn validate_topic(topic: &str, what: &str) -> Result<(), crate::Error> {
    if topic.is_empty() {
        return Err(crate::Error::config(format!("{} cannot be empty", what)));
    }
    if topic.contains('+') || topic.contains('#') {
        return Err(crate::Error::config(format!(
            "{} cannot contain wildcards: {}",
            what, topic
        )));
    }
    Ok(())
}

/// Host-side publisher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublisherConfig {
    /// Retained topic the config message is published to
    pub topic: String,

    /// Port of the primary service (message broker)
    #[serde(default = "default_primary_service_port")]
    pub primary_service_port: u16,

    /// Port of the secondary service (backend)
    #[serde(default = "default_secondary_service_port")]
    pub secondary_service_port: u16,

    /// Interval between address samples (in seconds)
    #[serde(default = "default_sample_interval_secs")]
    pub sample_interval_secs: u64,

    /// Upper bound on a single publish (in seconds)
    ///
    /// A publish that takes longer is treated as "broker unreachable" and
    /// retried on the next tick.
    #[serde(default = "default_publish_timeout_secs")]
    pub publish_timeout_secs: u64,

    /// Capacity of the publisher event channel
    ///
    /// When full, new events are dropped (with a warning log).
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,
}

impl PublisherConfig {
    /// Create a configuration with defaults for `topic`
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            primary_service_port: default_primary_service_port(),
            secondary_service_port: default_secondary_service_port(),
            sample_interval_secs: default_sample_interval_secs(),
            publish_timeout_secs: default_publish_timeout_secs(),
            event_channel_capacity: default_event_channel_capacity(),
        }
    }

    /// Set the service ports
    pub fn with_ports(mut self, primary: u16, secondary: u16) -> Self {
        self.primary_service_port = primary;
        self.secondary_service_port = secondary;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        validate_topic(&self.topic, "Publisher topic")?;
        if self.primary_service_port == 0 || self.secondary_service_port == 0 {
            return Err(crate::Error::config("Service ports must be > 0"));
        }
        if self.sample_interval_secs == 0 {
            return Err(crate::Error::config("Sample interval must be > 0"));
        }
        if self.publish_timeout_secs == 0 {
            return Err(crate::Error::config("Publish timeout must be > 0"));
        }
        if self.event_channel_capacity == 0 {
            return Err(crate::Error::config("Event channel capacity must be > 0"));
        }
        Ok(())
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_secs(self.sample_interval_secs)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_secs(self.publish_timeout_secs)
    }
}

/// Bounded exponential backoff for device reconnection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    /// Delay after the first failed attempt (in milliseconds)
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Growth factor between consecutive delays
    #[serde(default = "default_backoff_multiplier")]
    pub multiplier: u32,

    /// Ceiling on the delay (in seconds)
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
}

impl ReconnectPolicy {
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.initial_backoff_ms == 0 {
            return Err(crate::Error::config("Initial backoff must be > 0"));
        }
        if self.multiplier == 0 {
            return Err(crate::Error::config("Backoff multiplier must be >= 1"));
        }
        if self.max_backoff() < self.initial_backoff() {
            return Err(crate::Error::config(
                "Maximum backoff must not be shorter than the initial backoff",
            ));
        }
        Ok(())
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_backoff_ms: default_initial_backoff_ms(),
            multiplier: default_backoff_multiplier(),
            max_backoff_secs: default_max_backoff_secs(),
        }
    }
}

/// Device-side agent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceAgentConfig {
    /// Retained config topic to subscribe to
    pub topic: String,

    /// Identifier of this device (for logging and liveness)
    pub device_id: String,

    /// Compiled-in endpoints used until a config message is applied
    pub default_endpoints: ServiceEndpoints,

    /// Reconnection backoff
    #[serde(default)]
    pub reconnect: ReconnectPolicy,

    /// Interval between agent ticks (in milliseconds)
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Time a single connect attempt may take within a tick (in milliseconds)
    ///
    /// An attempt that overruns is abandoned and resumed on a later tick so
    /// the device's own command loop is never blocked.
    #[serde(default = "default_tick_budget_ms")]
    pub tick_budget_ms: u64,
}

impl DeviceAgentConfig {
    pub fn new(
        topic: impl Into<String>,
        device_id: impl Into<String>,
        default_endpoints: ServiceEndpoints,
    ) -> Self {
        Self {
            topic: topic.into(),
            device_id: device_id.into(),
            default_endpoints,
            reconnect: ReconnectPolicy::default(),
            tick_interval_ms: default_tick_interval_ms(),
            tick_budget_ms: default_tick_budget_ms(),
        }
    }

    /// Set the reconnect policy
    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Set the per-tick connect budget
    pub fn with_tick_budget(mut self, budget: Duration) -> Self {
        self.tick_budget_ms = u64::try_from(budget.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn validate(&self) -> Result<(), crate::Error> {
        validate_topic(&self.topic, "Device config topic")?;
        if self.device_id.is_empty() {
            return Err(crate::Error::config("Device id cannot be empty"));
        }
        crate::message::ConfigMessage::new(self.default_endpoints.clone())
            .map_err(|e| crate::Error::config(format!("Invalid default endpoints: {}", e)))?;
        self.reconnect.validate()?;
        if self.tick_interval_ms == 0 {
            return Err(crate::Error::config("Tick interval must be > 0"));
        }
        if self.tick_budget_ms == 0 {
            return Err(crate::Error::config("Tick budget must be > 0"));
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn tick_budget(&self) -> Duration {
        Duration::from_millis(self.tick_budget_ms)
    }
}

/// Controller-side connection cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Interval between hardware verifications while foregrounded (in seconds)
    #[serde(default = "default_verify_interval_secs")]
    pub verify_interval_secs: u64,

    /// Time a hardware verification may take (in milliseconds)
    ///
    /// A verification that overruns counts as "unreachable".
    #[serde(default = "default_verify_timeout_ms")]
    pub verify_timeout_ms: u64,
}

impl LinkConfig {
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.verify_interval_secs == 0 {
            return Err(crate::Error::config("Verify interval must be > 0"));
        }
        if self.verify_timeout_ms == 0 {
            return Err(crate::Error::config("Verify timeout must be > 0"));
        }
        Ok(())
    }

    pub fn verify_interval(&self) -> Duration {
        Duration::from_secs(self.verify_interval_secs)
    }

    pub fn verify_timeout(&self) -> Duration {
        Duration::from_millis(self.verify_timeout_ms)
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            verify_interval_secs: default_verify_interval_secs(),
            verify_timeout_ms: default_verify_timeout_ms(),
        }
    }
}

fn default_primary_service_port() -> u16 {
    1883
}

fn default_secondary_service_port() -> u16 {
    5001
}

fn default_sample_interval_secs() -> u64 {
    10
}

fn default_publish_timeout_secs() -> u64 {
    5
}

fn default_event_channel_capacity() -> usize {
    1000
}

fn default_initial_backoff_ms() -> u64 {
    1000
}

fn default_backoff_multiplier() -> u32 {
    2
}

fn default_max_backoff_secs() -> u64 {
    30
}

fn default_tick_interval_ms() -> u64 {
    100
}

fn default_tick_budget_ms() -> u64 {
    500
}

fn default_verify_interval_secs() -> u64 {
    3
}

fn default_verify_timeout_ms() -> u64 {
    2000
}
