//! Error types for hostcfg
//!
//! None of these is fatal to a running process. Callers degrade each kind
//! to "not yet converged" and try again on the next tick or message.

use std::time::Duration;
use thiserror::Error;

/// Result type alias for hostcfg operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for hostcfg
#[derive(Error, Debug)]
pub enum Error {
    /// No suitable network address could be sampled
    #[error("Address unavailable: {0}")]
    AddressUnavailable(String),

    /// A configuration payload failed to parse or validate
    #[error("Malformed config message: {0}")]
    MalformedConfig(String),

    /// The broker could not be reached or refused the operation
    #[error("Broker unreachable: {0}")]
    Broker(String),

    /// A service link could not be (re)established
    #[error("Reconnect failed: {0}")]
    Reconnect(String),

    /// Hardware verification did not answer in time
    #[error("Verification timed out after {0:?}")]
    VerificationTimeout(Duration),

    /// Peer transport errors (open/close/send)
    #[error("Transport error: {0}")]
    Transport(String),

    /// An operation needed a connected peer
    #[error("Not connected: {0}")]
    NotConnected(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Device config store errors
    #[error("Config store error: {0}")]
    ConfigStore(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create an address-unavailable error
    pub fn address_unavailable(msg: impl Into<String>) -> Self {
        Self::AddressUnavailable(msg.into())
    }

    /// Create a malformed-config error
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedConfig(msg.into())
    }

    /// Create a broker error
    pub fn broker(msg: impl Into<String>) -> Self {
        Self::Broker(msg.into())
    }

    /// Create a reconnect error
    pub fn reconnect(msg: impl Into<String>) -> Self {
        Self::Reconnect(msg.into())
    }

    /// Create a transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create a not-connected error
    pub fn not_connected(msg: impl Into<String>) -> Self {
        Self::NotConnected(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a config store error
    pub fn config_store(msg: impl Into<String>) -> Self {
        Self::ConfigStore(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Whether the error is expected to clear by itself on a later attempt
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::AddressUnavailable(_)
                | Self::Broker(_)
                | Self::Reconnect(_)
                | Self::VerificationTimeout(_)
                | Self::Transport(_)
                | Self::Io(_)
        )
    }
}

/// Helper for converting anyhow::Error to our Error type
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Other(err.to_string())
    }
}
