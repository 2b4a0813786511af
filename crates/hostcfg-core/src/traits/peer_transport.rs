// # Peer Transport Trait
//
// The controller's hardware path to its single paired peripheral (a
// short-range wireless serial link in production, TCP in the demos).
//
// ## Blocking Behavior
//
// Every method here may block for as long as the hardware takes. Callers on
// an interactive path must go through [`crate::link::ConnectionCache`],
// whose reads never touch the transport.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a peer (hardware address, or `host:port` for TCP)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Ways of opening a link, tried in order until one succeeds
///
/// Some peripherals only accept one of them: the secure service-record
/// socket is standard, the fixed-channel socket works around devices with a
/// broken service record, and the insecure socket reaches unpaired devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectMethod {
    Secure,
    ChannelFallback,
    Insecure,
}

impl ConnectMethod {
    /// Every method, in the order they should be tried
    pub const ALL: [ConnectMethod; 3] = [
        ConnectMethod::Secure,
        ConnectMethod::ChannelFallback,
        ConnectMethod::Insecure,
    ];
}

impl fmt::Display for ConnectMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectMethod::Secure => "secure",
            ConnectMethod::ChannelFallback => "channel-fallback",
            ConnectMethod::Insecure => "insecure",
        };
        f.write_str(name)
    }
}

/// Trait for controller-side peer hardware
///
/// ## Rules
///
/// - Single-shot operations; the cache owns fallback order and timeouts
/// - `probe` is the real hardware check and must not consult any cache
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Open a link to `peer` using `method`
    async fn open(&self, peer: &PeerId, method: ConnectMethod) -> Result<(), crate::Error>;

    /// Close the link to `peer` (no-op if none is open)
    async fn close(&self, peer: &PeerId) -> Result<(), crate::Error>;

    /// Check against the hardware whether the link to `peer` is up
    async fn probe(&self, peer: &PeerId) -> Result<bool, crate::Error>;

    /// Write one newline-terminated line to `peer`
    async fn send_line(&self, peer: &PeerId, line: &str) -> Result<(), crate::Error>;

    /// Methods this transport supports, in the order to try them
    fn connect_methods(&self) -> &[ConnectMethod] {
        &ConnectMethod::ALL
    }

    /// Name of the transport (for logging)
    fn transport_name(&self) -> &'static str;
}
