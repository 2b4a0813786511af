// # Service Link Trait
//
// A device's own connections to the services named in its active config
// (the message broker and the backend). The device agent is the only
// caller: it decides when to close and when to reconnect.

use async_trait::async_trait;

use crate::message::ServiceEndpoints;

/// Trait for a device's service connections
///
/// ## Rules
///
/// - `connect` makes one attempt; backoff and scheduling belong to the agent
/// - `connect` may be polled across several agent ticks, and is dropped
///   mid-way when the config changes, so it must be cancellation-safe
/// - `connect` must finish by itself (carry its own timeout); the agent
///   only abandons it for new endpoints
/// - `close` never fails; an already-closed link is fine
#[async_trait]
pub trait ServiceLink: Send + Sync {
    /// Open connections to `endpoints`
    async fn connect(&self, endpoints: &ServiceEndpoints) -> Result<(), crate::Error>;

    /// Force-close every open connection
    async fn close(&self);

    /// Whether the link is currently up
    fn is_connected(&self) -> bool;
}
