// # Config Store Trait
//
// Persistence of the device's applied configuration.
//
// ## Purpose
//
// Without a store, a device boots from compiled-in defaults and relies on
// the retained message to converge. With a store, it boots from the last
// config it applied, which survives power loss.
//
// ## Implementations
//
// - In-memory: [`crate::state::MemoryConfigStore`]
// - File-based: [`crate::state::FileConfigStore`]

use async_trait::async_trait;

use crate::device::DeviceConfigState;

/// Trait for device config persistence
///
/// ## Rules
///
/// - Async I/O only
/// - `save` must be durable when it returns `Ok`
/// - No business logic: the agent decides what to save and when
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Load the last saved state
    ///
    /// # Returns
    ///
    /// - `Ok(Some(state))`: previously saved state
    /// - `Ok(None)`: nothing saved yet
    /// - `Err(Error)`: storage error
    async fn load(&self) -> Result<Option<DeviceConfigState>, crate::Error>;

    /// Save the current state
    async fn save(&self, state: &DeviceConfigState) -> Result<(), crate::Error>;
}
