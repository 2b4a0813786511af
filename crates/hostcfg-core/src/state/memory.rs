// # Memory Config Store
//
// In-memory implementation of ConfigStore.
//
// ## Crash Behavior
//
// - Everything is lost on restart
// - The device boots from compiled-in defaults and converges on the
//   retained config message
//
// Clones share the same slot, so a test can keep a handle and inspect what
// the agent saved.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::Error;
use crate::device::DeviceConfigState;
use crate::traits::config_store::ConfigStore;

/// In-memory device config store
#[derive(Debug, Clone, Default)]
pub struct MemoryConfigStore {
    inner: Arc<RwLock<Option<DeviceConfigState>>>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-seeded with `state`, as if saved by a previous boot
    pub fn with_state(state: DeviceConfigState) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Some(state))),
        }
    }

    /// Currently stored state
    pub async fn snapshot(&self) -> Option<DeviceConfigState> {
        self.inner.read().await.clone()
    }

    pub async fn clear(&self) {
        *self.inner.write().await = None;
    }
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn load(&self) -> Result<Option<DeviceConfigState>, Error> {
        Ok(self.inner.read().await.clone())
    }

    async fn save(&self, state: &DeviceConfigState) -> Result<(), Error> {
        *self.inner.write().await = Some(state.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ServiceEndpoints;

    #[tokio::test]
    async fn clones_share_the_slot() {
        let store = MemoryConfigStore::new();
        let handle = store.clone();
        assert!(store.load().await.unwrap().is_none());

        let state = DeviceConfigState::from_defaults(ServiceEndpoints::colocated("E", 1883, 5001));
        store.save(&state).await.unwrap();

        assert_eq!(handle.snapshot().await, Some(state));

        handle.clear().await;
        assert!(store.load().await.unwrap().is_none());
    }
}
