//! Controller-side connection state cache
//!
//! The controller keeps exactly one paired peripheral. Screens and business
//! logic ask "is it connected?" far more often than the hardware can answer
//! cheaply, so the answer comes from a [`ConnectionCache`]:
//!
//! - [`ConnectionCache::cached_status()`] never touches hardware
//! - [`ConnectionCache::verify_now()`] does the real check, bounded by a
//!   timeout, and reconciles the cache
//! - [`ConnectionCache::connect()`] / [`ConnectionCache::disconnect()`] are
//!   the only operations that change which peer is targeted
//!
//! The cache is an explicit, injectable handle. Clones share state, so every
//! screen that needs it gets a clone rather than reaching for a global.

pub mod liveness;
pub mod scheduler;

pub use liveness::{Liveness, LivenessTracker};
pub use scheduler::{AppLifecycle, LifecycleState, VerificationScheduler};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::LinkConfig;
use crate::error::{Error, Result};
use crate::traits::{PeerId, PeerTransport};

/// Cached view of the targeted peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionRecord {
    pub peer: PeerId,
    pub cached_connected: bool,
    /// Start time of the last verification (or connect) attempt
    pub last_verified_at: Option<DateTime<Utc>>,
}

/// How much a cached status can be trusted, from its age
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    /// Verified within one interval
    Fresh,
    /// Verified within three intervals
    Aging,
    /// Older than that
    Stale,
    /// Never verified, or not the targeted peer
    Unknown,
}

/// Non-blocking connection cache over a [`PeerTransport`]
///
/// # Example
///
/// ```rust,no_run
/// use hostcfg_core::{ConnectionCache, LinkConfig, PeerId, TcpPeerTransport};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let transport = Box::new(TcpPeerTransport::new());
///     let cache = ConnectionCache::new(transport, LinkConfig::default())?;
///     let peer = PeerId::new("192.168.1.40:7000");
///
///     cache.connect(&peer).await?;
///     assert!(cache.cached_status(&peer)); // no I/O
///     cache.send_line(&peer, "ping").await?;
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct ConnectionCache {
    inner: Arc<CacheInner>,
}

struct CacheInner {
    transport: Box<dyn PeerTransport>,
    record: RwLock<Option<ConnectionRecord>>,
    // Serializes hardware operations; never held by cached reads
    op_lock: Mutex<()>,
    config: LinkConfig,
    liveness: Option<LivenessTracker>,
}

impl ConnectionCache {
    pub fn new(transport: Box<dyn PeerTransport>, config: LinkConfig) -> Result<Self> {
        Self::build(transport, config, None)
    }

    /// Cache that consults peer liveness before touching hardware
    pub fn with_liveness(
        transport: Box<dyn PeerTransport>,
        config: LinkConfig,
        liveness: LivenessTracker,
    ) -> Result<Self> {
        Self::build(transport, config, Some(liveness))
    }

    fn build(
        transport: Box<dyn PeerTransport>,
        config: LinkConfig,
        liveness: Option<LivenessTracker>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(CacheInner {
                transport,
                record: RwLock::new(None),
                op_lock: Mutex::new(()),
                config,
                liveness,
            }),
        })
    }

    pub fn config(&self) -> &LinkConfig {
        &self.inner.config
    }

    /// Snapshot of the current record, if a peer is targeted
    pub fn record(&self) -> Option<ConnectionRecord> {
        self.inner
            .record
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Currently targeted peer
    pub fn target(&self) -> Option<PeerId> {
        self.record().map(|r| r.peer)
    }

    fn is_target(&self, peer: &PeerId) -> bool {
        self.inner
            .record
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|r| &r.peer == peer)
    }

    fn set_record(&self, record: Option<ConnectionRecord>) {
        *self
            .inner
            .record
            .write()
            .unwrap_or_else(PoisonError::into_inner) = record;
    }

    /// Apply `update` to the record only while `peer` is still targeted
    fn update_if_target(&self, peer: &PeerId, update: impl FnOnce(&mut ConnectionRecord)) {
        let mut guard = self
            .inner
            .record
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(record) = guard.as_mut()
            && &record.peer == peer
        {
            update(record);
        }
    }

    /// Last known connection status of `peer`
    ///
    /// Never blocks on hardware. `false` when `peer` was never verified or
    /// is not the targeted peer.
    pub fn cached_status(&self, peer: &PeerId) -> bool {
        self.inner
            .record
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|r| &r.peer == peer && r.cached_connected)
    }

    /// Trust level of the cached status of `peer`
    pub fn confidence(&self, peer: &PeerId) -> Confidence {
        let Some(verified_at) = self
            .record()
            .filter(|r| &r.peer == peer)
            .and_then(|r| r.last_verified_at)
        else {
            return Confidence::Unknown;
        };

        let age = Utc::now()
            .signed_duration_since(verified_at)
            .to_std()
            .unwrap_or_default();
        let interval = self.inner.config.verify_interval();

        if age <= interval {
            Confidence::Fresh
        } else if age <= interval.saturating_mul(3) {
            Confidence::Aging
        } else {
            Confidence::Stale
        }
    }

    /// Check the hardware now and reconcile the cache
    ///
    /// Blocks for up to the verify timeout; call it from a scheduler or a
    /// user action, never from a render path. A timeout or transport error
    /// yields `false`. Verifying a peer that is not targeted does nothing
    /// and returns `false`.
    pub async fn verify_now(&self, peer: &PeerId) -> bool {
        let _guard = self.inner.op_lock.lock().await;

        if !self.is_target(peer) {
            debug!("Not verifying {}: not the targeted peer", peer);
            return false;
        }

        let attempted_at = Utc::now();

        if let Some(liveness) = &self.inner.liveness
            && !liveness.is_reachable(peer)
        {
            debug!("{} reported offline, skipping hardware check", peer);
            self.record_verification(peer, false, attempted_at);
            return false;
        }

        let timeout = self.inner.config.verify_timeout();
        let check = self.inner.transport.probe(peer);
        let connected = match tokio::time::timeout(timeout, check).await {
            Ok(Ok(connected)) => connected,
            Ok(Err(e)) => {
                warn!("Verification of {} failed: {}", peer, e);
                false
            }
            Err(_) => {
                warn!("Verification of {}: {}", peer, Error::VerificationTimeout(timeout));
                false
            }
        };

        self.record_verification(peer, connected, attempted_at);
        connected
    }

    fn record_verification(&self, peer: &PeerId, connected: bool, at: DateTime<Utc>) {
        self.update_if_target(peer, |record| {
            if record.cached_connected != connected {
                info!(
                    "{} is now {}",
                    peer,
                    if connected { "connected" } else { "disconnected" }
                );
            }
            record.cached_connected = connected;
            record.last_verified_at = Some(at);
        });
    }

    /// Target `peer` and open a link to it
    ///
    /// Any previously targeted peer is closed and forgotten first. Each of
    /// the transport's connect methods is tried in order. On failure the
    /// peer stays targeted with `cached_connected = false` and the last
    /// error is returned.
    pub async fn connect(&self, peer: &PeerId) -> Result<()> {
        let _guard = self.inner.op_lock.lock().await;
        let transport = &self.inner.transport;

        if let Some(previous) = self.target()
            && &previous != peer
        {
            info!("Switching peer {} -> {}", previous, peer);
            if let Err(e) = transport.close(&previous).await {
                warn!("Failed to close {}: {}", previous, e);
            }
        }

        // Drop any stale socket before opening a new one
        if let Err(e) = transport.close(peer).await {
            debug!("Closing stale link to {}: {}", peer, e);
        }

        let mut last_error = None;
        for method in transport.connect_methods() {
            match transport.open(peer, *method).await {
                Ok(()) => {
                    info!("Connected to {} via {} ({})", peer, method, transport.transport_name());
                    self.set_record(Some(ConnectionRecord {
                        peer: peer.clone(),
                        cached_connected: true,
                        last_verified_at: Some(Utc::now()),
                    }));
                    return Ok(());
                }
                Err(e) => {
                    debug!("Connect to {} via {} failed: {}", peer, method, e);
                    if let Err(close_err) = transport.close(peer).await {
                        debug!("Cleanup after failed {} connect: {}", method, close_err);
                    }
                    last_error = Some(e);
                }
            }
        }

        self.set_record(Some(ConnectionRecord {
            peer: peer.clone(),
            cached_connected: false,
            last_verified_at: Some(Utc::now()),
        }));

        let error = last_error.unwrap_or_else(|| {
            Error::transport(format!(
                "{} offers no connect methods",
                transport.transport_name()
            ))
        });
        warn!("Connect to {} failed: {}", peer, error);
        Err(error)
    }

    /// Close the link to `peer` and forget it
    ///
    /// The target is cleared even when closing the hardware link fails; the
    /// close error is still returned.
    pub async fn disconnect(&self, peer: &PeerId) -> Result<()> {
        let _guard = self.inner.op_lock.lock().await;

        let result = self.inner.transport.close(peer).await;

        if self.is_target(peer) {
            self.set_record(None);
            info!("Disconnected from {}", peer);
        }

        result
    }

    /// Write one line to the connected peer
    ///
    /// Fails with [`Error::NotConnected`] when the cache says the peer is
    /// disconnected. A transport failure marks the peer disconnected.
    pub async fn send_line(&self, peer: &PeerId, line: &str) -> Result<()> {
        if !self.cached_status(peer) {
            return Err(Error::not_connected(peer.to_string()));
        }

        let _guard = self.inner.op_lock.lock().await;
        match self.inner.transport.send_line(peer, line).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("Send to {} failed, marking disconnected: {}", peer, e);
                self.update_if_target(peer, |record| record.cached_connected = false);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confidence_serializes_snake_case() {
        assert_eq!(serde_json::to_string(&Confidence::Fresh).unwrap(), "\"fresh\"");
        assert_eq!(serde_json::to_string(&Confidence::Unknown).unwrap(), "\"unknown\"");
    }
}
