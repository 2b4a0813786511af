// # Verification Scheduler
//
// Keeps the connection cache's staleness bounded without polling hardware
// in the background:
//
// - every verify interval while the app is in the foreground
// - immediately on every background -> foreground transition
// - never while backgrounded
//
// Transitions are counted, not just flagged: a watch channel keeps only the
// latest value, so a quick background/foreground pair would otherwise look
// like no change at all.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use super::ConnectionCache;
use crate::error::Result;

/// Snapshot of the app lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecycleState {
    pub foreground: bool,
    /// Number of background -> foreground transitions so far
    pub foregroundings: u64,
}

/// Foreground/background state of the controller app
///
/// Clones share the same state. The UI layer calls
/// [`AppLifecycle::set_foreground()`]; schedulers watch it.
#[derive(Debug, Clone)]
pub struct AppLifecycle {
    tx: Arc<watch::Sender<LifecycleState>>,
}

impl AppLifecycle {
    pub fn new(foreground: bool) -> Self {
        let (tx, _rx) = watch::channel(LifecycleState {
            foreground,
            foregroundings: 0,
        });
        Self { tx: Arc::new(tx) }
    }

    /// Report a lifecycle transition (repeats are ignored)
    pub fn set_foreground(&self, foreground: bool) {
        self.tx.send_if_modified(|state| {
            if state.foreground == foreground {
                return false;
            }
            state.foreground = foreground;
            if foreground {
                state.foregroundings += 1;
            }
            true
        });
    }

    pub fn is_foreground(&self) -> bool {
        self.tx.borrow().foreground
    }

    pub fn state(&self) -> LifecycleState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.tx.subscribe()
    }
}

impl Default for AppLifecycle {
    fn default() -> Self {
        Self::new(true)
    }
}

/// Periodic and foreground-triggered hardware verification
pub struct VerificationScheduler {
    cache: ConnectionCache,
    lifecycle: AppLifecycle,
    interval: Duration,
}

impl VerificationScheduler {
    /// Scheduler using the cache's configured verify interval
    pub fn new(cache: ConnectionCache, lifecycle: AppLifecycle) -> Self {
        let interval = cache.config().verify_interval();
        Self {
            cache,
            lifecycle,
            interval,
        }
    }

    /// Override the verify interval
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Verify the targeted peer, if any
    pub async fn verify_target(&self) -> Option<bool> {
        let peer = self.cache.target()?;
        Some(self.cache.verify_now(&peer).await)
    }

    /// Run until Ctrl-C
    pub async fn run(&self) -> Result<()> {
        self.run_internal(None).await
    }

    /// Run until `shutdown_rx` fires
    pub async fn run_with_shutdown(
        &self,
        shutdown_rx: Option<oneshot::Receiver<()>>,
    ) -> Result<()> {
        self.run_internal(shutdown_rx).await
    }

    async fn run_internal(&self, shutdown_rx: Option<oneshot::Receiver<()>>) -> Result<()> {
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

        let mut lifecycle_rx = self.lifecycle.subscribe();
        let LifecycleState {
            mut foreground,
            foregroundings: mut seen_foregroundings,
        } = *lifecycle_rx.borrow_and_update();
        let mut lifecycle_open = true;

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("Verification scheduler started (every {:?} in foreground)", self.interval);

        loop {
            tokio::select! {
                changed = lifecycle_rx.changed(), if lifecycle_open => {
                    if changed.is_err() {
                        lifecycle_open = false;
                        continue;
                    }
                    let state = *lifecycle_rx.borrow_and_update();
                    if state.foregroundings != seen_foregroundings {
                        debug!(
                            "Foregrounded {} time(s), verifying now",
                            state.foregroundings - seen_foregroundings
                        );
                        seen_foregroundings = state.foregroundings;
                        self.verify_target().await;
                        ticker.reset();
                    }
                    foreground = state.foreground;
                }

                _ = ticker.tick(), if foreground => {
                    self.verify_target().await;
                }

                _ = &mut shutdown => {
                    info!("Verification scheduler stopped");
                    break;
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_transitions_are_ignored() {
        let lifecycle = AppLifecycle::new(true);
        let mut rx = lifecycle.subscribe();

        lifecycle.set_foreground(true);
        assert!(!rx.has_changed().unwrap());

        lifecycle.set_foreground(false);
        assert!(rx.has_changed().unwrap());
        assert!(!rx.borrow_and_update().foreground);
        assert!(!lifecycle.is_foreground());
    }

    #[test]
    fn quick_round_trip_still_counts_a_foregrounding() {
        let lifecycle = AppLifecycle::new(true);
        let mut rx = lifecycle.subscribe();

        lifecycle.set_foreground(false);
        lifecycle.set_foreground(true);

        let state = *rx.borrow_and_update();
        assert!(state.foreground);
        assert_eq!(state.foregroundings, 1);
        assert_eq!(lifecycle.state(), state);
    }
}
