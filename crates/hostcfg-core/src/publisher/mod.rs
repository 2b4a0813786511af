//! Host-side config publisher
//!
//! The ConfigPublisher is responsible for:
//! - Sampling the host's reachable address via an AddressSource
//! - Deciding whether the address changed since the last accepted publish
//! - Publishing a retained ConfigMessage to the broker
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────┐   sample()   ┌─────────────────┐  publish(retain)  ┌──────────────┐
//! │ AddressSource │ ───────────▶ │ ConfigPublisher │ ────────────────▶ │ ConfigBroker │
//! └───────────────┘              └─────────────────┘                   └──────────────┘
//!                                         │
//!                                         ▼
//!                                 PublisherEvent (monitoring)
//! ```
//!
//! ## Tick Flow
//!
//! 1. Sample the address
//! 2. NotFound or probe failure → publish nothing, keep `last_published`
//! 3. Equal to `last_published` → nothing to do
//! 4. Otherwise publish retained; only an accepted publish moves
//!    `last_published`, so a broker outage is retried on the next tick

use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::PublisherConfig;
use crate::error::{Error, Result};
use crate::message::{ConfigMessage, NetworkAddress};
use crate::traits::{AddressSource, ConfigBroker};

/// Events emitted by the ConfigPublisher
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublisherEvent {
    /// Publisher started
    Started { topic: String },

    /// No usable address this tick
    AddressUnavailable,

    /// A new address was published
    Published {
        address: NetworkAddress,
        previous: Option<NetworkAddress>,
    },

    /// The address matched the last accepted publish
    Unchanged { address: NetworkAddress },

    /// The broker did not accept the publish
    PublishFailed {
        address: NetworkAddress,
        error: String,
    },

    /// An operator-supplied message was published
    OverridePublished { host: String },

    /// Publisher stopped
    Stopped { reason: String },
}

/// Result of a single publisher tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    Published(ConfigMessage),
    Unchanged,
    AddressUnavailable,
    PublishFailed,
}

/// Host-side publisher
///
/// ## Lifecycle
///
/// 1. Create with [`ConfigPublisher::new()`]
/// 2. Start with [`ConfigPublisher::run()`], or drive [`ConfigPublisher::tick()`]
/// 3. Runs until a shutdown signal is received
///
/// The schedule lives here and nowhere else: address sources are sampled,
/// never polled by themselves.
pub struct ConfigPublisher {
    source: Box<dyn AddressSource>,
    broker: Arc<dyn ConfigBroker>,
    config: PublisherConfig,
    last_published: Option<NetworkAddress>,
    event_tx: mpsc::Sender<PublisherEvent>,
}

impl ConfigPublisher {
    /// Create a new publisher
    ///
    /// # Returns
    ///
    /// A tuple of (publisher, event_receiver)
    pub fn new(
        source: Box<dyn AddressSource>,
        broker: Arc<dyn ConfigBroker>,
        config: PublisherConfig,
    ) -> Result<(Self, mpsc::Receiver<PublisherEvent>)> {
        config.validate()?;

        let (tx, rx) = mpsc::channel(config.event_channel_capacity);

        let publisher = Self {
            source,
            broker,
            config,
            last_published: None,
            event_tx: tx,
        };

        Ok((publisher, rx))
    }

    /// Address of the last publish the broker accepted
    pub fn last_published(&self) -> Option<NetworkAddress> {
        self.last_published
    }

    pub fn topic(&self) -> &str {
        &self.config.topic
    }

    /// Sample once and publish if the address changed
    pub async fn tick(&mut self) -> TickOutcome {
        let address = match self.source.sample().await {
            Ok(Some(address)) => address,
            Ok(None) => {
                debug!("{}: no reachable address", self.source.source_name());
                self.emit_event(PublisherEvent::AddressUnavailable);
                return TickOutcome::AddressUnavailable;
            }
            Err(e) => {
                warn!("{} probe failed: {}", self.source.source_name(), e);
                self.emit_event(PublisherEvent::AddressUnavailable);
                return TickOutcome::AddressUnavailable;
            }
        };

        if !is_publishable(address.ip()) {
            debug!("Ignoring non-routable address {}", address);
            self.emit_event(PublisherEvent::AddressUnavailable);
            return TickOutcome::AddressUnavailable;
        }

        if self.last_published == Some(address) {
            debug!("Address {} unchanged, nothing to publish", address);
            self.emit_event(PublisherEvent::Unchanged { address });
            return TickOutcome::Unchanged;
        }

        let message = match ConfigMessage::for_address(
            address,
            self.config.primary_service_port,
            self.config.secondary_service_port,
        ) {
            Ok(message) => message,
            Err(e) => {
                warn!("Cannot build config for {}: {}", address, e);
                self.emit_event(PublisherEvent::AddressUnavailable);
                return TickOutcome::AddressUnavailable;
            }
        };

        match self.publish_message(&message).await {
            Ok(()) => {
                let previous = self.last_published.replace(address);
                info!(
                    "Published {} to {} (previous: {:?})",
                    address, self.config.topic, previous
                );
                self.emit_event(PublisherEvent::Published { address, previous });
                TickOutcome::Published(message)
            }
            Err(e) => {
                warn!("Publish of {} failed, retrying next tick: {}", address, e);
                self.emit_event(PublisherEvent::PublishFailed {
                    address,
                    error: e.to_string(),
                });
                TickOutcome::PublishFailed
            }
        }
    }

    /// Publish an operator-supplied message
    ///
    /// Does not move `last_published`: the next observed address change
    /// overwrites the override as usual.
    pub async fn publish_override(&self, message: &ConfigMessage) -> Result<()> {
        self.publish_message(message).await?;
        info!(
            "Published override {} to {}",
            message.primary(),
            self.config.topic
        );
        self.emit_event(PublisherEvent::OverridePublished {
            host: message.primary().host.clone(),
        });
        Ok(())
    }

    async fn publish_message(&self, message: &ConfigMessage) -> Result<()> {
        let payload = message.to_payload()?;
        let timeout = self.config.publish_timeout();

        match tokio::time::timeout(
            timeout,
            self.broker.publish(&self.config.topic, payload, true),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(Error::broker(format!(
                "{} publish timed out after {:?}",
                self.broker.broker_name(),
                timeout
            ))),
        }
    }

    /// Run the publisher until Ctrl-C
    pub async fn run(&mut self) -> Result<()> {
        self.run_internal(None).await
    }

    /// Run the publisher until `shutdown_rx` fires
    ///
    /// Used by the daemon (signal handling lives in the binary) and by the
    /// contract tests.
    pub async fn run_with_shutdown(
        &mut self,
        shutdown_rx: Option<oneshot::Receiver<()>>,
    ) -> Result<()> {
        self.run_internal(shutdown_rx).await
    }

    async fn run_internal(&mut self, shutdown_rx: Option<oneshot::Receiver<()>>) -> Result<()> {
        self.emit_event(PublisherEvent::Started {
            topic: self.config.topic.clone(),
        });
        info!(
            "Publisher started: source={}, broker={}, topic={}",
            self.source.source_name(),
            self.broker.broker_name(),
            self.config.topic
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

        // First tick fires immediately
        let mut ticker = tokio::time::interval(self.config.sample_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }

                _ = &mut shutdown => {
                    info!("Shutdown signal received");
                    self.emit_event(PublisherEvent::Stopped {
                        reason: "Shutdown signal".to_string(),
                    });
                    break;
                }
            }
        }

        Ok(())
    }

    fn emit_event(&self, event: PublisherEvent) {
        if self.event_tx.try_send(event).is_err() {
            warn!("Event channel full, dropping event (event_channel_capacity too small?)");
        }
    }
}

/// Whether devices could reach the host at `ip`
fn is_publishable(ip: IpAddr) -> bool {
    !(ip.is_unspecified() || ip.is_loopback() || ip.is_multicast())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_and_unspecified_are_not_publishable() {
        assert!(!is_publishable("127.0.0.1".parse().unwrap()));
        assert!(!is_publishable("0.0.0.0".parse().unwrap()));
        assert!(!is_publishable("::1".parse().unwrap()));
        assert!(is_publishable("192.168.1.20".parse().unwrap()));
    }
}
