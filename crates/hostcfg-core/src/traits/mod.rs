//! Core traits for hostcfg
//!
//! This module defines the abstract interfaces that all implementations must follow.
//!
//! - [`AddressSource`]: Sample the host's reachable address
//! - [`ConfigBroker`]: Retained publish/subscribe
//! - [`ServiceLink`]: A device's own service connections
//! - [`ConfigStore`]: Persistence of a device's applied config
//! - [`PeerTransport`]: Controller hardware towards the paired peer

pub mod address_source;
pub mod broker;
pub mod config_store;
pub mod peer_transport;
pub mod service_link;

pub use address_source::AddressSource;
pub use broker::{BrokerMessage, ConfigBroker, MessageStream};
pub use config_store::ConfigStore;
pub use peer_transport::{ConnectMethod, PeerId, PeerTransport};
pub use service_link::ServiceLink;
