// # hostcfg-core
//
// Core library for keeping a fleet's view of the host address converged.
//
// ## Architecture Overview
//
// Two independent halves share one problem: observers may be absent at the
// moment the truth changes.
//
// Host side:
// - **AddressSource**: samples the host's reachable address
// - **ConfigPublisher**: publishes a retained ConfigMessage when the address changes
// - **ConfigBroker**: retained pub/sub contract (MQTT, or the in-memory broker)
//
// Device side:
// - **DeviceAgent**: validates/applies config and drives reconnection of the
//   device's own service links
// - **ConfigStore**: optional persistence of the applied config
//
// Controller side:
// - **ConnectionCache**: non-blocking cached view of the paired peer
// - **VerificationScheduler**: periodic + foreground-triggered hardware checks
// - **PeerTransport**: the short-range wireless (or TCP) hardware
//
// ## Design Principles
//
// 1. **Single writer**: every piece of state has exactly one writer role
// 2. **Last value wins**: late subscribers get the newest retained config only
// 3. **Never fatal**: every failure degrades to "stale, self-corrects on next tick"
// 4. **Library-first**: daemons are thin wiring around this crate

pub mod broker;
pub mod config;
pub mod device;
pub mod error;
pub mod link;
pub mod message;
pub mod publisher;
pub mod state;
pub mod traits;
pub mod transport;

// Re-export core types for convenience
pub use broker::{MemoryBroker, topic_matches};
pub use config::{DeviceAgentConfig, LinkConfig, PublisherConfig, ReconnectPolicy};
pub use device::{ApplyOutcome, DeviceAgent, DeviceConfigState, LinkState};
pub use error::{Error, Result};
pub use link::{
    AppLifecycle, Confidence, ConnectionCache, ConnectionRecord, LifecycleState, Liveness,
    LivenessTracker, VerificationScheduler,
};
pub use message::{ConfigMessage, Endpoint, NetworkAddress, ServiceEndpoints};
pub use publisher::{ConfigPublisher, PublisherEvent, TickOutcome};
pub use state::{FileConfigStore, MemoryConfigStore};
pub use traits::{
    AddressSource, BrokerMessage, ConfigBroker, ConfigStore, ConnectMethod, PeerId, PeerTransport,
    ServiceLink,
};
pub use transport::TcpPeerTransport;
