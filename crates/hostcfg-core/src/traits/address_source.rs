// # Address Source Trait
//
// Defines the interface for sampling the host's own reachable address.
//
// ## Implementations
//
// - Route probe: `hostcfg-addr-probe` crate
// - Test doubles: scripted sources in the contract tests
//
// ## Usage
//
// ```rust,ignore
// use hostcfg_core::AddressSource;
//
// let source = /* AddressSource implementation */;
// match source.sample().await? {
//     Some(address) => println!("host is at {}", address),
//     None => println!("no usable interface right now"),
// }
// ```

use async_trait::async_trait;

use crate::message::NetworkAddress;

/// Trait for address observers
///
/// Sources are **observers**, not decision-makers: they report what the
/// host looks like right now and never decide whether anything gets
/// published.
///
/// ## Rules
///
/// - `sample()` returns immediately with the current view; it must not wait
///   for a change
/// - No retry logic, no sleeping, no spawned polling loops (the publisher
///   owns the schedule)
/// - No interface is a normal, transient condition: return `Ok(None)`
#[async_trait]
pub trait AddressSource: Send + Sync {
    /// Sample the current reachable address
    ///
    /// # Returns
    ///
    /// - `Ok(Some(address))`: the host is reachable at `address`
    /// - `Ok(None)`: no suitable interface is currently reachable (NotFound)
    /// - `Err(Error)`: the probe itself failed; callers treat it like NotFound
    async fn sample(&self) -> Result<Option<NetworkAddress>, crate::Error>;

    /// Name of the source (for logging)
    fn source_name(&self) -> &'static str;
}
