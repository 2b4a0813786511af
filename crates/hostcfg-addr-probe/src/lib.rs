// # Route Probe Address Source
//
// Answers "which local address would this host use to reach the network?"
// by asking the OS routing table.
//
// ## How
//
// A UDP socket bound to the unspecified address is `connect`ed to a probe
// target. Connecting a UDP socket only selects a route and a source
// address; no packet is sent. The socket's local address is the answer.
//
// ## NotFound
//
// - No route to the target (no interface up, no default route)
// - The kernel picked an unspecified or loopback address

use async_trait::async_trait;
use hostcfg_core::traits::AddressSource;
use hostcfg_core::{Error, NetworkAddress, Result};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::net::UdpSocket;
use tracing::{debug, trace};

/// Default probe target
///
/// TEST-NET-1 (RFC 5737): routed via the default route like any public
/// address, never answered.
pub const DEFAULT_PROBE_TARGET: &str = "192.0.2.1:9";

/// Address source backed by a routing-table lookup
#[derive(Debug, Clone)]
pub struct RouteProbe {
    target: SocketAddr,
}

impl RouteProbe {
    pub fn new(target: SocketAddr) -> Self {
        Self { target }
    }

    /// Probe towards `target` (`ip:port`)
    pub fn parse(target: &str) -> Result<Self> {
        target
            .trim()
            .parse::<SocketAddr>()
            .map(Self::new)
            .map_err(|_| Error::invalid_input(format!("Invalid probe target: {}", target)))
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }

    async fn local_address(&self) -> io::Result<IpAddr> {
        let bind: SocketAddr = match self.target {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };

        let socket = UdpSocket::bind(bind).await?;
        socket.connect(self.target).await?;
        Ok(socket.local_addr()?.ip())
    }
}

impl Default for RouteProbe {
    fn default() -> Self {
        Self::new(SocketAddr::from(([192, 0, 2, 1], 9)))
    }
}

fn is_no_route(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::NetworkUnreachable
            | io::ErrorKind::HostUnreachable
            | io::ErrorKind::AddrNotAvailable
            | io::ErrorKind::NetworkDown
    )
}

#[async_trait]
impl AddressSource for RouteProbe {
    async fn sample(&self) -> Result<Option<NetworkAddress>> {
        match self.local_address().await {
            Ok(ip) if ip.is_unspecified() || ip.is_loopback() => {
                debug!("Route to {} uses {}, treating as no address", self.target, ip);
                Ok(None)
            }
            Ok(ip) => {
                trace!("Route to {} uses {}", self.target, ip);
                Ok(Some(NetworkAddress::new(ip)))
            }
            Err(e) if is_no_route(&e) => {
                debug!("No route to {}: {}", self.target, e);
                Ok(None)
            }
            Err(e) => Err(Error::address_unavailable(format!(
                "route probe towards {} failed: {}",
                self.target, e
            ))),
        }
    }

    fn source_name(&self) -> &'static str {
        "route-probe"
    }
}
