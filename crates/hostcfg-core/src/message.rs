//! Data model shared by the publisher and the device agent
//!
//! ## Wire Format
//!
//! A config message is a flat JSON object, published retained on one topic
//! per device group:
//!
//! ```json
//! {
//!   "primary_service_host": "192.168.1.20",
//!   "primary_service_port": 1883,
//!   "secondary_service_host": "192.168.1.20",
//!   "secondary_service_port": 5001
//! }
//! ```
//!
//! Ports are accepted as JSON numbers or numeric strings so hand-written
//! operator payloads parse the same way as generated ones.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use crate::error::{Error, Result};

/// The host's current reachable address
///
/// A value type: replaced wholesale on change and compared by equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NetworkAddress(IpAddr);

impl NetworkAddress {
    pub fn new(ip: IpAddr) -> Self {
        Self(ip)
    }

    pub fn ip(&self) -> IpAddr {
        self.0
    }
}

impl From<IpAddr> for NetworkAddress {
    fn from(ip: IpAddr) -> Self {
        Self(ip)
    }
}

impl FromStr for NetworkAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        s.trim()
            .parse::<IpAddr>()
            .map(Self)
            .map_err(|_| Error::invalid_input(format!("Invalid network address: {}", s)))
    }
}

impl fmt::Display for NetworkAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A host/port pair a device connects to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    fn validate(&self, field: &str) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(Error::malformed(format!("{}_host is empty", field)));
        }
        if self.host.chars().any(char::is_whitespace) {
            return Err(Error::malformed(format!(
                "{}_host contains whitespace: {:?}",
                field, self.host
            )));
        }
        if self.port == 0 {
            return Err(Error::malformed(format!("{}_port must be > 0", field)));
        }
        Ok(())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.host.parse::<IpAddr>() {
            Ok(IpAddr::V6(_)) => write!(f, "[{}]:{}", self.host, self.port),
            _ => write!(f, "{}:{}", self.host, self.port),
        }
    }
}

/// The pair of services a device keeps links to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceEndpoints {
    /// Message broker the device talks to
    pub primary: Endpoint,
    /// Backend service the device talks to
    pub secondary: Endpoint,
}

impl ServiceEndpoints {
    pub fn new(primary: Endpoint, secondary: Endpoint) -> Self {
        Self { primary, secondary }
    }

    /// Both services co-located on one host
    pub fn colocated(host: impl Into<String>, primary_port: u16, secondary_port: u16) -> Self {
        let host = host.into();
        Self {
            primary: Endpoint::new(host.clone(), primary_port),
            secondary: Endpoint::new(host, secondary_port),
        }
    }
}

/// Configuration pushed to devices
///
/// Immutable once constructed. A topic holds at most one retained message;
/// the broker overwrites, never appends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "ConfigPayload", try_from = "ConfigPayload")]
pub struct ConfigMessage {
    endpoints: ServiceEndpoints,
}

impl ConfigMessage {
    /// Build a validated message
    pub fn new(endpoints: ServiceEndpoints) -> Result<Self> {
        endpoints.primary.validate("primary_service")?;
        endpoints.secondary.validate("secondary_service")?;
        Ok(Self { endpoints })
    }

    /// Message pointing every downstream service at `address`
    ///
    /// The services co-locate with the host, so one address fans out to
    /// both ports.
    pub fn for_address(
        address: NetworkAddress,
        primary_port: u16,
        secondary_port: u16,
    ) -> Result<Self> {
        Self::new(ServiceEndpoints::colocated(
            address.to_string(),
            primary_port,
            secondary_port,
        ))
    }

    /// Parse a broker payload
    ///
    /// Any failure is reported as [`Error::MalformedConfig`].
    pub fn parse(payload: &[u8]) -> Result<Self> {
        if payload.is_empty() {
            return Err(Error::malformed("empty payload"));
        }
        serde_json::from_slice(payload).map_err(|e| Error::malformed(e.to_string()))
    }

    /// Serialize to the wire format
    pub fn to_payload(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn endpoints(&self) -> &ServiceEndpoints {
        &self.endpoints
    }

    pub fn primary(&self) -> &Endpoint {
        &self.endpoints.primary
    }

    pub fn secondary(&self) -> &Endpoint {
        &self.endpoints.secondary
    }

    /// Stable digest of the canonical payload (FNV-1a, 64 bit)
    pub fn digest(&self) -> u64 {
        let canonical = format!(
            "{}|{}|{}|{}",
            self.endpoints.primary.host,
            self.endpoints.primary.port,
            self.endpoints.secondary.host,
            self.endpoints.secondary.port
        );
        fnv1a(canonical.as_bytes())
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    bytes
        .iter()
        .fold(OFFSET, |hash, b| (hash ^ u64::from(*b)).wrapping_mul(PRIME))
}

/// Flat wire representation of [`ConfigMessage`]
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ConfigPayload {
    primary_service_host: String,
    primary_service_port: PortValue,
    secondary_service_host: String,
    secondary_service_port: PortValue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum PortValue {
    Number(u64),
    Text(String),
}

impl PortValue {
    fn resolve(&self, field: &str) -> Result<u16> {
        let raw = match self {
            PortValue::Number(n) => *n,
            PortValue::Text(s) => s
                .trim()
                .parse::<u64>()
                .map_err(|_| Error::malformed(format!("{} is not a number: {:?}", field, s)))?,
        };
        u16::try_from(raw).map_err(|_| Error::malformed(format!("{} out of range: {}", field, raw)))
    }
}

impl From<ConfigMessage> for ConfigPayload {
    fn from(message: ConfigMessage) -> Self {
        let ServiceEndpoints { primary, secondary } = message.endpoints;
        Self {
            primary_service_host: primary.host,
            primary_service_port: PortValue::Number(u64::from(primary.port)),
            secondary_service_host: secondary.host,
            secondary_service_port: PortValue::Number(u64::from(secondary.port)),
        }
    }
}

impl TryFrom<ConfigPayload> for ConfigMessage {
    type Error = Error;

    fn try_from(payload: ConfigPayload) -> Result<Self> {
        let primary = Endpoint::new(
            payload.primary_service_host.trim(),
            payload.primary_service_port.resolve("primary_service_port")?,
        );
        let secondary = Endpoint::new(
            payload.secondary_service_host.trim(),
            payload.secondary_service_port.resolve("secondary_service_port")?,
        );
        ConfigMessage::new(ServiceEndpoints::new(primary, secondary))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn for_address_fans_out_to_both_ports() {
        let address: NetworkAddress = "192.168.1.20".parse().unwrap();
        let message = ConfigMessage::for_address(address, 1883, 5001).unwrap();

        assert_eq!(message.primary(), &Endpoint::new("192.168.1.20", 1883));
        assert_eq!(message.secondary(), &Endpoint::new("192.168.1.20", 5001));
    }

    #[test]
    fn payload_uses_flat_keys() {
        let address: NetworkAddress = "10.0.0.7".parse().unwrap();
        let message = ConfigMessage::for_address(address, 1883, 5001).unwrap();

        let payload = message.to_payload().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(value["primary_service_host"], "10.0.0.7");
        assert_eq!(value["primary_service_port"], 1883);
        assert_eq!(value["secondary_service_host"], "10.0.0.7");
        assert_eq!(value["secondary_service_port"], 5001);
    }

    #[test]
    fn parse_accepts_string_ports() {
        let payload = br#"{
            "primary_service_host": " broker.local ",
            "primary_service_port": "1883",
            "secondary_service_host": "api.local",
            "secondary_service_port": 5001
        }"#;

        let message = ConfigMessage::parse(payload).unwrap();
        assert_eq!(message.primary(), &Endpoint::new("broker.local", 1883));
        assert_eq!(message.secondary().port, 5001);
    }

    #[test]
    fn parse_rejects_malformed_payloads() {
        let primary = |host: &str, port: serde_json::Value| {
            serde_json::to_vec(&serde_json::json!({
                "primary_service_host": host,
                "primary_service_port": port,
                "secondary_service_host": "b",
                "secondary_service_port": 2
            }))
            .unwrap()
        };
        let cases: Vec<Vec<u8>> = vec![
            b"".to_vec(),
            b"not json".to_vec(),
            br#"{"primary_service_host": "a"}"#.to_vec(),
            primary("", 1.into()),
            primary("a", 0.into()),
            primary("a", 70000.into()),
            primary("a", "x".into()),
        ];

        for payload in &cases {
            let err = ConfigMessage::parse(payload).unwrap_err();
            assert!(
                matches!(err, Error::MalformedConfig(_)),
                "expected MalformedConfig for {:?}, got {:?}",
                String::from_utf8_lossy(payload),
                err
            );
        }
    }

    #[test]
    fn digest_tracks_content() {
        let a = ConfigMessage::new(ServiceEndpoints::colocated("A", 1883, 5001)).unwrap();
        let a2 = ConfigMessage::parse(&a.to_payload().unwrap()).unwrap();
        let b = ConfigMessage::new(ServiceEndpoints::colocated("B", 1883, 5001)).unwrap();

        assert_eq!(a.digest(), a2.digest());
        assert_ne!(a.digest(), b.digest());
    }

    #[test]
    fn endpoint_display_brackets_ipv6() {
        assert_eq!(Endpoint::new("fe80::1", 1883).to_string(), "[fe80::1]:1883");
        assert_eq!(Endpoint::new("10.0.0.1", 1883).to_string(), "10.0.0.1:1883");
    }
}
