//! Test doubles and common utilities for contract tests
//!
//! Each double keeps its observable state behind `Arc`s so a test can hand
//! one instance to the component under test and keep a handle created with
//! `sharing_counters_with` for assertions.

#![allow(dead_code)]

use hostcfg_core::config::config_topic;
use hostcfg_core::error::{Error, Result};
use hostcfg_core::traits::{AddressSource, ConnectMethod, PeerId, PeerTransport, ServiceLink};
use hostcfg_core::{
    DeviceAgentConfig, LinkConfig, NetworkAddress, ReconnectPolicy, ServiceEndpoints,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const GROUP: &str = "ward-a";
pub const PRIMARY_PORT: u16 = 1883;
pub const SECONDARY_PORT: u16 = 5001;

pub fn topic() -> String {
    config_topic(GROUP)
}

pub fn endpoints(host: &str) -> ServiceEndpoints {
    ServiceEndpoints::colocated(host, PRIMARY_PORT, SECONDARY_PORT)
}

/// Wire payload pointing both services at `host`
pub fn config_payload(host: &str) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "primary_service_host": host,
        "primary_service_port": PRIMARY_PORT,
        "secondary_service_host": host,
        "secondary_service_port": SECONDARY_PORT,
    }))
    .expect("config payload serializes")
}

/// Agent config with fast ticks and short backoff
pub fn agent_config(default_host: &str) -> DeviceAgentConfig {
    let mut config = DeviceAgentConfig::new(topic(), "dispenser-1", endpoints(default_host))
        .with_reconnect(ReconnectPolicy {
            initial_backoff_ms: 40,
            multiplier: 2,
            max_backoff_secs: 1,
        })
        .with_tick_budget(Duration::from_millis(200));
    config.tick_interval_ms = 10;
    config
}

pub fn link_config() -> LinkConfig {
    LinkConfig {
        verify_interval_secs: 1,
        verify_timeout_ms: 100,
    }
}

/// An AddressSource whose answer the test sets
pub struct ScriptedAddressSource {
    current: Arc<Mutex<Option<NetworkAddress>>>,
    failing: Arc<AtomicBool>,
    sample_count: Arc<AtomicUsize>,
}

impl ScriptedAddressSource {
    pub fn new(initial: Option<&str>) -> Self {
        Self {
            current: Arc::new(Mutex::new(initial.map(|a| a.parse().unwrap()))),
            failing: Arc::new(AtomicBool::new(false)),
            sample_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn sharing_counters_with(other: &Self) -> Self {
        Self {
            current: Arc::clone(&other.current),
            failing: Arc::clone(&other.failing),
            sample_count: Arc::clone(&other.sample_count),
        }
    }

    /// Set the address returned by the next samples (`None`: NotFound)
    pub fn set(&self, address: Option<&str>) {
        *self.current.lock().unwrap() = address.map(|a| a.parse().unwrap());
    }

    /// Make the probe itself fail
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn sample_count(&self) -> usize {
        self.sample_count.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl AddressSource for ScriptedAddressSource {
    async fn sample(&self) -> Result<Option<NetworkAddress>> {
        self.sample_count.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::address_unavailable("probe failed"));
        }
        Ok(*self.current.lock().unwrap())
    }

    fn source_name(&self) -> &'static str {
        "scripted"
    }
}

/// A ServiceLink that records every connect and close
pub struct CountingServiceLink {
    connected: Arc<AtomicBool>,
    connect_count: Arc<AtomicUsize>,
    close_count: Arc<AtomicUsize>,
    attempts: Arc<Mutex<Vec<ServiceEndpoints>>>,
    failures_remaining: Arc<AtomicUsize>,
    unreachable_hosts: Arc<Mutex<HashSet<String>>>,
    connect_delay: Arc<Mutex<Duration>>,
}

impl CountingServiceLink {
    pub fn new() -> Self {
        Self {
            connected: Arc::new(AtomicBool::new(false)),
            connect_count: Arc::new(AtomicUsize::new(0)),
            close_count: Arc::new(AtomicUsize::new(0)),
            attempts: Arc::new(Mutex::new(Vec::new())),
            failures_remaining: Arc::new(AtomicUsize::new(0)),
            unreachable_hosts: Arc::new(Mutex::new(HashSet::new())),
            connect_delay: Arc::new(Mutex::new(Duration::ZERO)),
        }
    }

    pub fn sharing_counters_with(other: &Self) -> Self {
        Self {
            connected: Arc::clone(&other.connected),
            connect_count: Arc::clone(&other.connect_count),
            close_count: Arc::clone(&other.close_count),
            attempts: Arc::clone(&other.attempts),
            failures_remaining: Arc::clone(&other.failures_remaining),
            unreachable_hosts: Arc::clone(&other.unreachable_hosts),
            connect_delay: Arc::clone(&other.connect_delay),
        }
    }

    /// Fail the next `n` connect attempts
    pub fn fail_next(&self, n: usize) {
        self.failures_remaining.store(n, Ordering::SeqCst);
    }

    /// Refuse connections to `host` until further notice
    pub fn set_unreachable(&self, host: &str, unreachable: bool) {
        let mut hosts = self.unreachable_hosts.lock().unwrap();
        if unreachable {
            hosts.insert(host.to_string());
        } else {
            hosts.remove(host);
        }
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        *self.connect_delay.lock().unwrap() = delay;
    }

    /// Simulate the remote side dropping the link
    pub fn drop_link(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    pub fn connect_count(&self) -> usize {
        self.connect_count.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }

    /// Primary hosts of every connect attempt, in order
    pub fn attempted_hosts(&self) -> Vec<String> {
        self.attempts
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.primary.host.clone())
            .collect()
    }

    pub fn last_attempt(&self) -> Option<ServiceEndpoints> {
        self.attempts.lock().unwrap().last().cloned()
    }
}

#[async_trait::async_trait]
impl ServiceLink for CountingServiceLink {
    async fn connect(&self, endpoints: &ServiceEndpoints) -> Result<()> {
        self.connect_count.fetch_add(1, Ordering::SeqCst);
        self.attempts.lock().unwrap().push(endpoints.clone());

        let delay = *self.connect_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if self
            .unreachable_hosts
            .lock()
            .unwrap()
            .contains(&endpoints.primary.host)
        {
            return Err(Error::reconnect(format!("{} unreachable", endpoints.primary)));
        }

        let remaining = self.failures_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_remaining.store(remaining - 1, Ordering::SeqCst);
            return Err(Error::reconnect("connection refused"));
        }

        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) {
        self.close_count.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// A PeerTransport with scripted outcomes
pub struct ScriptedPeerTransport {
    opens: Arc<Mutex<Vec<(PeerId, ConnectMethod)>>>,
    closes: Arc<Mutex<Vec<PeerId>>>,
    failing_methods: Arc<Mutex<HashSet<ConnectMethod>>>,
    hardware_connected: Arc<AtomicBool>,
    probe_count: Arc<AtomicUsize>,
    probe_delay: Arc<Mutex<Duration>>,
    send_fails: Arc<AtomicBool>,
    sent: Arc<Mutex<Vec<String>>>,
}

impl ScriptedPeerTransport {
    pub fn new() -> Self {
        Self {
            opens: Arc::new(Mutex::new(Vec::new())),
            closes: Arc::new(Mutex::new(Vec::new())),
            failing_methods: Arc::new(Mutex::new(HashSet::new())),
            hardware_connected: Arc::new(AtomicBool::new(false)),
            probe_count: Arc::new(AtomicUsize::new(0)),
            probe_delay: Arc::new(Mutex::new(Duration::ZERO)),
            send_fails: Arc::new(AtomicBool::new(false)),
            sent: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn sharing_counters_with(other: &Self) -> Self {
        Self {
            opens: Arc::clone(&other.opens),
            closes: Arc::clone(&other.closes),
            failing_methods: Arc::clone(&other.failing_methods),
            hardware_connected: Arc::clone(&other.hardware_connected),
            probe_count: Arc::clone(&other.probe_count),
            probe_delay: Arc::clone(&other.probe_delay),
            send_fails: Arc::clone(&other.send_fails),
            sent: Arc::clone(&other.sent),
        }
    }

    pub fn fail_method(&self, method: ConnectMethod) {
        self.failing_methods.lock().unwrap().insert(method);
    }

    /// What the hardware will report on the next probe
    pub fn set_hardware_connected(&self, connected: bool) {
        self.hardware_connected.store(connected, Ordering::SeqCst);
    }

    pub fn set_probe_delay(&self, delay: Duration) {
        *self.probe_delay.lock().unwrap() = delay;
    }

    pub fn set_send_fails(&self, fails: bool) {
        self.send_fails.store(fails, Ordering::SeqCst);
    }

    pub fn opened_methods(&self) -> Vec<ConnectMethod> {
        self.opens.lock().unwrap().iter().map(|(_, m)| *m).collect()
    }

    pub fn closed_peers(&self) -> Vec<PeerId> {
        self.closes.lock().unwrap().clone()
    }

    pub fn probe_count(&self) -> usize {
        self.probe_count.load(Ordering::SeqCst)
    }

    pub fn sent_lines(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl PeerTransport for ScriptedPeerTransport {
    async fn open(&self, peer: &PeerId, method: ConnectMethod) -> Result<()> {
        self.opens.lock().unwrap().push((peer.clone(), method));
        if self.failing_methods.lock().unwrap().contains(&method) {
            return Err(Error::transport(format!("{} refused", method)));
        }
        self.hardware_connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self, peer: &PeerId) -> Result<()> {
        self.closes.lock().unwrap().push(peer.clone());
        self.hardware_connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn probe(&self, _peer: &PeerId) -> Result<bool> {
        self.probe_count.fetch_add(1, Ordering::SeqCst);
        let delay = *self.probe_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(self.hardware_connected.load(Ordering::SeqCst))
    }

    async fn send_line(&self, peer: &PeerId, line: &str) -> Result<()> {
        if self.send_fails.load(Ordering::SeqCst) {
            return Err(Error::transport(format!("broken pipe to {}", peer)));
        }
        self.sent.lock().unwrap().push(line.to_string());
        Ok(())
    }

    fn transport_name(&self) -> &'static str {
        "scripted"
    }
}
