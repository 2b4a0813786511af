//! Device agent demo
//!
//! Runs a `DeviceAgent` against a real MQTT broker, with TCP connections
//! standing in for the device's service links. Start it, then move the
//! host (or publish an override with `hostcfgd`) and watch the agent drop
//! its connections and reconnect to the new address.
//!
//! ```bash
//! HOSTCFG_BROKER_HOST=10.0.0.2 HOSTCFG_GROUP=ward-a HOSTCFG_DEVICE_ID=dispenser-1 \
//!     HOSTCFG_DEFAULT_HOST=10.0.0.2 cargo run --bin device_agent
//! ```

use anyhow::Context;
use async_trait::async_trait;
use hostcfg_broker_mqtt::{MqttBroker, MqttConfig};
use hostcfg_core::config::{config_topic, status_topic};
use hostcfg_core::traits::{ConfigBroker, ConfigStore, ServiceLink};
use hostcfg_core::{
    DeviceAgent, DeviceAgentConfig, Endpoint, FileConfigStore, MemoryConfigStore, ServiceEndpoints,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{Level, debug, info, warn};
use tracing_subscriber::FmtSubscriber;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// TCP connections to both services; either one closing drops the link
struct TcpServiceLink {
    connected: Arc<AtomicBool>,
    watchers: Mutex<Vec<JoinHandle<()>>>,
}

impl TcpServiceLink {
    fn new() -> Self {
        Self {
            connected: Arc::new(AtomicBool::new(false)),
            watchers: Mutex::new(Vec::new()),
        }
    }

    fn stop_watchers(&self) {
        let watchers = std::mem::take(
            &mut *self.watchers.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for watcher in watchers {
            watcher.abort();
        }
    }

    fn watch(&self, endpoint: &Endpoint, mut stream: TcpStream) -> JoinHandle<()> {
        let connected = Arc::clone(&self.connected);
        let endpoint = endpoint.to_string();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            loop {
                match stream.read(&mut buf).await {
                    Ok(0) => {
                        debug!("{} closed the connection", endpoint);
                        break;
                    }
                    Ok(n) => debug!("{} sent {} bytes", endpoint, n),
                    Err(e) => {
                        debug!("{} connection error: {}", endpoint, e);
                        break;
                    }
                }
            }
            connected.store(false, Ordering::SeqCst);
        })
    }
}

#[async_trait]
impl ServiceLink for TcpServiceLink {
    async fn connect(&self, endpoints: &ServiceEndpoints) -> hostcfg_core::Result<()> {
        self.stop_watchers();
        self.connected.store(false, Ordering::SeqCst);

        // Streams stay local until both are up; a dropped attempt leaves nothing behind
        let primary = open_stream(&endpoints.primary).await?;
        let secondary = open_stream(&endpoints.secondary).await?;

        self.connected.store(true, Ordering::SeqCst);
        let watchers = vec![
            self.watch(&endpoints.primary, primary),
            self.watch(&endpoints.secondary, secondary),
        ];
        *self.watchers.lock().unwrap_or_else(PoisonError::into_inner) = watchers;
        Ok(())
    }

    async fn close(&self) {
        self.stop_watchers();
        self.connected.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Connect with its own deadline; the agent never cuts an attempt short
async fn open_stream(endpoint: &Endpoint) -> hostcfg_core::Result<TcpStream> {
    match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(endpoint.to_string())).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(hostcfg_core::Error::reconnect(format!("{}: {}", endpoint, e))),
        Err(_) => Err(hostcfg_core::Error::reconnect(format!(
            "{}: no answer within {:?}",
            endpoint, CONNECT_TIMEOUT
        ))),
    }
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let subscriber = FmtSubscriber::builder().with_max_level(Level::INFO).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let broker_host = env_or("HOSTCFG_BROKER_HOST", "127.0.0.1");
    let broker_port: u16 = env_or("HOSTCFG_BROKER_PORT", "1883")
        .parse()
        .context("HOSTCFG_BROKER_PORT")?;
    let group = env_or("HOSTCFG_GROUP", "ward-a");
    let device_id = env_or("HOSTCFG_DEVICE_ID", "dispenser-1");
    let default_host = env_or("HOSTCFG_DEFAULT_HOST", &broker_host);

    let config = DeviceAgentConfig::new(
        config_topic(&group),
        device_id.clone(),
        ServiceEndpoints::colocated(default_host, 1883, 5001),
    );

    let store: Box<dyn ConfigStore> = match std::env::var("HOSTCFG_STATE_PATH") {
        Ok(path) => Box::new(FileConfigStore::new(path).await?),
        Err(_) => Box::new(MemoryConfigStore::new()),
    };

    let status = status_topic(&device_id);
    let broker_config = MqttConfig::new(broker_host, broker_port, device_id.clone())
        .with_last_will(&status, "offline")
        .with_birth(&status, "online");
    let broker = Arc::new(MqttBroker::connect(broker_config)?);

    let feed = broker.subscribe(&config.topic).await?;
    let mut agent = DeviceAgent::with_store(Box::new(TcpServiceLink::new()), store, config).await?;

    if !broker.wait_connected(Duration::from_secs(5)).await {
        warn!("Broker not reachable yet; running on {}", agent.state().active.primary);
    }

    agent.run(feed).await?;

    if broker.is_connected()
        && let Err(e) = broker.publish(&status, b"offline".to_vec(), true).await
    {
        warn!("Failed to publish offline status: {}", e);
    }
    broker.shutdown().await;

    info!(
        "Stopped after {} connect attempt(s); last host {}",
        agent.connect_attempts(),
        agent.state().active_host()
    );
    Ok(())
}
