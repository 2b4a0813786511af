// # hostcfgd - host configuration daemon
//
// Thin wiring around hostcfg-core on the machine that runs the services:
// samples this host's address, publishes it retained to the group's config
// topic, and keeps doing so until SIGTERM/SIGINT.
//
// All convergence logic lives in hostcfg-core. Configuration is via
// environment variables only.
//
// ## Configuration
//
// ### Broker
// - `HOSTCFG_BROKER_HOST`: MQTT broker host (default 127.0.0.1)
// - `HOSTCFG_BROKER_PORT`: MQTT broker port (default 1883)
// - `HOSTCFG_BROKER_USERNAME` / `HOSTCFG_BROKER_PASSWORD`: optional credentials
// - `HOSTCFG_CLIENT_ID`: MQTT client id (default hostcfgd)
//
// ### Published config
// - `HOSTCFG_GROUP`: device group; the topic is `hostcfg/<group>/config`
// - `HOSTCFG_PRIMARY_PORT`: primary service port (default 1883)
// - `HOSTCFG_SECONDARY_PORT`: secondary service port (default 5001)
//
// ### Address observer
// - `HOSTCFG_PROBE_TARGET`: address the route probe aims at (default 192.0.2.1:9)
// - `HOSTCFG_SAMPLE_INTERVAL_SECS`: seconds between samples (default 10)
//
// ### Manual override
// - `HOSTCFG_OVERRIDE_HOST`: publish this host once, retained, and exit
//
// ### Logging
// - `HOSTCFG_LOG_LEVEL`: trace, debug, info, warn, error (default info)
//
// ## Example
//
// ```bash
// export HOSTCFG_BROKER_HOST=10.0.0.2
// export HOSTCFG_GROUP=ward-a
// hostcfgd
// ```

use anyhow::{Context, Result};
use hostcfg_addr_probe::RouteProbe;
use hostcfg_broker_mqtt::{MqttBroker, MqttConfig};
use hostcfg_core::config::config_topic;
use hostcfg_core::{
    ConfigMessage, ConfigPublisher, PublisherConfig, PublisherEvent, ServiceEndpoints,
};
use std::env;
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::FmtSubscriber;

#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};

/// How long the one-shot override waits for the broker
const OVERRIDE_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Exit codes (systemd conventions)
#[derive(Debug, Clone, Copy)]
enum HostcfgExitCode {
    CleanShutdown = 0,
    ConfigError = 1,
    RuntimeError = 2,
}

impl From<HostcfgExitCode> for ExitCode {
    fn from(code: HostcfgExitCode) -> Self {
        ExitCode::from(code as u8)
    }
}

struct Config {
    broker_host: String,
    broker_port: u16,
    broker_username: Option<String>,
    broker_password: Option<String>,
    client_id: String,
    group: String,
    primary_port: u16,
    secondary_port: u16,
    probe_target: String,
    sample_interval_secs: u64,
    override_host: Option<String>,
    log_level: String,
}

fn parse_var<T: FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("{} is not valid ({}): {}", name, raw, e)),
        Err(_) => Ok(default),
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

impl Config {
    /// Load configuration from environment variables
    fn from_env() -> Result<Self> {
        Ok(Self {
            broker_host: non_empty_var("HOSTCFG_BROKER_HOST")
                .unwrap_or_else(|| "127.0.0.1".to_string()),
            broker_port: parse_var("HOSTCFG_BROKER_PORT", 1883)?,
            broker_username: non_empty_var("HOSTCFG_BROKER_USERNAME"),
            broker_password: env::var("HOSTCFG_BROKER_PASSWORD").ok(),
            client_id: non_empty_var("HOSTCFG_CLIENT_ID").unwrap_or_else(|| "hostcfgd".to_string()),
            group: env::var("HOSTCFG_GROUP")
                .context("HOSTCFG_GROUP is required. Set it via: export HOSTCFG_GROUP=ward-a")?,
            primary_port: parse_var("HOSTCFG_PRIMARY_PORT", 1883)?,
            secondary_port: parse_var("HOSTCFG_SECONDARY_PORT", 5001)?,
            probe_target: non_empty_var("HOSTCFG_PROBE_TARGET")
                .unwrap_or_else(|| hostcfg_addr_probe::DEFAULT_PROBE_TARGET.to_string()),
            sample_interval_secs: parse_var("HOSTCFG_SAMPLE_INTERVAL_SECS", 10)?,
            override_host: non_empty_var("HOSTCFG_OVERRIDE_HOST"),
            log_level: env::var("HOSTCFG_LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }

    fn validate(&self) -> Result<()> {
        let group = self.group.trim();
        if group.is_empty() {
            anyhow::bail!("HOSTCFG_GROUP cannot be empty");
        }
        if group.contains(['/', '+', '#']) {
            anyhow::bail!(
                "HOSTCFG_GROUP must be a single topic level without wildcards. Got: {}",
                group
            );
        }

        if self.broker_port == 0 {
            anyhow::bail!("HOSTCFG_BROKER_PORT must be > 0");
        }
        if self.primary_port == 0 || self.secondary_port == 0 {
            anyhow::bail!("HOSTCFG_PRIMARY_PORT and HOSTCFG_SECONDARY_PORT must be > 0");
        }

        if self.broker_password.is_some() && self.broker_username.is_none() {
            anyhow::bail!("HOSTCFG_BROKER_PASSWORD is set but HOSTCFG_BROKER_USERNAME is not");
        }

        if !(1..=3600).contains(&self.sample_interval_secs) {
            anyhow::bail!(
                "HOSTCFG_SAMPLE_INTERVAL_SECS must be between 1 and 3600 seconds. Got: {}",
                self.sample_interval_secs
            );
        }

        RouteProbe::parse(&self.probe_target).map_err(|e| {
            anyhow::anyhow!("HOSTCFG_PROBE_TARGET '{}' is not valid: {}", self.probe_target, e)
        })?;

        match self.log_level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => anyhow::bail!(
                "HOSTCFG_LOG_LEVEL '{}' is not valid. \
                Valid levels: trace, debug, info, warn, error",
                self.log_level
            ),
        }

        Ok(())
    }

    fn topic(&self) -> String {
        config_topic(self.group.trim())
    }

    fn mqtt(&self) -> MqttConfig {
        let mut mqtt = MqttConfig::new(&self.broker_host, self.broker_port, &self.client_id);
        mqtt.username = self.broker_username.clone();
        mqtt.password = self.broker_password.clone();
        mqtt
    }

    fn publisher(&self) -> PublisherConfig {
        let mut publisher = PublisherConfig::new(self.topic())
            .with_ports(self.primary_port, self.secondary_port);
        publisher.sample_interval_secs = self.sample_interval_secs;
        publisher
    }
}

fn main() -> ExitCode {
    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            return HostcfgExitCode::ConfigError.into();
        }
    };

    if let Err(e) = config.validate() {
        eprintln!("Configuration validation error: {}", e);
        return HostcfgExitCode::ConfigError.into();
    }

    let log_level = match config.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder().with_max_level(log_level).finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
        return HostcfgExitCode::ConfigError.into();
    }

    info!("Starting hostcfgd for topic {}", config.topic());

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to create tokio runtime: {}", e);
            return HostcfgExitCode::RuntimeError.into();
        }
    };

    let result = rt.block_on(async {
        let outcome = match config.override_host.clone() {
            Some(host) => publish_override(&config, &host).await,
            None => run_daemon(&config).await,
        };
        match outcome {
            Ok(()) => HostcfgExitCode::CleanShutdown,
            Err(e) => {
                error!("Daemon error: {:#}", e);
                HostcfgExitCode::RuntimeError
            }
        }
    });

    result.into()
}

async fn run_daemon(config: &Config) -> Result<()> {
    let probe = RouteProbe::parse(&config.probe_target)?;
    let broker = Arc::new(MqttBroker::connect(config.mqtt())?);

    let (mut publisher, mut events) =
        ConfigPublisher::new(Box::new(probe), broker.clone(), config.publisher())?;

    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                PublisherEvent::PublishFailed { address, error } => {
                    warn!("Publish of {} failed: {}", address, error)
                }
                other => debug!("Publisher event: {:?}", other),
            }
        }
    });

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    let handle = tokio::spawn(async move { publisher.run_with_shutdown(Some(shutdown_rx)).await });

    let signal = wait_for_shutdown().await?;
    info!("Received {}, shutting down", signal);

    // The publisher may already have stopped on its own error
    let _ = shutdown_tx.send(());
    let result = handle.await.context("publisher task panicked")?;
    broker.shutdown().await;

    result.map_err(Into::into)
}

async fn publish_override(config: &Config, host: &str) -> Result<()> {
    let message = ConfigMessage::new(ServiceEndpoints::colocated(
        host,
        config.primary_port,
        config.secondary_port,
    ))
    .context("HOSTCFG_OVERRIDE_HOST does not form a valid config")?;

    let broker = Arc::new(MqttBroker::connect(config.mqtt())?);
    if !broker.wait_connected(OVERRIDE_CONNECT_TIMEOUT).await {
        broker.shutdown().await;
        anyhow::bail!(
            "broker {}:{} not reachable within {:?}",
            config.broker_host,
            config.broker_port,
            OVERRIDE_CONNECT_TIMEOUT
        );
    }

    let probe = RouteProbe::parse(&config.probe_target)?;
    let (publisher, _events) =
        ConfigPublisher::new(Box::new(probe), broker.clone(), config.publisher())?;
    let published = publisher.publish_override(&message).await;

    // Give the event loop a moment to flush the queued publish
    tokio::time::sleep(Duration::from_millis(500)).await;
    broker.shutdown().await;

    published?;
    info!("Override {} published to {}", message.primary(), config.topic());
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown() -> Result<&'static str> {
    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| anyhow::anyhow!("Failed to setup SIGTERM handler: {}", e))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| anyhow::anyhow!("Failed to setup SIGINT handler: {}", e))?;

    Ok(tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    })
}

#[cfg(not(unix))]
async fn wait_for_shutdown() -> Result<&'static str> {
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to wait for CTRL-C: {}", e))?;
    Ok("SIGINT")
}
