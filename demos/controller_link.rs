//! Controller link demo
//!
//! Pairs with one peer over TCP and keeps a cached connection status that
//! the "screen" (the status line printed every second) reads without
//! touching the socket. Liveness comes from the broker's status topics.
//!
//! Commands on stdin:
//! - `fg` / `bg`: foreground or background the app
//! - `verify`: verify the peer now
//! - `disconnect`: drop the peer
//! - anything else: sent to the peer as one line
//!
//! ```bash
//! HOSTCFG_PEER=10.0.0.31:7000 HOSTCFG_PEER_DEVICE_ID=dispenser-1 HOSTCFG_BROKER_HOST=10.0.0.2 \
//!     cargo run --bin controller_link
//! ```

use anyhow::Context;
use hostcfg_broker_mqtt::{MqttBroker, MqttConfig};
use hostcfg_core::config::status_filter;
use hostcfg_core::traits::{ConfigBroker, PeerId};
use hostcfg_core::{
    AppLifecycle, ConnectionCache, LinkConfig, LivenessTracker, TcpPeerTransport,
    VerificationScheduler,
};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{Level, info, warn};
use tracing_subscriber::FmtSubscriber;

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let subscriber = FmtSubscriber::builder().with_max_level(Level::INFO).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let peer = PeerId::new(env_or("HOSTCFG_PEER", "127.0.0.1:7000"));
    let broker_host = env_or("HOSTCFG_BROKER_HOST", "127.0.0.1");
    let broker_port: u16 = env_or("HOSTCFG_BROKER_PORT", "1883")
        .parse()
        .context("HOSTCFG_BROKER_PORT")?;

    let liveness = LivenessTracker::new();
    liveness.bind(peer.clone(), env_or("HOSTCFG_PEER_DEVICE_ID", "dispenser-1"));

    let broker_config = MqttConfig::new(broker_host, broker_port, "controller-link");
    let broker = MqttBroker::connect(broker_config)?;
    let statuses = broker.subscribe(&status_filter()).await?;
    let follower = {
        let liveness = liveness.clone();
        tokio::spawn(async move { liveness.follow(statuses, None).await })
    };

    let cache = ConnectionCache::with_liveness(
        Box::new(TcpPeerTransport::new()),
        LinkConfig::default(),
        liveness,
    )?;

    if let Err(e) = cache.connect(&peer).await {
        warn!("Initial connect to {} failed: {}", peer, e);
    }

    let lifecycle = AppLifecycle::new(true);
    let scheduler = VerificationScheduler::new(cache.clone(), lifecycle.clone());
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    let scheduler_task =
        tokio::spawn(async move { scheduler.run_with_shutdown(Some(shutdown_rx)).await });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut screen = tokio::time::interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            _ = screen.tick() => {
                info!(
                    "{}: connected={} confidence={:?}",
                    peer,
                    cache.cached_status(&peer),
                    cache.confidence(&peer)
                );
            }
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match line.trim() {
                    "" => {}
                    "fg" => lifecycle.set_foreground(true),
                    "bg" => lifecycle.set_foreground(false),
                    "verify" => info!("verified: {}", cache.verify_now(&peer).await),
                    "disconnect" => {
                        if let Err(e) = cache.disconnect(&peer).await {
                            warn!("Disconnect: {}", e);
                        }
                    }
                    command => {
                        if !cache.cached_status(&peer)
                            && let Err(e) = cache.connect(&peer).await
                        {
                            warn!("Reconnect to {} failed: {}", peer, e);
                            continue;
                        }
                        if let Err(e) = cache.send_line(&peer, command).await {
                            warn!("Send failed: {}", e);
                        }
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    let _ = shutdown_tx.send(());
    scheduler_task.await??;
    follower.abort();
    if let Err(e) = cache.disconnect(&peer).await {
        warn!("Disconnect: {}", e);
    }
    broker.shutdown().await;
    Ok(())
}
