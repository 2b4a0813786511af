// # Peer Liveness
//
// Peers announce themselves on `<prefix>/<peer>/status` (usually as a
// retained message plus a last-will). The payload is either a bare word or a
// small JSON object:
//
// ```text
// online
// offline
// {"status": "online"}
// ```
//
// A peer reported offline is not worth a hardware check. A peer we have
// never heard about is.
//
// Status topics name devices, while the controller addresses peers by their
// hardware id (or `host:port`). `LivenessTracker::bind()` maps one to the
// other; an unbound peer is looked up under its own id.

use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::oneshot;
use tokio_stream::StreamExt;
use tracing::{debug, trace};

use crate::config::TOPIC_PREFIX;
use crate::traits::{BrokerMessage, MessageStream, PeerId};

/// Liveness last reported by a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Liveness {
    Online,
    Offline,
}

#[derive(Deserialize)]
struct StatusPayload {
    status: String,
}

impl Liveness {
    /// Parse a status payload; `None` when it says neither online nor offline
    pub fn parse(payload: &[u8]) -> Option<Self> {
        let text = std::str::from_utf8(payload).ok()?.trim();
        let word = if text.starts_with('{') {
            serde_json::from_str::<StatusPayload>(text).ok()?.status
        } else {
            text.trim_matches('"').to_string()
        };

        match word.to_ascii_lowercase().as_str() {
            "online" | "up" | "connected" => Some(Self::Online),
            "offline" | "down" | "disconnected" => Some(Self::Offline),
            _ => None,
        }
    }
}

/// Device id carried by a status topic
fn device_from_topic(topic: &str) -> Option<&str> {
    let mut levels = topic.split('/');
    match (levels.next(), levels.next(), levels.next(), levels.next()) {
        (Some(prefix), Some(device), Some("status"), None)
            if prefix == TOPIC_PREFIX && !device.is_empty() =>
        {
            Some(device)
        }
        _ => None,
    }
}

#[derive(Debug, Default)]
struct TrackerState {
    /// Latest status per device id
    statuses: HashMap<String, Liveness>,
    /// Device id announcing for a peer
    bindings: HashMap<PeerId, String>,
}

/// Liveness of every device seen on the status topics
///
/// Clones share the same table.
#[derive(Debug, Clone, Default)]
pub struct LivenessTracker {
    inner: Arc<RwLock<TrackerState>>,
}

impl LivenessTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look `peer` up under the status topic of `device_id`
    pub fn bind(&self, peer: PeerId, device_id: impl Into<String>) {
        let device_id = device_id.into();
        debug!("Peer {} reports status as {}", peer, device_id);
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .bindings
            .insert(peer, device_id);
    }

    /// Device id whose status applies to `peer`
    pub fn device_id(&self, peer: &PeerId) -> String {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .bindings
            .get(peer)
            .cloned()
            .unwrap_or_else(|| peer.as_str().to_string())
    }

    /// Record one status message
    ///
    /// Returns whether the message was understood. An empty payload (a
    /// cleared retained status) forgets the peer.
    pub fn ingest(&self, message: &BrokerMessage) -> bool {
        let Some(device) = device_from_topic(&message.topic) else {
            trace!("Ignoring non-status topic {}", message.topic);
            return false;
        };

        let mut state = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if message.payload.is_empty() {
            state.statuses.remove(device);
            return true;
        }

        match Liveness::parse(&message.payload) {
            Some(liveness) => {
                if state.statuses.insert(device.to_string(), liveness) != Some(liveness) {
                    debug!("Device {} reported {:?}", device, liveness);
                }
                true
            }
            None => {
                debug!(
                    "Unrecognised status from {}: {:?}",
                    device,
                    String::from_utf8_lossy(&message.payload)
                );
                false
            }
        }
    }

    /// Last reported liveness of `peer`
    pub fn liveness(&self, peer: &PeerId) -> Option<Liveness> {
        let state = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let device = state
            .bindings
            .get(peer)
            .map(String::as_str)
            .unwrap_or(peer.as_str());
        state.statuses.get(device).copied()
    }

    /// Whether a hardware check against `peer` is worth attempting
    pub fn is_reachable(&self, peer: &PeerId) -> bool {
        self.liveness(peer) != Some(Liveness::Offline)
    }

    /// Consume a status subscription until it ends or `shutdown_rx` fires
    pub async fn follow(
        &self,
        mut stream: MessageStream,
        shutdown_rx: Option<oneshot::Receiver<()>>,
    ) {
        let shutdown = async move {
            match shutdown_rx {
                Some(rx) => {
                    let _ = rx.await;
                }
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                message = stream.next() => match message {
                    Some(message) => {
                        self.ingest(&message);
                    }
                    None => {
                        debug!("Status subscription ended");
                        break;
                    }
                },
                _ = &mut shutdown => break,
            }
        }
    }
}
