// # TCP Peer Transport
//
// PeerTransport over plain TCP. The peer id is the peer's `host:port`.
//
// ## Probe
//
// A zero-wait `peek` tells the three cases apart without consuming data:
// - EOF or socket error: the peer went away
// - data or "would block": the link is up

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, trace};

use crate::Error;
use crate::traits::peer_transport::{ConnectMethod, PeerId, PeerTransport};

// A TCP stream has one way of connecting
const TCP_METHODS: [ConnectMethod; 1] = [ConnectMethod::Insecure];

/// TCP implementation of [`PeerTransport`]
#[derive(Debug)]
pub struct TcpPeerTransport {
    streams: Mutex<HashMap<PeerId, TcpStream>>,
    connect_timeout: Duration,
}

impl TcpPeerTransport {
    pub fn new() -> Self {
        Self {
            streams: Mutex::new(HashMap::new()),
            connect_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

impl Default for TcpPeerTransport {
    fn default() -> Self {
        Self::new()
    }
}

async fn stream_is_alive(stream: &TcpStream) -> bool {
    if let Ok(Some(e)) = stream.take_error() {
        trace!("Socket error: {}", e);
        return false;
    }

    let mut buf = [0u8; 1];
    match tokio::time::timeout(Duration::ZERO, stream.peek(&mut buf)).await {
        Ok(Ok(0)) | Ok(Err(_)) => false,
        Ok(Ok(_)) => true,
        // Nothing to read yet
        Err(_) => true,
    }
}

#[async_trait]
impl PeerTransport for TcpPeerTransport {
    async fn open(&self, peer: &PeerId, method: ConnectMethod) -> Result<(), Error> {
        trace!("Opening {} via {}", peer, method);
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(peer.as_str()))
            .await
            .map_err(|_| {
                Error::transport(format!(
                    "connect to {} timed out after {:?}",
                    peer, self.connect_timeout
                ))
            })?
            .map_err(|e| Error::transport(format!("connect to {}: {}", peer, e)))?;

        stream.set_nodelay(true)?;
        self.streams.lock().await.insert(peer.clone(), stream);
        debug!("TCP link to {} open", peer);
        Ok(())
    }

    async fn close(&self, peer: &PeerId) -> Result<(), Error> {
        let stream = self.streams.lock().await.remove(peer);
        if let Some(mut stream) = stream
            && let Err(e) = stream.shutdown().await
            && e.kind() != std::io::ErrorKind::NotConnected
        {
            return Err(Error::transport(format!("close {}: {}", peer, e)));
        }
        Ok(())
    }

    async fn probe(&self, peer: &PeerId) -> Result<bool, Error> {
        let mut streams = self.streams.lock().await;
        let Some(stream) = streams.get(peer) else {
            return Ok(false);
        };

        if stream_is_alive(stream).await {
            Ok(true)
        } else {
            debug!("TCP link to {} is gone", peer);
            streams.remove(peer);
            Ok(false)
        }
    }

    async fn send_line(&self, peer: &PeerId, line: &str) -> Result<(), Error> {
        let mut streams = self.streams.lock().await;
        let Some(stream) = streams.get_mut(peer) else {
            return Err(Error::not_connected(peer.to_string()));
        };

        let mut framed = String::with_capacity(line.len() + 1);
        framed.push_str(line);
        framed.push('\n');

        let result = match stream.write_all(framed.as_bytes()).await {
            Ok(()) => stream.flush().await,
            Err(e) => Err(e),
        };

        if let Err(e) = result {
            streams.remove(peer);
            return Err(Error::transport(format!("send to {}: {}", peer, e)));
        }

        trace!("Sent {} bytes to {}", framed.len(), peer);
        Ok(())
    }

    fn connect_methods(&self) -> &[ConnectMethod] {
        &TCP_METHODS
    }

    fn transport_name(&self) -> &'static str {
        "tcp"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn send_line_appends_newline() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let peer = PeerId::new(listener.local_addr().unwrap().to_string());

        let transport = TcpPeerTransport::new();
        transport.open(&peer, ConnectMethod::Insecure).await.unwrap();
        let (socket, _) = listener.accept().await.unwrap();

        transport.send_line(&peer, "DISPENSE 1").await.unwrap();

        let mut lines = BufReader::new(socket).lines();
        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("DISPENSE 1"));
    }

    #[tokio::test]
    async fn probe_notices_peer_hangup() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let peer = PeerId::new(listener.local_addr().unwrap().to_string());

        let transport = TcpPeerTransport::new();
        transport.open(&peer, ConnectMethod::Insecure).await.unwrap();
        let (socket, _) = listener.accept().await.unwrap();
        assert!(transport.probe(&peer).await.unwrap());

        drop(socket);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!transport.probe(&peer).await.unwrap());
    }

    #[tokio::test]
    async fn unknown_peer_is_not_connected() {
        let transport = TcpPeerTransport::new();
        let peer = PeerId::new("127.0.0.1:1");

        assert!(!transport.probe(&peer).await.unwrap());
        assert!(matches!(
            transport.send_line(&peer, "x").await,
            Err(Error::NotConnected(_))
        ));
        assert!(transport.close(&peer).await.is_ok());
    }
}
