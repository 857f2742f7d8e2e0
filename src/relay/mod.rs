use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::{accept_async, tungstenite::Message as WsMessage};
use tracing::{debug, info, warn};

pub type PeerId = u64;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Connected peers and the channel feeding each one's writer task
#[derive(Clone, Default)]
pub struct Registry {
    peers: Arc<RwLock<HashMap<PeerId, mpsc::UnboundedSender<WsMessage>>>>,
    next_id: Arc<AtomicU64>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a peer; the returned receiver yields everything broadcast to it
    pub async fn register(&self) -> (PeerId, mpsc::UnboundedReceiver<WsMessage>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.peers.write().await.insert(id, tx);
        (id, rx)
    }

    pub async fn remove(&self, id: PeerId) -> bool {
        self.peers.write().await.remove(&id).is_some()
    }

    pub async fn len(&self) -> usize {
        self.peers.read().await.len()
    }

    /// Forward `msg` to every peer except `from`.
    ///
    /// Peers whose writer has gone away are pruned; the rest still get the
    /// message. Returns how many peers it was queued for.
    pub async fn broadcast(&self, from: PeerId, msg: WsMessage) -> usize {
        let mut delivered = 0;
        let mut dead = Vec::new();
        {
            let peers = self.peers.read().await;
            for (id, peer_tx) in peers.iter() {
                if *id == from {
                    continue;
                }
                match peer_tx.send(msg.clone()) {
                    Ok(()) => delivered += 1,
                    Err(_) => dead.push(*id),
                }
            }
        }
        if !dead.is_empty() {
            let mut peers = self.peers.write().await;
            for id in dead {
                peers.remove(&id);
                debug!("Pruned dead peer {}", id);
            }
        }
        delivered
    }
}

/// Blind fan-out relay.
/// - Never parses payloads
/// - Every message goes to every other connected peer
/// - Stores nothing
pub struct RelayServer {
    listener: TcpListener,
    registry: Registry,
}

impl RelayServer {
    pub async fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            registry: Registry::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn registry(&self) -> Registry {
        self.registry.clone()
    }

    pub async fn run(self) -> Result<()> {
        info!("📡 Relay listening on ws://{}", self.local_addr()?);

        loop {
            let (stream, remote) = match self.listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    accept_backoff(&e).await;
                    continue;
                }
            };

            let registry = self.registry.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, remote, registry).await {
                    let err_str = e.to_string();
                    // Non-WebSocket connections (bots/scanners) are not worth a warning
                    if err_str.contains("Connection: upgrade") || err_str.contains("protocol error") {
                        debug!("Rejected {}: {}", remote, e);
                    } else {
                        warn!("Connection error from {}: {}", remote, e);
                    }
                }
            });
        }
    }
}

/// Back off after a failed accept so fd exhaustion doesn't spin the loop
async fn accept_backoff(e: &std::io::Error) {
    warn!("Accept failed: {}, retrying in {:?}", e, ACCEPT_BACKOFF);
    tokio::time::sleep(ACCEPT_BACKOFF).await;
}

async fn handle_connection(stream: TcpStream, remote: SocketAddr, registry: Registry) -> Result<()> {
    let ws_stream = accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let (peer_id, mut rx) = registry.register().await;
    let online = registry.len().await;
    info!("✅ Peer {} connected from {} ({} online)", peer_id, remote, online);

    // Writer task: drains this peer's queue into its socket
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_sender.send(msg).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = ws_receiver.next().await {
        match msg {
            Ok(msg @ (WsMessage::Text(_) | WsMessage::Binary(_))) => {
                registry.broadcast(peer_id, msg).await;
            }
            Ok(WsMessage::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("Peer {} read error: {}", peer_id, e);
                break;
            }
        }
    }

    registry.remove(peer_id).await;
    send_task.abort();
    let online = registry.len().await;
    info!("🔌 Peer {} disconnected ({} online)", peer_id, online);
    Ok(())
}

pub async fn start_relay(addr: String) -> Result<()> {
    let server = RelayServer::bind(&addr).await?;
    server.run().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Transport, WsTransport};

    async fn spawn_relay() -> (String, Registry) {
        let server = RelayServer::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", server.local_addr().unwrap());
        let registry = server.registry();
        tokio::spawn(server.run());
        (url, registry)
    }

    async fn wait_for_peers(registry: &Registry, n: usize) {
        for _ in 0..200 {
            if registry.len().await == n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let have = registry.len().await;
        panic!("expected {} peers, have {}", n, have);
    }

    #[tokio::test]
    async fn test_registry_broadcast_excludes_sender() {
        let registry = Registry::new();
        let (a, mut a_rx) = registry.register().await;
        let (_b, mut b_rx) = registry.register().await;
        let (_c, mut c_rx) = registry.register().await;

        let delivered = registry.broadcast(a, WsMessage::Text("hi".into())).await;
        assert_eq!(delivered, 2);
        assert_eq!(b_rx.recv().await.unwrap(), WsMessage::Text("hi".into()));
        assert_eq!(c_rx.recv().await.unwrap(), WsMessage::Text("hi".into()));
        assert!(a_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dead_peer_is_pruned_without_blocking_others() {
        let registry = Registry::new();
        let (a, _a_rx) = registry.register().await;
        let (_b, b_rx) = registry.register().await;
        let (_c, mut c_rx) = registry.register().await;
        drop(b_rx);

        assert_eq!(registry.broadcast(a, WsMessage::Text("x".into())).await, 1);
        assert_eq!(c_rx.recv().await.unwrap(), WsMessage::Text("x".into()));
        assert_eq!(registry.len().await, 2);
    }

    #[tokio::test]
    async fn test_accept_error_backs_off() {
        let err = std::io::Error::from_raw_os_error(24); // EMFILE
        let start = std::time::Instant::now();
        accept_backoff(&err).await;
        assert!(start.elapsed() >= ACCEPT_BACKOFF);
    }

    #[tokio::test]
    async fn test_fan_out_over_websockets() {
        let (url, registry) = spawn_relay().await;

        let mut a = WsTransport::connect(&url).await.unwrap();
        let mut b = WsTransport::connect(&url).await.unwrap();
        let mut c = WsTransport::connect(&url).await.unwrap();
        wait_for_peers(&registry, 3).await;

        a.send("from a".to_string()).await.unwrap();
        assert_eq!(b.recv().await.unwrap().as_deref(), Some("from a"));
        assert_eq!(c.recv().await.unwrap().as_deref(), Some("from a"));

        // Nothing echoed back to the sender
        let echoed = tokio::time::timeout(Duration::from_millis(200), a.recv()).await;
        assert!(echoed.is_err());
    }

    #[tokio::test]
    async fn test_disconnect_is_pruned() {
        let (url, registry) = spawn_relay().await;

        let mut a = WsTransport::connect(&url).await.unwrap();
        let mut b = WsTransport::connect(&url).await.unwrap();
        wait_for_peers(&registry, 2).await;

        b.close().await.unwrap();
        wait_for_peers(&registry, 1).await;

        // Relay keeps serving the remaining peer
        let mut c = WsTransport::connect(&url).await.unwrap();
        wait_for_peers(&registry, 2).await;
        c.send("still here".to_string()).await.unwrap();
        assert_eq!(a.recv().await.unwrap().as_deref(), Some("still here"));
    }
}
