//! Document sync hub: a dumb message bus on its own port.
//!
//! ```text
//! Peer A ──┐                      ┌── Peer A
//!           ├── SyncHub ── BusMap ┤
//! Peer B ──┘      │               └── Peer B
//!                 │
//!           update backlog (replayed to late subscribers)
//! ```
//!
//! The hub forwards opaque update fragments between peers on the same
//! room-scoped channel without interpreting them — it imports no CRDT
//! library. It runs independently of the relay: the two transports can
//! fail independently, and neither knows about the other's rooms.
//!
//! Any non-upgrade HTTP request on this port gets a plain `200 OK`
//! health response, detected by peeking the request head before the
//! WebSocket handshake.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;

use crate::sync::bus::BusMap;
use crate::sync::wire::{PeerProfile, SyncKind, SyncMessage};

const HEALTH_RESPONSE: &[u8] =
    b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 4\r\n\r\nokay";

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Address to bind to.
    pub bind_addr: String,
    /// Frames buffered per lagging receiver.
    pub channel_capacity: usize,
    /// Update fragments kept per room for late subscribers.
    pub backlog_capacity: usize,
    /// Drop a room's bus and backlog once its last peer disconnects.
    pub evict_empty_rooms: bool,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:1234".to_string(),
            channel_capacity: 256,
            backlog_capacity: 1024,
            evict_empty_rooms: false,
        }
    }
}

/// Hub statistics.
#[derive(Debug, Clone, Default)]
pub struct HubStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_frames: u64,
    pub total_bytes: u64,
    pub health_checks: u64,
}

/// The sync hub server.
pub struct SyncHub {
    config: HubConfig,
    buses: Arc<BusMap>,
    stats: Arc<RwLock<HubStats>>,
}

impl SyncHub {
    pub fn new(config: HubConfig) -> Self {
        let buses = Arc::new(BusMap::new(
            config.channel_capacity,
            config.backlog_capacity,
        ));
        Self {
            config,
            buses,
            stats: Arc::new(RwLock::new(HubStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(HubConfig::default())
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub async fn stats(&self) -> HubStats {
        self.stats.read().await.clone()
    }

    /// Shared bus map, for embedding and tests.
    pub fn buses(&self) -> Arc<BusMap> {
        self.buses.clone()
    }

    /// Accept connections forever. Call from an async runtime.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("sync hub listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("new hub connection from {addr}");

            let buses = self.buses.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, buses, stats, config).await {
                    log::warn!("hub connection from {addr} ended with error: {e}");
                }
            });
        }
    }

    /// Peek the request head to tell a WebSocket upgrade from a plain
    /// HTTP request. Headers past the peek window are assumed to be an
    /// upgrade and left to the handshake to sort out.
    async fn is_upgrade_request(stream: &TcpStream) -> std::io::Result<bool> {
        let mut buf = [0u8; 2048];
        for _ in 0..50 {
            let n = stream.peek(&mut buf).await?;
            let head = &buf[..n];
            if head.windows(4).any(|w| w == b"\r\n\r\n") {
                let text = String::from_utf8_lossy(head).to_ascii_lowercase();
                return Ok(text.contains("upgrade: websocket"));
            }
            if n == buf.len() {
                return Ok(true);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        Ok(false)
    }

    async fn handle_connection(
        mut stream: TcpStream,
        addr: SocketAddr,
        buses: Arc<BusMap>,
        stats: Arc<RwLock<HubStats>>,
        config: HubConfig,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        if !Self::is_upgrade_request(&stream).await? {
            stream.write_all(HEALTH_RESPONSE).await?;
            stream.shutdown().await?;
            stats.write().await.health_checks += 1;
            log::debug!("health check from {addr}");
            return Ok(());
        }

        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        // The first frame must be a Join; anything else closes the
        // connection (a peer that skips the handshake has no room).
        let (peer_id, room, bus, mut bus_rx, backlog, join_frame) = loop {
            match ws_receiver.next().await {
                Some(Ok(Message::Binary(data))) => {
                    let bytes: Vec<u8> = data.into();
                    let msg = match SyncMessage::decode(&bytes) {
                        Ok(msg) => msg,
                        Err(e) => {
                            log::warn!("undecodable first frame from {addr}: {e}");
                            return Ok(());
                        }
                    };
                    if msg.kind != SyncKind::Join {
                        log::warn!("peer {addr} sent {:?} before Join, closing", msg.kind);
                        return Ok(());
                    }
                    let profile = msg
                        .profile()
                        .unwrap_or_else(|_| PeerProfile::with_id(msg.peer_id, "Anonymous"));
                    log::info!("peer {} ({}) joined channel {}", profile.name, msg.peer_id, msg.room);

                    let bus = buses.get_or_create(&msg.room).await;
                    let (rx, backlog) = bus.subscribe(profile).await;
                    break (msg.peer_id, msg.room, bus, rx, backlog, bytes);
                }
                Some(Ok(Message::Close(_))) | None => return Ok(()),
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    log::warn!("hub socket error from {addr}: {e}");
                    return Ok(());
                }
            }
        };

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        // Replay buffered fragments to the joiner, then re-broadcast
        // the Join so existing peers learn of the newcomer (and answer
        // with their state). A fragment the joiner also receives live
        // is a duplicate the CRDT merge absorbs.
        for fragment in backlog {
            let send = ws_sender
                .send(Message::Binary(fragment.as_ref().clone().into()))
                .await;
            if send.is_err() {
                // Dead socket; the loop below notices on first poll.
                log::debug!("backlog replay to {peer_id} interrupted");
                break;
            }
        }
        bus.publish(Arc::new(join_frame));

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            {
                                let mut s = stats.write().await;
                                s.total_frames += 1;
                                s.total_bytes += bytes.len() as u64;
                            }
                            let msg = match SyncMessage::decode(&bytes) {
                                Ok(msg) => msg,
                                Err(e) => {
                                    log::warn!("undecodable frame from {peer_id}: {e}");
                                    continue;
                                }
                            };
                            match msg.kind {
                                SyncKind::Update => {
                                    if msg.room == room {
                                        bus.publish_buffered(Arc::new(bytes)).await;
                                    } else {
                                        log::warn!("peer {peer_id} sent update for foreign room {}", msg.room);
                                    }
                                }
                                SyncKind::Cursor | SyncKind::Leave => {
                                    // Ephemeral: fan out, never buffer.
                                    if msg.room == room {
                                        bus.publish(Arc::new(bytes));
                                    }
                                }
                                SyncKind::Ping => {
                                    let pong = SyncMessage::pong(peer_id);
                                    if let Ok(frame) = pong.encode() {
                                        if ws_sender.send(Message::Binary(frame.into())).await.is_err() {
                                            break;
                                        }
                                    }
                                }
                                SyncKind::Join => {
                                    log::debug!("duplicate Join from {peer_id} ignored");
                                }
                                SyncKind::Pong => {}
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(Message::Ping(data))) => {
                            if ws_sender.send(Message::Pong(data)).await.is_err() {
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            log::warn!("hub socket error on {peer_id}: {e}");
                            break;
                        }
                        _ => {}
                    }
                }

                frame = bus_rx.recv() => {
                    match frame {
                        Ok(frame) => {
                            // Subscriber-side self-exclusion.
                            if let Ok(msg) = SyncMessage::decode(&frame) {
                                if msg.peer_id == peer_id {
                                    continue;
                                }
                            }
                            let send = ws_sender
                                .send(Message::Binary(frame.as_ref().clone().into()))
                                .await;
                            if send.is_err() {
                                break;
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("peer {peer_id} lagged by {n} frames");
                        }
                        Err(_) => break,
                    }
                }
            }
        }

        // Peer gone: synthesize Leave so awareness entries disappear.
        bus.remove_peer(&peer_id).await;
        let leave = SyncMessage::leave(peer_id, &room);
        if let Ok(frame) = leave.encode() {
            bus.publish(Arc::new(frame));
        }
        if config.evict_empty_rooms {
            buses.remove_if_empty(&room).await;
        }
        log::info!("peer {peer_id} left channel {room}");

        {
            let mut s = stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }

        Ok(())
    }
}
