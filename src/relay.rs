//! WebSocket relay server for room-scoped collaboration events.
//!
//! Architecture:
//! ```text
//! Client A ──┐                       ┌── Client A
//!             ├── RelayServer ───────┤
//! Client B ──┘        │              └── Client B
//!                     ▼
//!              RoomRegistry
//!              (code / chat / whiteboard / presence)
//! ```
//!
//! One task per connection; each event is decoded, applied to the
//! registry under a single write-lock acquisition, and fanned out to
//! the room's outboxes. Within a room, delivery order is the server's
//! processing order. Fan-out policy per event kind:
//!
//! | Event          | Targets                      |
//! |----------------|------------------------------|
//! | join           | list → everyone, notice → others, snapshots → joiner |
//! | code change    | everyone but the sender      |
//! | sync code      | one targeted connection      |
//! | cursor move    | everyone but the sender      |
//! | whiteboard     | everyone but the sender      |
//! | chat message   | everyone, sender included    |
//! | disconnect     | remaining members            |
//!
//! Outbox sends use `try_send`; a full outbox drops the frame for that
//! lagging receiver and bumps [`RelayStats::dropped_frames`].
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapter 8

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::protocol::{ClientEvent, ConnId, ServerEvent};
use crate::registry::{JoinOutcome, LeaveOutcome, Outbox, RetentionPolicy, RoomRegistry};

/// Relay server configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind to.
    pub bind_addr: String,
    /// Frames buffered per connection before drops kick in.
    pub outbox_capacity: usize,
    /// Server-side room state bounds.
    pub retention: RetentionPolicy,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:5000".to_string(),
            outbox_capacity: 256,
            retention: RetentionPolicy::default(),
        }
    }
}

/// Relay server statistics.
#[derive(Debug, Clone, Default)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_events: u64,
    pub total_bytes: u64,
    /// Frames dropped because a receiver's outbox was full.
    pub dropped_frames: u64,
}

/// The relay server.
pub struct RelayServer {
    config: RelayConfig,
    registry: Arc<RoomRegistry>,
    stats: Arc<RwLock<RelayStats>>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        let registry = Arc::new(RoomRegistry::new(config.retention.clone()));
        Self {
            config,
            registry,
            stats: Arc::new(RwLock::new(RelayStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    /// Shared registry handle, for embedding and tests.
    pub fn registry(&self) -> Arc<RoomRegistry> {
        self.registry.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub async fn stats(&self) -> RelayStats {
        self.stats.read().await.clone()
    }

    /// Accept connections forever. Call from an async runtime.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("relay listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("new relay connection from {addr}");

            let registry = self.registry.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, registry, stats, config).await
                {
                    log::warn!("relay connection from {addr} ended with error: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        registry: Arc<RoomRegistry>,
        stats: Arc<RwLock<RelayStats>>,
        config: RelayConfig,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let conn_id: ConnId = Uuid::new_v4();
        let (outbox, mut outbox_rx) = mpsc::channel::<Arc<Vec<u8>>>(config.outbox_capacity);
        registry.register(conn_id, outbox).await;

        log::info!("relay connection {conn_id} established from {addr}");
        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            {
                                let mut s = stats.write().await;
                                s.total_events += 1;
                                s.total_bytes += bytes.len() as u64;
                            }
                            match ClientEvent::decode(&bytes) {
                                Ok(event) => {
                                    Self::dispatch(conn_id, event, &registry, &stats).await;
                                }
                                Err(e) => {
                                    log::warn!("undecodable frame from {conn_id}: {e}");
                                }
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("relay connection {conn_id} closed");
                            break;
                        }
                        Some(Ok(Message::Ping(data))) => {
                            if ws_sender.send(Message::Pong(data)).await.is_err() {
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            log::warn!("relay socket error on {conn_id}: {e}");
                            break;
                        }
                        _ => {}
                    }
                }

                frame = outbox_rx.recv() => {
                    match frame {
                        Some(frame) => {
                            let send = ws_sender
                                .send(Message::Binary(frame.as_ref().clone().into()))
                                .await;
                            if send.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        }

        // Transport gone: leave the room (with notifications) and
        // unregister. Expected path, not an error.
        if let Some(leave) = registry.disconnect(conn_id).await {
            Self::announce_departure(&leave, &stats).await;
        }
        {
            let mut s = stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }

        Ok(())
    }

    /// Apply one client event and fan out the results.
    ///
    /// Exhaustive over [`ClientEvent`]; every failure mode here is a
    /// silent or logged drop, never an error surfaced to the peer.
    async fn dispatch(
        sender: ConnId,
        event: ClientEvent,
        registry: &Arc<RoomRegistry>,
        stats: &Arc<RwLock<RelayStats>>,
    ) {
        match event {
            ClientEvent::JoinRoom {
                room_id,
                display_name,
            } => {
                match registry.join(sender, &room_id, &display_name).await {
                    Some(outcome) => {
                        log::info!("{display_name} ({sender}) joined room {room_id}");
                        Self::announce_join(&outcome, stats).await;
                    }
                    None => {
                        log::debug!("invalid join from {sender} dropped");
                    }
                }
            }

            ClientEvent::CodeChange { room_id, code } => {
                if let Some(others) = registry.code_change(sender, &room_id, &code).await {
                    Self::fan_out(&ServerEvent::CodeChange { code }, &others, stats).await;
                }
            }

            ClientEvent::SyncCode { target, code } => {
                match registry.sync_code(sender, target, &code).await {
                    Some(outbox) => {
                        Self::fan_out(
                            &ServerEvent::CodeChange { code },
                            std::slice::from_ref(&outbox),
                            stats,
                        )
                        .await;
                    }
                    None => log::debug!("sync_code to unknown target {target} dropped"),
                }
            }

            ClientEvent::CursorMove { room_id, cursor } => {
                if let Some((display_name, others)) =
                    registry.cursor_targets(sender, &room_id).await
                {
                    log::trace!("cursor update from {display_name} in {room_id}");
                    Self::fan_out(
                        &ServerEvent::CursorMove {
                            conn_id: sender,
                            display_name,
                            cursor,
                        },
                        &others,
                        stats,
                    )
                    .await;
                }
            }

            ClientEvent::WhiteboardDraw { room_id, snapshot } => {
                if let Some(others) = registry.whiteboard_draw(sender, &room_id, &snapshot).await {
                    Self::fan_out(&ServerEvent::WhiteboardDraw { snapshot }, &others, stats).await;
                }
            }

            ClientEvent::SendMessage { room_id, text } => {
                if let Some((message, everyone)) =
                    registry.send_message(sender, &room_id, &text).await
                {
                    Self::fan_out(&ServerEvent::Chat(message), &everyone, stats).await;
                }
            }
        }
    }

    /// Push the member list, join notice, and state snapshots after a join.
    ///
    /// The three snapshot pushes are independent frames with no ordering
    /// guarantee relative to each other; a brand-new room sends only the
    /// whiteboard frame (empty), which is the joiner's recovery trigger.
    async fn announce_join(outcome: &JoinOutcome, stats: &Arc<RwLock<RelayStats>>) {
        if let Some(departed) = &outcome.departed {
            Self::announce_departure(departed, stats).await;
        }

        Self::fan_out(
            &ServerEvent::RoomJoined {
                conn_id: outcome.conn_id,
                room_id: outcome.room_id.clone(),
            },
            std::slice::from_ref(&outcome.joiner),
            stats,
        )
        .await;

        Self::fan_out(
            &ServerEvent::ActiveUsers {
                participants: outcome.roster.clone(),
            },
            &outcome.everyone,
            stats,
        )
        .await;

        Self::fan_out(&ServerEvent::Chat(outcome.notice.clone()), &outcome.others, stats).await;

        if !outcome.code.is_empty() {
            Self::fan_out(
                &ServerEvent::CodeChange {
                    code: outcome.code.clone(),
                },
                std::slice::from_ref(&outcome.joiner),
                stats,
            )
            .await;
        }

        if !outcome.chat.is_empty() {
            Self::fan_out(
                &ServerEvent::SyncChat {
                    messages: outcome.chat.clone(),
                },
                std::slice::from_ref(&outcome.joiner),
                stats,
            )
            .await;
        }

        Self::fan_out(
            &ServerEvent::SyncWhiteboard {
                snapshot: outcome.whiteboard.clone(),
            },
            std::slice::from_ref(&outcome.joiner),
            stats,
        )
        .await;
    }

    /// Notify a room's remaining members that one left.
    async fn announce_departure(leave: &LeaveOutcome, stats: &Arc<RwLock<RelayStats>>) {
        log::info!("{} ({}) left room {}", leave.display_name, leave.conn_id, leave.room_id);

        Self::fan_out(
            &ServerEvent::UserDisconnected {
                conn_id: leave.conn_id,
                display_name: leave.display_name.clone(),
            },
            &leave.remaining,
            stats,
        )
        .await;

        Self::fan_out(&ServerEvent::Chat(leave.notice.clone()), &leave.remaining, stats).await;

        Self::fan_out(
            &ServerEvent::ActiveUsers {
                participants: leave.roster.clone(),
            },
            &leave.remaining,
            stats,
        )
        .await;
    }

    /// Encode once, then `try_send` to each outbox. Full outboxes drop
    /// the frame for that receiver only.
    async fn fan_out(event: &ServerEvent, targets: &[Outbox], stats: &Arc<RwLock<RelayStats>>) {
        let frame = match event.encode() {
            Ok(frame) => Arc::new(frame),
            Err(e) => {
                log::error!("failed to encode server event: {e}");
                return;
            }
        };

        let mut dropped = 0u64;
        for outbox in targets {
            if outbox.try_send(frame.clone()).is_err() {
                dropped += 1;
            }
        }
        if dropped > 0 {
            log::warn!("dropped {dropped} frames on full outboxes");
            stats.write().await.dropped_frames += dropped;
        }
    }
}
