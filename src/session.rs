//! Client-side room session: reconnection state machine, join
//! reconciliation, whiteboard debounce and recovery, assistant relay.
//!
//! State machine:
//! ```text
//! Disconnected ──connect──► Connecting ──transport up──► Connected
//!       ▲                                                    │
//!       │                                            join intent sent
//!       │                                                    ▼
//!       └───────────── transport drop ◄──────────────────  Joined
//!                (bounded retry, automatic re-join)
//! ```
//!
//! Join is not atomic: the member list, code snapshot, chat history,
//! and whiteboard snapshot arrive as independent pushes in any order
//! or subset, and each is reconciled on its own. Undecodable frames
//! are logged and skipped; no protocol failure here ever panics.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::{AbortHandle, JoinSet};
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{
    ChatMessage, ClientEvent, ConnId, CursorPos, Participant, ProtocolError, ServerEvent,
};
use crate::sync::cache::DocCache;

/// Chat prefix that routes a question to the configured assistant.
///
/// Recognized only here — the relay carries the raw message unchanged.
pub const ASSISTANT_PREFIX: &str = "/ai ";

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Joined,
}

/// Bounded-retry reconnection settings.
///
/// Retries are consecutive dial failures; a successful connection
/// resets the budget.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay: Duration::from_secs(1),
        }
    }
}

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Relay endpoint, e.g. `ws://127.0.0.1:5000`.
    pub server_url: String,
    pub room_id: String,
    pub display_name: String,
    /// Trailing-edge window for outgoing whiteboard snapshots.
    pub whiteboard_debounce: Duration,
    pub reconnect: ReconnectPolicy,
}

impl SessionConfig {
    pub fn new(
        server_url: impl Into<String>,
        room_id: impl Into<String>,
        display_name: impl Into<String>,
    ) -> Self {
        Self {
            server_url: server_url.into(),
            room_id: room_id.into(),
            display_name: display_name.into(),
            whiteboard_debounce: Duration::from_millis(500),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Events surfaced to the embedding application.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Transport established (join intent follows immediately).
    Connected,
    /// The server acknowledged the join and assigned our connection id.
    Joined { conn_id: ConnId },
    /// Transport dropped; reconnection may follow.
    Disconnected,
    /// Full member-list replacement.
    ActiveUsers(Vec<Participant>),
    /// Shared code replaced (remote edit or join-time snapshot).
    CodeChanged(String),
    /// A peer's cursor moved.
    CursorMoved {
        conn_id: ConnId,
        display_name: String,
        cursor: CursorPos,
    },
    /// One chat message (live or a peer's system notice).
    ChatReceived(ChatMessage),
    /// Join-time chat history replay.
    ChatHistory(Vec<ChatMessage>),
    /// Whiteboard snapshot to render.
    WhiteboardUpdated(Vec<u8>),
    /// A peer's transport dropped.
    UserDisconnected {
        conn_id: ConnId,
        display_name: String,
    },
}

/// External question-answering collaborator.
///
/// The session knows nothing about what produces the text; the answer
/// is submitted back through the ordinary chat path.
pub trait Assistant: Send + Sync {
    fn answer(&self, question: String) -> BoxFuture<'static, Option<String>>;
}

/// Extract the assistant question from a chat line, if it carries the
/// command prefix.
pub(crate) fn assistant_question(text: &str) -> Option<&str> {
    text.strip_prefix(ASSISTANT_PREFIX)
        .map(str::trim)
        .filter(|q| !q.is_empty())
}

type Outgoing = Arc<RwLock<Option<mpsc::Sender<Vec<u8>>>>>;

/// A client's connection to one room.
pub struct RoomSession {
    config: SessionConfig,
    cache: Option<Arc<DocCache>>,
    assistant: Option<Arc<dyn Assistant>>,

    state: Arc<RwLock<SessionState>>,
    conn_id: Arc<RwLock<Option<ConnId>>>,
    outgoing: Outgoing,

    event_tx: mpsc::Sender<SessionEvent>,
    event_rx: Option<mpsc::Receiver<SessionEvent>>,

    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    started: AtomicBool,
    tasks: Mutex<JoinSet<()>>,
    /// Pending debounced whiteboard send, replaced on every draw.
    draw_timer: Mutex<Option<AbortHandle>>,
}

impl RoomSession {
    pub fn new(config: SessionConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            config,
            cache: None,
            assistant: None,
            state: Arc::new(RwLock::new(SessionState::Disconnected)),
            conn_id: Arc::new(RwLock::new(None)),
            outgoing: Arc::new(RwLock::new(None)),
            event_tx,
            event_rx: Some(event_rx),
            shutdown_tx,
            shutdown_rx,
            started: AtomicBool::new(false),
            tasks: Mutex::new(JoinSet::new()),
            draw_timer: Mutex::new(None),
        }
    }

    /// Attach the durable local cache used for whiteboard recovery.
    pub fn with_cache(mut self, cache: Arc<DocCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Attach the assistant invoked for `/ai ` chat lines.
    pub fn with_assistant(mut self, assistant: Arc<dyn Assistant>) -> Self {
        self.assistant = Some(assistant);
        self
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SessionEvent>> {
        self.event_rx.take()
    }

    pub async fn state(&self) -> SessionState {
        *self.state.read().await
    }

    /// Server-assigned connection id, once joined.
    pub async fn conn_id(&self) -> Option<ConnId> {
        *self.conn_id.read().await
    }

    /// Start the connection supervisor. Subsequent calls are no-ops.
    ///
    /// The supervisor dials, emits the join intent on establishment,
    /// and on transport drop retries with the configured bounded
    /// policy, re-emitting the join intent for the last known room and
    /// display name with no caller involvement.
    pub async fn connect(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let config = self.config.clone();
        let state = self.state.clone();
        let conn_id = self.conn_id.clone();
        let outgoing = self.outgoing.clone();
        let event_tx = self.event_tx.clone();
        let cache = self.cache.clone();
        let mut shutdown_rx = self.shutdown_rx.clone();

        self.tasks.lock().await.spawn(async move {
            let mut failures = 0u32;
            loop {
                if *shutdown_rx.borrow() {
                    break;
                }
                *state.write().await = SessionState::Connecting;

                match tokio_tungstenite::connect_async(&config.server_url).await {
                    Ok((ws_stream, _)) => {
                        failures = 0;
                        *state.write().await = SessionState::Connected;
                        let _ = event_tx.send(SessionEvent::Connected).await;

                        let (mut sink, mut stream) = ws_stream.split();
                        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
                        *outgoing.write().await = Some(out_tx.clone());

                        // Join intent for the current (or last known) room.
                        let join = ClientEvent::JoinRoom {
                            room_id: config.room_id.clone(),
                            display_name: config.display_name.clone(),
                        };
                        if let Ok(frame) = join.encode() {
                            let _ = out_tx.send(frame).await;
                        }
                        *state.write().await = SessionState::Joined;

                        loop {
                            tokio::select! {
                                _ = shutdown_rx.changed() => {
                                    let _ = sink.close().await;
                                    return;
                                }
                                frame = out_rx.recv() => {
                                    match frame {
                                        Some(frame) => {
                                            if sink.send(Message::Binary(frame.into())).await.is_err() {
                                                break;
                                            }
                                        }
                                        None => break,
                                    }
                                }
                                msg = stream.next() => {
                                    match msg {
                                        Some(Ok(Message::Binary(data))) => {
                                            let bytes: Vec<u8> = data.into();
                                            match ServerEvent::decode(&bytes) {
                                                Ok(event) => {
                                                    Self::reconcile(
                                                        event, &config, &conn_id,
                                                        &event_tx, &cache, &out_tx,
                                                    ).await;
                                                }
                                                Err(e) => {
                                                    log::warn!("undecodable server frame: {e}");
                                                }
                                            }
                                        }
                                        Some(Ok(Message::Close(_))) | None => break,
                                        Some(Err(e)) => {
                                            log::warn!("session socket error: {e}");
                                            break;
                                        }
                                        _ => {}
                                    }
                                }
                            }
                        }

                        *outgoing.write().await = None;
                        *state.write().await = SessionState::Disconnected;
                        let _ = event_tx.send(SessionEvent::Disconnected).await;
                        log::info!("relay transport dropped, scheduling reconnect");
                    }
                    Err(e) => {
                        failures += 1;
                        log::warn!(
                            "relay dial failed (attempt {failures}/{}): {e}",
                            config.reconnect.max_attempts
                        );
                        if failures >= config.reconnect.max_attempts {
                            *state.write().await = SessionState::Disconnected;
                            let _ = event_tx.send(SessionEvent::Disconnected).await;
                            break;
                        }
                    }
                }

                if *shutdown_rx.borrow() {
                    break;
                }
                tokio::time::sleep(config.reconnect.delay).await;
            }
        });
    }

    /// Apply one server push to local state and surface it.
    async fn reconcile(
        event: ServerEvent,
        config: &SessionConfig,
        conn_id: &Arc<RwLock<Option<ConnId>>>,
        event_tx: &mpsc::Sender<SessionEvent>,
        cache: &Option<Arc<DocCache>>,
        out_tx: &mpsc::Sender<Vec<u8>>,
    ) {
        match event {
            ServerEvent::RoomJoined {
                conn_id: id,
                room_id,
            } => {
                *conn_id.write().await = Some(id);
                log::debug!("joined {room_id} as {id}");
                let _ = event_tx.send(SessionEvent::Joined { conn_id: id }).await;
            }

            ServerEvent::ActiveUsers { participants } => {
                let _ = event_tx.send(SessionEvent::ActiveUsers(participants)).await;
            }

            ServerEvent::CodeChange { code } => {
                let _ = event_tx.send(SessionEvent::CodeChanged(code)).await;
            }

            ServerEvent::CursorMove {
                conn_id,
                display_name,
                cursor,
            } => {
                let _ = event_tx
                    .send(SessionEvent::CursorMoved {
                        conn_id,
                        display_name,
                        cursor,
                    })
                    .await;
            }

            ServerEvent::Chat(message) => {
                let _ = event_tx.send(SessionEvent::ChatReceived(message)).await;
            }

            ServerEvent::SyncChat { messages } => {
                let _ = event_tx.send(SessionEvent::ChatHistory(messages)).await;
            }

            ServerEvent::WhiteboardDraw { snapshot } => {
                Self::cache_whiteboard(cache, &config.room_id, &snapshot);
                let _ = event_tx
                    .send(SessionEvent::WhiteboardUpdated(snapshot))
                    .await;
            }

            ServerEvent::SyncWhiteboard { snapshot } => {
                // Recovery: a server that restarted reports an empty
                // snapshot; if our durable cache still has one, push it
                // back (bypassing the debounce) and keep local state.
                // Two clients recovering concurrently are last-push-wins.
                if snapshot.is_empty() {
                    let cached = cache
                        .as_ref()
                        .and_then(|c| c.load_whiteboard(&config.room_id).ok())
                        .filter(|b| !b.is_empty());
                    if let Some(local) = cached {
                        log::info!(
                            "server whiteboard empty for {}, restoring cached snapshot",
                            config.room_id
                        );
                        let draw = ClientEvent::WhiteboardDraw {
                            room_id: config.room_id.clone(),
                            snapshot: local.clone(),
                        };
                        if let Ok(frame) = draw.encode() {
                            let _ = out_tx.send(frame).await;
                        }
                        let _ = event_tx.send(SessionEvent::WhiteboardUpdated(local)).await;
                        return;
                    }
                } else {
                    Self::cache_whiteboard(cache, &config.room_id, &snapshot);
                }
                let _ = event_tx
                    .send(SessionEvent::WhiteboardUpdated(snapshot))
                    .await;
            }

            ServerEvent::UserDisconnected {
                conn_id,
                display_name,
            } => {
                let _ = event_tx
                    .send(SessionEvent::UserDisconnected {
                        conn_id,
                        display_name,
                    })
                    .await;
            }
        }
    }

    fn cache_whiteboard(cache: &Option<Arc<DocCache>>, room_id: &str, snapshot: &[u8]) {
        if snapshot.is_empty() {
            return;
        }
        if let Some(cache) = cache {
            if let Err(e) = cache.save_whiteboard(room_id, snapshot) {
                log::warn!("whiteboard cache write failed: {e}");
            }
        }
    }

    async fn send_via(outgoing: &Outgoing, event: ClientEvent) -> Result<(), ProtocolError> {
        let tx = outgoing
            .read()
            .await
            .clone()
            .ok_or(ProtocolError::ConnectionClosed)?;
        let frame = event.encode()?;
        tx.send(frame)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Replace the room's shared code.
    pub async fn send_code(&self, code: impl Into<String>) -> Result<(), ProtocolError> {
        Self::send_via(
            &self.outgoing,
            ClientEvent::CodeChange {
                room_id: self.config.room_id.clone(),
                code: code.into(),
            },
        )
        .await
    }

    /// Push the current code to exactly one other connection.
    pub async fn push_code_to(
        &self,
        target: ConnId,
        code: impl Into<String>,
    ) -> Result<(), ProtocolError> {
        Self::send_via(
            &self.outgoing,
            ClientEvent::SyncCode {
                target,
                code: code.into(),
            },
        )
        .await
    }

    /// Broadcast our cursor position.
    pub async fn send_cursor(&self, cursor: CursorPos) -> Result<(), ProtocolError> {
        Self::send_via(
            &self.outgoing,
            ClientEvent::CursorMove {
                room_id: self.config.room_id.clone(),
                cursor,
            },
        )
        .await
    }

    /// Send a chat line.
    ///
    /// The raw message always goes through the normal path first. When
    /// it carries [`ASSISTANT_PREFIX`] and an assistant is attached,
    /// the question is resolved on a task scoped to this session —
    /// cancelled by [`disconnect`](Self::disconnect) — and the answer
    /// is submitted back through this same path as an ordinary, later
    /// message.
    pub async fn send_chat(&self, text: impl Into<String>) -> Result<(), ProtocolError> {
        let text = text.into();
        Self::send_via(
            &self.outgoing,
            ClientEvent::SendMessage {
                room_id: self.config.room_id.clone(),
                text: text.clone(),
            },
        )
        .await?;

        if let (Some(assistant), Some(question)) =
            (self.assistant.clone(), assistant_question(&text))
        {
            let question = question.to_string();
            let outgoing = self.outgoing.clone();
            let room_id = self.config.room_id.clone();
            self.tasks.lock().await.spawn(async move {
                if let Some(answer) = assistant.answer(question).await {
                    let reply = ClientEvent::SendMessage {
                        room_id,
                        text: format!("AI Mentor: {answer}"),
                    };
                    if let Err(e) = Self::send_via(&outgoing, reply).await {
                        log::warn!("assistant reply dropped: {e}");
                    }
                }
            });
        }

        Ok(())
    }

    /// Record a whiteboard snapshot and schedule its broadcast.
    ///
    /// The snapshot is written to the durable cache immediately; the
    /// outgoing frame is debounced on the trailing edge — each call
    /// restarts the window, and only the latest snapshot is sent once
    /// the window elapses.
    pub async fn draw_whiteboard(&self, snapshot: Vec<u8>) {
        Self::cache_whiteboard(&self.cache, &self.config.room_id, &snapshot);

        let outgoing = self.outgoing.clone();
        let room_id = self.config.room_id.clone();
        let window = self.config.whiteboard_debounce;

        let mut timer = self.draw_timer.lock().await;
        if let Some(prev) = timer.take() {
            prev.abort();
        }
        let handle = self.tasks.lock().await.spawn(async move {
            tokio::time::sleep(window).await;
            let draw = ClientEvent::WhiteboardDraw { room_id, snapshot };
            if let Err(e) = Self::send_via(&outgoing, draw).await {
                log::debug!("debounced whiteboard send dropped: {e}");
            }
        });
        *timer = Some(handle);
    }

    /// Tear the session down. Idempotent; safe to call repeatedly.
    ///
    /// Aborts every task in the session's scope, including in-flight
    /// assistant queries and pending debounced sends.
    pub async fn disconnect(&self) {
        let _ = self.shutdown_tx.send(true);
        self.tasks.lock().await.abort_all();
        *self.outgoing.write().await = None;
        *self.state.write().await = SessionState::Disconnected;
    }
}
