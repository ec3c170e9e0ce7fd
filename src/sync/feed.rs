//! Client-side replicated document with offline-first durability.
//!
//! A [`DocFeed`] owns one CRDT document (a `yrs` doc with a single
//! shared text root). Local edits always apply locally and produce an
//! update fragment; while the hub connection is up the fragment is
//! sent, while it is down the fragment goes to a bounded offline queue
//! that is drained on reconnect. Every state change — local edit or
//! applied remote fragment — writes the full encoded document back to
//! the durable cache, so reopening the room before reconnecting still
//! shows the latest locally-known content.
//!
//! Merge semantics: applying any fragment zero or more times, in any
//! order relative to other fragments, converges to one canonical
//! document state.
//!
//! Connection status is tracked independently of the relay session;
//! a dial failure surfaces as [`FeedStatus::Error`] rather than
//! killing local editing.
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapter 5

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;
use yrs::updates::decoder::Decode;
use yrs::{GetString, ReadTxn, Text, Transact, WriteTxn};

use crate::protocol::now_ms;
use crate::sync::awareness::{AwarenessBook, AwarenessEntry, CursorThrottle};
use crate::sync::cache::DocCache;
use crate::sync::wire::{CursorState, PeerProfile, SyncKind, SyncMessage};

/// Shared text root inside the replicated document.
const TEXT_ROOT: &str = "content";

/// Sync channel connection status, independent of the relay session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedStatus {
    Connecting,
    Connected,
    Disconnected,
    /// Dial failed — distinct from a clean disconnect so the UI can
    /// tell "temporarily offline, editing locally" from "never
    /// connected".
    Error,
}

/// Events emitted by the feed.
#[derive(Debug, Clone)]
pub enum FeedEvent {
    StatusChanged(FeedStatus),
    /// A remote fragment was merged into the document.
    RemoteUpdate { peer_id: Uuid },
    PeerJoined(PeerProfile),
    PeerLeft(Uuid),
    RemoteCursor { peer_id: Uuid, cursor: CursorState },
}

/// Feed configuration.
#[derive(Debug, Clone)]
pub struct FeedConfig {
    /// Hub endpoint, e.g. `ws://127.0.0.1:1234`.
    pub server_url: String,
    /// Room-scoped channel name.
    pub room: String,
    pub profile: PeerProfile,
    /// Local edits held while disconnected.
    pub offline_queue_capacity: usize,
    pub reconnect_delay: Duration,
}

impl FeedConfig {
    pub fn new(
        server_url: impl Into<String>,
        room: impl Into<String>,
        display_name: impl Into<String>,
    ) -> Self {
        Self {
            server_url: server_url.into(),
            room: room.into(),
            profile: PeerProfile::new(display_name),
            offline_queue_capacity: 10_000,
            reconnect_delay: Duration::from_secs(1),
        }
    }
}

/// Bounded queue of update fragments made while disconnected.
pub struct OfflineQueue {
    queue: VecDeque<Vec<u8>>,
    max_size: usize,
}

impl OfflineQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Queue a fragment for later replay. `false` when full.
    pub fn enqueue(&mut self, fragment: Vec<u8>) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(fragment);
        true
    }

    /// Drain all queued fragments in order.
    pub fn drain(&mut self) -> Vec<Vec<u8>> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.queue.iter().map(|f| f.len()).sum()
    }
}

/// The local document replica: merge, encode, durable cache.
struct Replica {
    doc: yrs::Doc,
    room: String,
    cache: Option<Arc<DocCache>>,
}

impl Replica {
    /// Insert text and return the fragment the edit produced.
    fn insert(&self, index: u32, chunk: &str) -> Vec<u8> {
        let before = {
            let txn = self.doc.transact();
            txn.state_vector()
        };
        {
            let mut txn = self.doc.transact_mut();
            let text = txn.get_or_insert_text(TEXT_ROOT);
            text.insert(&mut txn, index, chunk);
        }
        let fragment = {
            let txn = self.doc.transact();
            txn.encode_diff_v1(&before)
        };
        self.persist();
        fragment
    }

    /// Remove a character range and return the fragment it produced.
    fn remove(&self, index: u32, len: u32) -> Vec<u8> {
        let before = {
            let txn = self.doc.transact();
            txn.state_vector()
        };
        {
            let mut txn = self.doc.transact_mut();
            let text = txn.get_or_insert_text(TEXT_ROOT);
            text.remove_range(&mut txn, index, len);
        }
        let fragment = {
            let txn = self.doc.transact();
            txn.encode_diff_v1(&before)
        };
        self.persist();
        fragment
    }

    /// Merge a remote fragment. Unparseable fragments are dropped.
    fn apply_update(&self, fragment: &[u8]) -> bool {
        let Ok(update) = yrs::Update::decode_v1(fragment) else {
            log::warn!("dropping unparseable update fragment ({} bytes)", fragment.len());
            return false;
        };
        {
            let mut txn = self.doc.transact_mut();
            let _ = txn.apply_update(update);
        }
        self.persist();
        true
    }

    /// Full document state as one idempotent update fragment.
    fn full_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&yrs::StateVector::default())
    }

    fn contents(&self) -> String {
        let txn = self.doc.transact();
        match txn.get_text(TEXT_ROOT) {
            Some(text) => text.get_string(&txn),
            None => String::new(),
        }
    }

    fn persist(&self) {
        if let Some(cache) = &self.cache {
            if let Err(e) = cache.save_document(&self.room, &self.full_state()) {
                log::warn!("document cache write failed: {e}");
            }
        }
    }
}

/// A client's replicated view of one room's shared document.
pub struct DocFeed {
    config: FeedConfig,
    replica: Arc<Replica>,
    status: Arc<RwLock<FeedStatus>>,
    offline: Arc<Mutex<OfflineQueue>>,
    outgoing: Arc<RwLock<Option<mpsc::Sender<Vec<u8>>>>>,
    awareness: Arc<Mutex<AwarenessBook>>,
    throttle: Mutex<CursorThrottle>,

    event_tx: mpsc::Sender<FeedEvent>,
    event_rx: Option<mpsc::Receiver<FeedEvent>>,

    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    started: AtomicBool,
    tasks: Mutex<JoinSet<()>>,
}

impl DocFeed {
    pub fn new(config: FeedConfig) -> Self {
        Self::build(config, None)
    }

    /// Create with a durable cache; previously cached document state
    /// for this room is loaded immediately (offline-first reads).
    pub fn with_cache(config: FeedConfig, cache: Arc<DocCache>) -> Self {
        Self::build(config, Some(cache))
    }

    fn build(config: FeedConfig, cache: Option<Arc<DocCache>>) -> Self {
        let replica = Replica {
            doc: yrs::Doc::new(),
            room: config.room.clone(),
            cache,
        };
        if let Some(cache) = &replica.cache {
            if let Ok(state) = cache.load_document(&config.room) {
                if let Ok(update) = yrs::Update::decode_v1(&state) {
                    let mut txn = replica.doc.transact_mut();
                    let _ = txn.apply_update(update);
                    log::info!("loaded cached document for room {}", config.room);
                }
            }
        }

        let (event_tx, event_rx) = mpsc::channel(256);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let offline_capacity = config.offline_queue_capacity;
        Self {
            config,
            replica: Arc::new(replica),
            status: Arc::new(RwLock::new(FeedStatus::Disconnected)),
            offline: Arc::new(Mutex::new(OfflineQueue::new(offline_capacity))),
            outgoing: Arc::new(RwLock::new(None)),
            awareness: Arc::new(Mutex::new(AwarenessBook::new())),
            throttle: Mutex::new(CursorThrottle::new()),
            event_tx,
            event_rx: Some(event_rx),
            shutdown_tx,
            shutdown_rx,
            started: AtomicBool::new(false),
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<FeedEvent>> {
        self.event_rx.take()
    }

    pub async fn status(&self) -> FeedStatus {
        *self.status.read().await
    }

    pub fn profile(&self) -> &PeerProfile {
        &self.config.profile
    }

    /// Current document text.
    pub fn contents(&self) -> String {
        self.replica.contents()
    }

    /// Full document state as one idempotent update fragment.
    pub fn full_state(&self) -> Vec<u8> {
        self.replica.full_state()
    }

    pub async fn offline_len(&self) -> usize {
        self.offline.lock().await.len()
    }

    /// Remote peers currently visible on this channel.
    pub async fn peers(&self) -> Vec<AwarenessEntry> {
        self.awareness.lock().await.peers().into_iter().cloned().collect()
    }

    /// Insert text at a character offset. Always applies locally;
    /// returns the produced fragment (sent or queued).
    pub async fn insert(&self, index: u32, chunk: &str) -> Vec<u8> {
        let fragment = self.replica.insert(index, chunk);
        self.dispatch_local(fragment.clone()).await;
        fragment
    }

    /// Remove a character range. Always applies locally; returns the
    /// produced fragment (sent or queued).
    pub async fn remove(&self, index: u32, len: u32) -> Vec<u8> {
        let fragment = self.replica.remove(index, len);
        self.dispatch_local(fragment.clone()).await;
        fragment
    }

    /// Merge a remote fragment into the local document.
    pub fn apply_update(&self, fragment: &[u8]) -> bool {
        self.replica.apply_update(fragment)
    }

    /// Broadcast our cursor. Rate-limited to ~30 fps and silently
    /// dropped while offline — awareness is ephemeral.
    pub async fn send_cursor(&self, anchor: u32, head: u32) {
        if !self.throttle.lock().await.ready() {
            return;
        }
        if *self.status.read().await != FeedStatus::Connected {
            return;
        }
        let cursor = CursorState {
            anchor,
            head,
            timestamp: now_ms(),
        };
        let msg = SyncMessage::cursor(self.config.profile.peer_id, &self.config.room, &cursor);
        if let (Ok(frame), Some(tx)) = (msg.encode(), self.outgoing.read().await.clone()) {
            let _ = tx.send(frame).await;
        }
    }

    async fn dispatch_local(&self, fragment: Vec<u8>) {
        if *self.status.read().await == FeedStatus::Connected {
            if let Some(tx) = self.outgoing.read().await.clone() {
                let msg = SyncMessage::update(
                    self.config.profile.peer_id,
                    &self.config.room,
                    fragment.clone(),
                );
                if let Ok(frame) = msg.encode() {
                    if tx.send(frame).await.is_ok() {
                        return;
                    }
                }
            }
        }
        if !self.offline.lock().await.enqueue(fragment) {
            log::warn!("offline queue full, dropping local update for {}", self.config.room);
        }
    }

    /// Start the connection supervisor. Subsequent calls are no-ops.
    ///
    /// On each (re)connect the feed announces itself, broadcasts its
    /// full state as one idempotent catch-up fragment, then drains the
    /// offline queue. With a dumb hub, the peers already connected are
    /// the sync authority: on seeing a remote `Join`, the feed answers
    /// with its own full state the same way.
    pub async fn connect(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let config = self.config.clone();
        let replica = self.replica.clone();
        let status = self.status.clone();
        let offline = self.offline.clone();
        let outgoing = self.outgoing.clone();
        let awareness = self.awareness.clone();
        let event_tx = self.event_tx.clone();
        let mut shutdown_rx = self.shutdown_rx.clone();

        self.tasks.lock().await.spawn(async move {
            loop {
                if *shutdown_rx.borrow() {
                    break;
                }
                Self::set_status(&status, &event_tx, FeedStatus::Connecting).await;

                match tokio_tungstenite::connect_async(&config.server_url).await {
                    Ok((ws_stream, _)) => {
                        Self::set_status(&status, &event_tx, FeedStatus::Connected).await;
                        let (mut sink, mut stream) = ws_stream.split();
                        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
                        *outgoing.write().await = Some(out_tx.clone());

                        // Announce, catch peers up, replay offline edits.
                        let join = SyncMessage::join(&config.room, &config.profile);
                        if let Ok(frame) = join.encode() {
                            let _ = out_tx.send(frame).await;
                        }
                        let state = SyncMessage::update(
                            config.profile.peer_id,
                            &config.room,
                            replica.full_state(),
                        );
                        if let Ok(frame) = state.encode() {
                            let _ = out_tx.send(frame).await;
                        }
                        let queued = offline.lock().await.drain();
                        if !queued.is_empty() {
                            log::info!("replaying {} queued updates for {}", queued.len(), config.room);
                            for fragment in queued {
                                let msg = SyncMessage::update(
                                    config.profile.peer_id,
                                    &config.room,
                                    fragment,
                                );
                                if let Ok(frame) = msg.encode() {
                                    let _ = out_tx.send(frame).await;
                                }
                            }
                        }

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
                                            let Ok(msg) = SyncMessage::decode(&bytes) else {
                                                log::warn!("undecodable hub frame, skipping");
                                                continue;
                                            };
                                            Self::reconcile(
                                                msg, &config, &replica, &awareness,
                                                &event_tx, &out_tx,
                                            ).await;
                                        }
                                        Some(Ok(Message::Close(_))) | None => break,
                                        Some(Err(e)) => {
                                            log::warn!("hub socket error: {e}");
                                            break;
                                        }
                                        _ => {}
                                    }
                                }
                            }
                        }

                        *outgoing.write().await = None;
                        awareness.lock().await.clear();
                        Self::set_status(&status, &event_tx, FeedStatus::Disconnected).await;
                    }
                    Err(e) => {
                        log::warn!("hub dial failed: {e}");
                        Self::set_status(&status, &event_tx, FeedStatus::Error).await;
                    }
                }

                if *shutdown_rx.borrow() {
                    break;
                }
                tokio::time::sleep(config.reconnect_delay).await;
            }
        });
    }

    async fn reconcile(
        msg: SyncMessage,
        config: &FeedConfig,
        replica: &Arc<Replica>,
        awareness: &Arc<Mutex<AwarenessBook>>,
        event_tx: &mpsc::Sender<FeedEvent>,
        out_tx: &mpsc::Sender<Vec<u8>>,
    ) {
        match msg.kind {
            SyncKind::Update => {
                if replica.apply_update(&msg.payload) {
                    let _ = event_tx
                        .send(FeedEvent::RemoteUpdate {
                            peer_id: msg.peer_id,
                        })
                        .await;
                }
            }
            SyncKind::Join => {
                awareness.lock().await.apply(&msg);
                // Answer the newcomer with our full state; duplicates
                // across peers merge away.
                let reply = SyncMessage::update(
                    config.profile.peer_id,
                    &config.room,
                    replica.full_state(),
                );
                if let Ok(frame) = reply.encode() {
                    let _ = out_tx.send(frame).await;
                }
                if let Ok(profile) = msg.profile() {
                    let _ = event_tx.send(FeedEvent::PeerJoined(profile)).await;
                }
            }
            SyncKind::Cursor => {
                awareness.lock().await.apply(&msg);
                if let Ok(cursor) = msg.cursor_state() {
                    let _ = event_tx
                        .send(FeedEvent::RemoteCursor {
                            peer_id: msg.peer_id,
                            cursor,
                        })
                        .await;
                }
            }
            SyncKind::Leave => {
                awareness.lock().await.apply(&msg);
                let _ = event_tx.send(FeedEvent::PeerLeft(msg.peer_id)).await;
            }
            SyncKind::Ping | SyncKind::Pong => {}
        }
    }

    async fn set_status(
        status: &Arc<RwLock<FeedStatus>>,
        event_tx: &mpsc::Sender<FeedEvent>,
        next: FeedStatus,
    ) {
        *status.write().await = next;
        let _ = event_tx.send(FeedEvent::StatusChanged(next)).await;
    }

    /// Tear the feed down. Idempotent. Local state and cache survive.
    pub async fn disconnect(&self) {
        let _ = self.shutdown_tx.send(true);
        self.tasks.lock().await.abort_all();
        *self.outgoing.write().await = None;
        *self.status.write().await = FeedStatus::Disconnected;
    }
}
