//! Connection registry, room store, and presence tracking.
//!
//! One [`RoomRegistry`] owns both process-wide maps:
//!
//! ```text
//! connections: ConnId  → { display_name, room_id, outbox }
//! rooms:       room id → { code, chat, whiteboard, members }
//! ```
//!
//! The registry is injectable with an explicit lifecycle — constructed
//! at process start, [`reset`](RoomRegistry::reset) in tests — rather
//! than ambient module-level state. Every relay event performs all of
//! its mutations under a single write-lock acquisition and returns the
//! outbox handles the caller needs, so fan-out is O(room size) sends
//! outside the lock and room-scoped delivery order equals processing
//! order.
//!
//! Invariants:
//! - a connection belongs to at most one room at a time;
//! - chat order is server-arrival order, never reordered;
//! - code and whiteboard are last-writer-wins blobs, no merge.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

use crate::protocol::{ChatMessage, ConnId, Participant, ANONYMOUS_NAME};

/// Per-connection sender of pre-encoded server frames.
///
/// Frames are encoded once per broadcast and shared by reference.
pub type Outbox = mpsc::Sender<Arc<Vec<u8>>>;

/// Bounds on server-side room state growth.
///
/// The relay keeps rooms and chat logs in memory for the process
/// lifetime; this policy makes the growth explicit and configurable
/// instead of unbounded.
#[derive(Debug, Clone)]
pub struct RetentionPolicy {
    /// Chat entries kept per room; the oldest are trimmed first.
    pub max_chat_history: usize,
    /// Drop a room's state once its last member disconnects.
    pub evict_empty_rooms: bool,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_chat_history: 512,
            evict_empty_rooms: false,
        }
    }
}

/// In-memory state of one room.
#[derive(Debug, Default)]
struct Room {
    code: String,
    chat: VecDeque<ChatMessage>,
    whiteboard: Vec<u8>,
    members: HashSet<ConnId>,
}

struct Connection {
    display_name: String,
    room_id: Option<String>,
    outbox: Outbox,
}

#[derive(Default)]
struct RegistryInner {
    connections: HashMap<ConnId, Connection>,
    rooms: HashMap<String, Room>,
}

/// Everything the relay must deliver after a successful join.
pub struct JoinOutcome {
    pub conn_id: ConnId,
    pub room_id: String,
    /// Full member list after the join.
    pub roster: Vec<Participant>,
    /// The joiner's own outbox (snapshot pushes go here alone).
    pub joiner: Outbox,
    /// Every member including the joiner (member-list broadcast).
    pub everyone: Vec<Outbox>,
    /// Every member except the joiner (join notice broadcast).
    pub others: Vec<Outbox>,
    /// Server-synthesized "has joined" notice, already appended to the log.
    pub notice: ChatMessage,
    /// Room code at join time; pushed to the joiner when non-empty.
    pub code: String,
    /// Chat history at join time; replayed to the joiner when non-empty.
    pub chat: Vec<ChatMessage>,
    /// Whiteboard snapshot; always pushed, even when empty.
    pub whiteboard: Vec<u8>,
    /// Leave bookkeeping for the previous room, if the join moved the
    /// connection between rooms.
    pub departed: Option<LeaveOutcome>,
}

/// Everything the relay must deliver after a member leaves a room.
pub struct LeaveOutcome {
    pub conn_id: ConnId,
    pub display_name: String,
    pub room_id: String,
    /// Member list after the departure.
    pub roster: Vec<Participant>,
    /// Outboxes of the remaining members.
    pub remaining: Vec<Outbox>,
    /// Server-synthesized "has left" notice, already appended to the log.
    pub notice: ChatMessage,
    /// Whether the room's state was evicted by policy.
    pub evicted: bool,
}

/// Process-wide connection and room state.
pub struct RoomRegistry {
    inner: RwLock<RegistryInner>,
    policy: RetentionPolicy,
}

impl RoomRegistry {
    pub fn new(policy: RetentionPolicy) -> Self {
        Self {
            inner: RwLock::new(RegistryInner::default()),
            policy,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RetentionPolicy::default())
    }

    /// Drop all connections and rooms. Test lifecycle hook.
    pub async fn reset(&self) {
        let mut inner = self.inner.write().await;
        inner.connections.clear();
        inner.rooms.clear();
    }

    /// Register a freshly accepted transport connection.
    ///
    /// The connection has no display name and no room until it joins.
    pub async fn register(&self, conn_id: ConnId, outbox: Outbox) {
        let mut inner = self.inner.write().await;
        inner.connections.insert(
            conn_id,
            Connection {
                display_name: String::new(),
                room_id: None,
                outbox,
            },
        );
    }

    /// Join `conn_id` to a room, creating the room lazily.
    ///
    /// Returns `None` — the event is dropped — when either field is
    /// empty or the connection is unknown. A connection already in a
    /// room is moved out of it first; the previous room's bookkeeping
    /// comes back in [`JoinOutcome::departed`].
    pub async fn join(
        &self,
        conn_id: ConnId,
        room_id: &str,
        display_name: &str,
    ) -> Option<JoinOutcome> {
        if room_id.is_empty() || display_name.is_empty() {
            return None;
        }

        let mut inner = self.inner.write().await;
        if !inner.connections.contains_key(&conn_id) {
            return None;
        }

        // At most one room per connection: detach from any previous room
        // before attaching to the new one.
        let departed = Self::detach(&mut inner, conn_id, &self.policy);

        {
            let conn = inner.connections.get_mut(&conn_id)?;
            conn.display_name = display_name.to_string();
            conn.room_id = Some(room_id.to_string());
        }

        let notice = ChatMessage::system(format!("{display_name} has joined the room."));
        let (code, chat, whiteboard) = {
            let room = inner.rooms.entry(room_id.to_string()).or_default();
            room.members.insert(conn_id);
            room.chat.push_back(notice.clone());
            Self::trim_chat(room, &self.policy);
            (
                room.code.clone(),
                room.chat.iter().cloned().collect(),
                room.whiteboard.clone(),
            )
        };

        let roster = Self::roster(&inner, room_id);
        let everyone = Self::outboxes(&inner, room_id, None);
        let others = Self::outboxes(&inner, room_id, Some(conn_id));
        let joiner = inner.connections.get(&conn_id)?.outbox.clone();

        Some(JoinOutcome {
            conn_id,
            room_id: room_id.to_string(),
            roster,
            joiner,
            everyone,
            others,
            notice,
            code,
            chat,
            whiteboard,
            departed,
        })
    }

    /// Remove a connection entirely (transport closed).
    ///
    /// Returns the leave bookkeeping when the connection was in a room;
    /// a connection that never joined leaves no trace.
    pub async fn disconnect(&self, conn_id: ConnId) -> Option<LeaveOutcome> {
        let mut inner = self.inner.write().await;
        let outcome = Self::detach(&mut inner, conn_id, &self.policy);
        inner.connections.remove(&conn_id);
        outcome
    }

    /// Replace the room's code and return the other members' outboxes.
    ///
    /// `None` when the room does not exist — a no-op, not an error.
    pub async fn code_change(
        &self,
        sender: ConnId,
        room_id: &str,
        code: &str,
    ) -> Option<Vec<Outbox>> {
        let mut inner = self.inner.write().await;
        let room = inner.rooms.get_mut(room_id)?;
        room.code = code.to_string();
        Some(Self::outboxes(&inner, room_id, Some(sender)))
    }

    /// Point-to-point code push: update the sender's room code and
    /// return the target's outbox. Unknown target → `None` (dropped).
    pub async fn sync_code(
        &self,
        sender: ConnId,
        target: ConnId,
        code: &str,
    ) -> Option<Outbox> {
        let mut inner = self.inner.write().await;
        if let Some(room_id) = inner
            .connections
            .get(&sender)
            .and_then(|c| c.room_id.clone())
        {
            if let Some(room) = inner.rooms.get_mut(&room_id) {
                room.code = code.to_string();
            }
        }
        inner.connections.get(&target).map(|c| c.outbox.clone())
    }

    /// Resolve the sender's display name and the other members' outboxes
    /// for a cursor relay. Stores nothing.
    pub async fn cursor_targets(
        &self,
        sender: ConnId,
        room_id: &str,
    ) -> Option<(String, Vec<Outbox>)> {
        let inner = self.inner.read().await;
        if !inner.rooms.contains_key(room_id) {
            return None;
        }
        let display_name = inner
            .connections
            .get(&sender)
            .map(|c| c.display_name.clone())
            .unwrap_or_else(|| ANONYMOUS_NAME.to_string());
        Some((display_name, Self::outboxes(&inner, room_id, Some(sender))))
    }

    /// Replace the room's whiteboard snapshot and return the other
    /// members' outboxes.
    pub async fn whiteboard_draw(
        &self,
        sender: ConnId,
        room_id: &str,
        snapshot: &[u8],
    ) -> Option<Vec<Outbox>> {
        let mut inner = self.inner.write().await;
        let room = inner.rooms.get_mut(room_id)?;
        room.whiteboard = snapshot.to_vec();
        Some(Self::outboxes(&inner, room_id, Some(sender)))
    }

    /// Append a chat message stamped with the sender's display name and
    /// the current time; return it with every member's outbox
    /// (sender-inclusive, unlike the code channel).
    pub async fn send_message(
        &self,
        sender: ConnId,
        room_id: &str,
        text: &str,
    ) -> Option<(ChatMessage, Vec<Outbox>)> {
        let mut inner = self.inner.write().await;
        let display_name = inner
            .connections
            .get(&sender)
            .map(|c| c.display_name.clone())
            .unwrap_or_else(|| ANONYMOUS_NAME.to_string());
        let room = inner.rooms.get_mut(room_id)?;
        let message = ChatMessage::new(display_name, text);
        room.chat.push_back(message.clone());
        Self::trim_chat(room, &self.policy);
        Some((message, Self::outboxes(&inner, room_id, None)))
    }

    /// Current member list of a room. Unknown connection ids resolve to
    /// the placeholder display name.
    pub async fn members(&self, room_id: &str) -> Vec<Participant> {
        let inner = self.inner.read().await;
        Self::roster(&inner, room_id)
    }

    pub async fn room_count(&self) -> usize {
        self.inner.read().await.rooms.len()
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.read().await.connections.len()
    }

    /// Current code blob of a room, if the room exists.
    pub async fn room_code(&self, room_id: &str) -> Option<String> {
        let inner = self.inner.read().await;
        inner.rooms.get(room_id).map(|r| r.code.clone())
    }

    /// Current whiteboard snapshot of a room, if the room exists.
    pub async fn room_whiteboard(&self, room_id: &str) -> Option<Vec<u8>> {
        let inner = self.inner.read().await;
        inner.rooms.get(room_id).map(|r| r.whiteboard.clone())
    }

    /// Chat history of a room in append order, if the room exists.
    pub async fn chat_history(&self, room_id: &str) -> Option<Vec<ChatMessage>> {
        let inner = self.inner.read().await;
        inner
            .rooms
            .get(room_id)
            .map(|r| r.chat.iter().cloned().collect())
    }

    // Remove a connection from its room (if any) and build the leave
    // bookkeeping. Caller holds the write lock.
    fn detach(
        inner: &mut RegistryInner,
        conn_id: ConnId,
        policy: &RetentionPolicy,
    ) -> Option<LeaveOutcome> {
        let (room_id, display_name) = {
            let conn = inner.connections.get_mut(&conn_id)?;
            let room_id = conn.room_id.take()?;
            (room_id, conn.display_name.clone())
        };

        let notice = ChatMessage::system(format!("{display_name} has left the room."));
        let mut evicted = false;
        if let Some(room) = inner.rooms.get_mut(&room_id) {
            room.members.remove(&conn_id);
            room.chat.push_back(notice.clone());
            Self::trim_chat(room, policy);
            evicted = policy.evict_empty_rooms && room.members.is_empty();
        }
        if evicted {
            inner.rooms.remove(&room_id);
        }

        let roster = Self::roster(inner, &room_id);
        let remaining = Self::outboxes(inner, &room_id, Some(conn_id));

        Some(LeaveOutcome {
            conn_id,
            display_name,
            room_id,
            roster,
            remaining,
            notice,
            evicted,
        })
    }

    fn trim_chat(room: &mut Room, policy: &RetentionPolicy) {
        while room.chat.len() > policy.max_chat_history {
            room.chat.pop_front();
        }
    }

    fn roster(inner: &RegistryInner, room_id: &str) -> Vec<Participant> {
        let Some(room) = inner.rooms.get(room_id) else {
            return Vec::new();
        };
        room.members
            .iter()
            .map(|conn_id| Participant {
                conn_id: *conn_id,
                display_name: inner
                    .connections
                    .get(conn_id)
                    .map(|c| c.display_name.clone())
                    .unwrap_or_else(|| ANONYMOUS_NAME.to_string()),
            })
            .collect()
    }

    fn outboxes(inner: &RegistryInner, room_id: &str, exclude: Option<ConnId>) -> Vec<Outbox> {
        let Some(room) = inner.rooms.get(room_id) else {
            return Vec::new();
        };
        room.members
            .iter()
            .filter(|id| Some(**id) != exclude)
            .filter_map(|id| inner.connections.get(id).map(|c| c.outbox.clone()))
            .collect()
    }
}
