//! Binary wire protocol for the room relay channel.
//!
//! Every frame on the relay WebSocket is one bincode-encoded event.
//! Client-originated and server-originated events are separate closed
//! enums, so dispatch is an exhaustive `match` — adding an event kind
//! is a compile-time-checked change, not a string lookup.
//!
//! ```text
//! ┌─────────────┐  ClientEvent (binary)  ┌─────────────┐
//! │ RoomSession │ ─────────────────────► │ RelayServer │
//! │ (per user)  │ ◄───────────────────── │ (central)   │
//! └─────────────┘  ServerEvent (binary)  └─────────────┘
//! ```
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapter 4

use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use uuid::Uuid;

/// Identifier of one live relay connection.
///
/// Assigned by the server at transport accept; never reused.
pub type ConnId = Uuid;

/// Reserved sender identity for server-synthesized chat notices.
pub const SYSTEM_SENDER: &str = "System";

/// Placeholder display name for connections the registry cannot resolve.
pub const ANONYMOUS_NAME: &str = "Anonymous";

/// Milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// One chat entry. Immutable once appended; ordered by server arrival.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub display_name: String,
    pub text: String,
    /// Server-arrival timestamp, milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
}

impl ChatMessage {
    /// Create a message stamped with the current time.
    pub fn new(display_name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            text: text.into(),
            timestamp_ms: now_ms(),
        }
    }

    /// Create a server-synthesized notice from the reserved system identity.
    pub fn system(text: impl Into<String>) -> Self {
        Self::new(SYSTEM_SENDER, text)
    }

    /// Whether this message was synthesized by the server.
    pub fn is_system(&self) -> bool {
        self.display_name == SYSTEM_SENDER
    }
}

/// One entry in a room's member list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub conn_id: ConnId,
    pub display_name: String,
}

/// Text cursor location in the shared code buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorPos {
    pub line: u32,
    pub column: u32,
}

/// Events a client sends to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientEvent {
    /// Announce intent to join a room. Empty room id or display name
    /// makes the event invalid and the server drops it silently.
    JoinRoom {
        room_id: String,
        display_name: String,
    },
    /// Replace the room's shared code blob (last-writer-wins).
    CodeChange { room_id: String, code: String },
    /// Push a code value to exactly one other connection.
    SyncCode { target: ConnId, code: String },
    /// High-frequency cursor position update; never stored.
    CursorMove { room_id: String, cursor: CursorPos },
    /// Replace the room's whiteboard snapshot (last-writer-wins).
    WhiteboardDraw { room_id: String, snapshot: Vec<u8> },
    /// Append a chat message; the server stamps sender and time.
    SendMessage { room_id: String, text: String },
}

/// Events the relay sends to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerEvent {
    /// Tells the joiner its server-assigned connection id.
    RoomJoined { conn_id: ConnId, room_id: String },
    /// Full replacement of the room's member list.
    ActiveUsers { participants: Vec<Participant> },
    /// Shared code blob changed (or join-time snapshot push).
    CodeChange { code: String },
    /// A peer's cursor moved, enriched with its identity.
    CursorMove {
        conn_id: ConnId,
        display_name: String,
        cursor: CursorPos,
    },
    /// A peer replaced the whiteboard snapshot.
    WhiteboardDraw { snapshot: Vec<u8> },
    /// Join-time whiteboard push. Sent even when empty so the joiner's
    /// recovery policy has a deterministic trigger.
    SyncWhiteboard { snapshot: Vec<u8> },
    /// One chat message, delivered to every member including the sender.
    Chat(ChatMessage),
    /// Join-time chat history replay, in original append order.
    SyncChat { messages: Vec<ChatMessage> },
    /// A member's transport dropped.
    UserDisconnected {
        conn_id: ConnId,
        display_name: String,
    },
}

impl ClientEvent {
    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (event, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Decode(e.to_string()))?;
        Ok(event)
    }
}

impl ServerEvent {
    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (event, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Decode(e.to_string()))?;
        Ok(event)
    }
}

/// Relay protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    Encode(String),
    Decode(String),
    ConnectionClosed,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Encode(e) => write!(f, "encode error: {e}"),
            Self::Decode(e) => write!(f, "decode error: {e}"),
            Self::ConnectionClosed => write!(f, "connection closed"),
        }
    }
}

impl std::error::Error for ProtocolError {}
