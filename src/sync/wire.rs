//! Binary protocol for the document sync channel.
//!
//! Frames are bincode-encoded [`SyncMessage`]s. The hub never
//! interprets `Update` payloads — they are opaque CRDT fragments whose
//! merge is commutative, associative, and idempotent, so any delivery
//! order or duplication converges.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Message kinds on the sync channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum SyncKind {
    /// Peer subscribed to a room; payload is a [`PeerProfile`].
    Join = 1,
    /// Opaque CRDT update fragment; buffered and fanned out unread.
    Update = 2,
    /// Ephemeral cursor state; fanned out, never buffered.
    Cursor = 3,
    /// Peer gone; synthesized by the hub on disconnect.
    Leave = 4,
    /// Heartbeat ping.
    Ping = 5,
    /// Heartbeat pong.
    Pong = 6,
}

/// Peer identity with display metadata for awareness rendering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerProfile {
    pub peer_id: Uuid,
    pub name: String,
    /// RGBA cursor color, derived stably from the peer id.
    pub color: [f32; 4],
}

impl PeerProfile {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4(), name)
    }

    /// Create with an explicit peer id (stable color included).
    pub fn with_id(peer_id: Uuid, name: impl Into<String>) -> Self {
        let hash = peer_id.as_u128();
        let r = (hash & 0xFF) as f32 / 255.0;
        let g = ((hash >> 8) & 0xFF) as f32 / 255.0;
        let b = ((hash >> 16) & 0xFF) as f32 / 255.0;
        Self {
            peer_id,
            name: name.into(),
            color: [r, g, b, 1.0],
        }
    }
}

/// Selection cursor inside the shared document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorState {
    /// Selection start, character offset.
    pub anchor: u32,
    /// Selection end (caret), character offset.
    pub head: u32,
    /// Sender-side timestamp, milliseconds since the Unix epoch.
    pub timestamp: u64,
}

/// Top-level sync channel frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMessage {
    pub kind: SyncKind,
    pub peer_id: Uuid,
    /// Room-scoped channel name.
    pub room: String,
    /// Payload; meaning varies by kind.
    pub payload: Vec<u8>,
}

impl SyncMessage {
    /// Create a join announcement carrying the peer's profile.
    pub fn join(room: impl Into<String>, profile: &PeerProfile) -> Self {
        let payload = bincode::serde::encode_to_vec(profile, bincode::config::standard())
            .unwrap_or_default();
        Self {
            kind: SyncKind::Join,
            peer_id: profile.peer_id,
            room: room.into(),
            payload,
        }
    }

    /// Create an opaque document update fragment.
    pub fn update(peer_id: Uuid, room: impl Into<String>, fragment: Vec<u8>) -> Self {
        Self {
            kind: SyncKind::Update,
            peer_id,
            room: room.into(),
            payload: fragment,
        }
    }

    /// Create an ephemeral cursor update.
    pub fn cursor(peer_id: Uuid, room: impl Into<String>, state: &CursorState) -> Self {
        let payload = bincode::serde::encode_to_vec(state, bincode::config::standard())
            .unwrap_or_default();
        Self {
            kind: SyncKind::Cursor,
            peer_id,
            room: room.into(),
            payload,
        }
    }

    /// Create a leave notice.
    pub fn leave(peer_id: Uuid, room: impl Into<String>) -> Self {
        Self {
            kind: SyncKind::Leave,
            peer_id,
            room: room.into(),
            payload: Vec::new(),
        }
    }

    pub fn ping(peer_id: Uuid) -> Self {
        Self {
            kind: SyncKind::Ping,
            peer_id,
            room: String::new(),
            payload: Vec::new(),
        }
    }

    pub fn pong(peer_id: Uuid) -> Self {
        Self {
            kind: SyncKind::Pong,
            peer_id,
            room: String::new(),
            payload: Vec::new(),
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, SyncError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| SyncError::Encode(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, SyncError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| SyncError::Decode(e.to_string()))?;
        Ok(msg)
    }

    /// Parse the profile payload of a `Join`.
    pub fn profile(&self) -> Result<PeerProfile, SyncError> {
        if self.kind != SyncKind::Join {
            return Err(SyncError::WrongKind);
        }
        let (profile, _) =
            bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
                .map_err(|e| SyncError::Decode(e.to_string()))?;
        Ok(profile)
    }

    /// Parse the cursor payload of a `Cursor`.
    pub fn cursor_state(&self) -> Result<CursorState, SyncError> {
        if self.kind != SyncKind::Cursor {
            return Err(SyncError::WrongKind);
        }
        let (state, _) =
            bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
                .map_err(|e| SyncError::Decode(e.to_string()))?;
        Ok(state)
    }
}

/// Sync channel errors.
#[derive(Debug, Clone)]
pub enum SyncError {
    Encode(String),
    Decode(String),
    WrongKind,
    ConnectionClosed,
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Encode(e) => write!(f, "encode error: {e}"),
            Self::Decode(e) => write!(f, "decode error: {e}"),
            Self::WrongKind => write!(f, "payload accessor used on wrong message kind"),
            Self::ConnectionClosed => write!(f, "connection closed"),
        }
    }
}

impl std::error::Error for SyncError {}
