//! # huddle-collab — Real-time collaboration core
//!
//! A relay for shared coding/chat/whiteboard rooms plus an independent
//! conflict-free text-replication channel.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ClientEvent/ServerEvent   ┌─────────────┐
//! │ RoomSession │ ◄─────────────────────────► │ RelayServer │
//! │ (per user)  │       Binary Proto          │ (central)   │
//! └──────┬──────┘                             └──────┬──────┘
//!        │                                           │
//!        │ whiteboard cache                          ▼
//!        │                                    ┌─────────────┐
//!        │                                    │ RoomRegistry│
//!        │                                    │ code/chat/  │
//!        │                                    │ wb/presence │
//!        │                                    └─────────────┘
//!        ▼
//! ┌─────────────┐    opaque CRDT fragments    ┌─────────────┐
//! │ DocFeed     │ ◄─────────────────────────► │ SyncHub     │
//! │ (yrs doc +  │       own port/status       │ (dumb bus + │
//! │  DocCache)  │                             │  backlog)   │
//! └─────────────┘                             └─────────────┘
//! ```
//!
//! The two channels carry different consistency models on purpose: the
//! relay's code and whiteboard state is last-writer-wins (a lightweight
//! preview surface), while the document body replicates through
//! commutative, idempotent CRDT merges that converge under any
//! reordering, duplication, or temporary disconnection.
//!
//! ## Modules
//!
//! - [`protocol`] — relay wire protocol (closed event enums)
//! - [`registry`] — connection registry, room store, presence
//! - [`relay`] — WebSocket relay server (event broadcaster)
//! - [`session`] — client reconciliation layer (reconnect, debounce,
//!   whiteboard recovery, assistant relay)
//! - [`sync`] — CRDT replication channel (hub, feed, awareness, cache)

pub mod protocol;
pub mod registry;
pub mod relay;
pub mod session;
pub mod sync;

// Re-exports for convenience
pub use protocol::{
    ChatMessage, ClientEvent, ConnId, CursorPos, Participant, ProtocolError, ServerEvent,
    ANONYMOUS_NAME, SYSTEM_SENDER,
};
pub use registry::{JoinOutcome, LeaveOutcome, Outbox, RetentionPolicy, RoomRegistry};
pub use relay::{RelayConfig, RelayServer, RelayStats};
pub use session::{
    Assistant, ReconnectPolicy, RoomSession, SessionConfig, SessionEvent, SessionState,
    ASSISTANT_PREFIX,
};
pub use sync::{
    AwarenessBook, BusMap, CacheConfig, DocCache, DocFeed, FeedConfig, FeedEvent, FeedStatus,
    HubConfig, PeerProfile, SyncHub, SyncMessage, UpdateBus,
};
