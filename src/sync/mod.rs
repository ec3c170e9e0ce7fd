//! CRDT replication channel: hub, client feed, awareness, durable cache.
//!
//! This channel is fully independent of the relay — its own port, its
//! own wire protocol, its own connection status. The hub is a dumb
//! message bus that buffers and forwards opaque update fragments; all
//! merge intelligence lives client-side in [`DocFeed`].
//!
//! ```text
//! ┌──────────┐   Update / Cursor   ┌─────────┐
//! │ DocFeed  │ ◄─────────────────► │ SyncHub │
//! │ (yrs doc)│    binary frames    │ (bus)   │
//! └────┬─────┘                     └────┬────┘
//!      │                                │
//!      ▼                                ▼
//! ┌──────────┐                   update backlog
//! │ DocCache │                   (late-subscriber replay)
//! │ (RocksDB)│
//! └──────────┘
//! ```

pub mod awareness;
pub mod bus;
pub mod cache;
pub mod feed;
pub mod hub;
pub mod wire;

pub use awareness::{AwarenessBook, AwarenessEntry, CursorThrottle};
pub use bus::{BusMap, BusStats, UpdateBus};
pub use cache::{CacheConfig, CacheError, DocCache, EntryMeta};
pub use feed::{DocFeed, FeedConfig, FeedEvent, FeedStatus, OfflineQueue};
pub use hub::{HubConfig, HubStats, SyncHub};
pub use wire::{CursorState, PeerProfile, SyncError, SyncKind, SyncMessage};
