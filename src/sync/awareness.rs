//! Ephemeral per-peer presence on the sync channel.
//!
//! Awareness entries (profile, cursor) are never persisted and never
//! buffered; an entry exists only while its owning peer is connected
//! and disappears on `Leave`. Outgoing cursor updates are rate-limited
//! to roughly 30 fps.

use std::collections::HashMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::sync::wire::{CursorState, PeerProfile, SyncKind, SyncMessage};

/// One remote peer's ephemeral state.
#[derive(Debug, Clone)]
pub struct AwarenessEntry {
    pub profile: PeerProfile,
    pub cursor: Option<CursorState>,
    pub last_seen: Instant,
}

/// Tracks remote peers' profiles and cursors.
#[derive(Default)]
pub struct AwarenessBook {
    entries: HashMap<Uuid, AwarenessEntry>,
}

impl AwarenessBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one incoming sync frame to the book.
    ///
    /// `Update`/`Ping`/`Pong` frames carry no awareness and are
    /// ignored. A cursor from a peer whose `Join` we never saw gets a
    /// placeholder profile so rendering never has to special-case it.
    pub fn apply(&mut self, msg: &SyncMessage) {
        match msg.kind {
            SyncKind::Join => {
                let profile = msg
                    .profile()
                    .unwrap_or_else(|_| PeerProfile::with_id(msg.peer_id, "Anonymous"));
                self.entries.insert(
                    msg.peer_id,
                    AwarenessEntry {
                        profile,
                        cursor: None,
                        last_seen: Instant::now(),
                    },
                );
            }
            SyncKind::Cursor => {
                let Ok(cursor) = msg.cursor_state() else {
                    return;
                };
                let entry = self.entries.entry(msg.peer_id).or_insert_with(|| {
                    AwarenessEntry {
                        profile: PeerProfile::with_id(msg.peer_id, "Anonymous"),
                        cursor: None,
                        last_seen: Instant::now(),
                    }
                });
                entry.cursor = Some(cursor);
                entry.last_seen = Instant::now();
            }
            SyncKind::Leave => {
                self.entries.remove(&msg.peer_id);
            }
            SyncKind::Update | SyncKind::Ping | SyncKind::Pong => {}
        }
    }

    pub fn get(&self, peer_id: &Uuid) -> Option<&AwarenessEntry> {
        self.entries.get(peer_id)
    }

    pub fn peers(&self) -> Vec<&AwarenessEntry> {
        self.entries.values().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Rate limiter for outgoing cursor updates (~30 fps).
#[derive(Debug)]
pub struct CursorThrottle {
    min_interval: Duration,
    last_sent: Option<Instant>,
}

impl CursorThrottle {
    pub fn new() -> Self {
        Self::with_interval(Duration::from_millis(33))
    }

    pub fn with_interval(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_sent: None,
        }
    }

    /// Whether an update may be sent now; arms the interval if so.
    pub fn ready(&mut self) -> bool {
        let now = Instant::now();
        match self.last_sent {
            Some(last) if now.duration_since(last) < self.min_interval => false,
            _ => {
                self.last_sent = Some(now);
                true
            }
        }
    }
}

impl Default for CursorThrottle {
    fn default() -> Self {
        Self::new()
    }
}
