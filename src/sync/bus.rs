//! Room-keyed fan-out for the sync channel.
//!
//! Each room-scoped channel is one [`UpdateBus`]: a tokio broadcast
//! channel of pre-encoded frames, a peer roster, and a bounded backlog
//! of update fragments. The backlog is replayed to every new
//! subscriber, which is what lets a peer that was offline while others
//! edited catch up from the hub alone; replaying a fragment a
//! subscriber already has is harmless because CRDT merge is
//! idempotent.
//!
//! Receivers filter out their own `peer_id` — the channel itself
//! delivers to all subscribers.
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapter 8

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::sync::wire::PeerProfile;

/// Fan-out statistics for one bus.
#[derive(Debug, Clone, Default)]
pub struct BusStats {
    pub messages_published: u64,
    pub fragments_buffered: u64,
    pub active_peers: usize,
}

struct AtomicBusStats {
    messages_published: AtomicU64,
    fragments_buffered: AtomicU64,
}

/// Fan-out bus for a single room-scoped channel.
pub struct UpdateBus {
    sender: broadcast::Sender<Arc<Vec<u8>>>,
    peers: RwLock<HashMap<Uuid, PeerProfile>>,
    /// Update fragments replayed to late subscribers, oldest first.
    backlog: RwLock<VecDeque<Arc<Vec<u8>>>>,
    backlog_capacity: usize,
    capacity: usize,
    stats: AtomicBusStats,
}

impl UpdateBus {
    /// `capacity` bounds frames buffered per lagging receiver;
    /// `backlog_capacity` bounds fragments kept for late subscribers.
    pub fn new(capacity: usize, backlog_capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            peers: RwLock::new(HashMap::new()),
            backlog: RwLock::new(VecDeque::new()),
            backlog_capacity,
            capacity,
            stats: AtomicBusStats {
                messages_published: AtomicU64::new(0),
                fragments_buffered: AtomicU64::new(0),
            },
        }
    }

    /// Register a peer and return its receiver plus a snapshot of the
    /// backlog to replay to it.
    pub async fn subscribe(
        &self,
        profile: PeerProfile,
    ) -> (broadcast::Receiver<Arc<Vec<u8>>>, Vec<Arc<Vec<u8>>>) {
        let rx = self.sender.subscribe();
        self.peers.write().await.insert(profile.peer_id, profile);
        let backlog = self.backlog.read().await.iter().cloned().collect();
        (rx, backlog)
    }

    pub async fn remove_peer(&self, peer_id: &Uuid) -> Option<PeerProfile> {
        self.peers.write().await.remove(peer_id)
    }

    /// Fan a pre-encoded frame out to all subscribers.
    ///
    /// Returns the number of receivers; zero when nobody listens.
    pub fn publish(&self, frame: Arc<Vec<u8>>) -> usize {
        let count = self.sender.send(frame).unwrap_or(0);
        self.stats.messages_published.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Append an update fragment to the backlog, then fan it out.
    ///
    /// The oldest fragments are shed once the backlog is full.
    pub async fn publish_buffered(&self, frame: Arc<Vec<u8>>) -> usize {
        {
            let mut backlog = self.backlog.write().await;
            backlog.push_back(frame.clone());
            while backlog.len() > self.backlog_capacity {
                backlog.pop_front();
            }
        }
        self.stats.fragments_buffered.fetch_add(1, Ordering::Relaxed);
        self.publish(frame)
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn peers(&self) -> Vec<PeerProfile> {
        self.peers.read().await.values().cloned().collect()
    }

    pub async fn backlog_len(&self) -> usize {
        self.backlog.read().await.len()
    }

    pub async fn stats(&self) -> BusStats {
        BusStats {
            messages_published: self.stats.messages_published.load(Ordering::Relaxed),
            fragments_buffered: self.stats.fragments_buffered.load(Ordering::Relaxed),
            active_peers: self.peers.read().await.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Lazily-created buses, keyed by room name.
pub struct BusMap {
    rooms: RwLock<HashMap<String, Arc<UpdateBus>>>,
    channel_capacity: usize,
    backlog_capacity: usize,
}

impl BusMap {
    pub fn new(channel_capacity: usize, backlog_capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            channel_capacity,
            backlog_capacity,
        }
    }

    /// Get or create the bus for a room.
    pub async fn get_or_create(&self, room: &str) -> Arc<UpdateBus> {
        {
            let rooms = self.rooms.read().await;
            if let Some(bus) = rooms.get(room) {
                return bus.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        // Double-check after lock upgrade.
        if let Some(bus) = rooms.get(room) {
            return bus.clone();
        }
        let bus = Arc::new(UpdateBus::new(self.channel_capacity, self.backlog_capacity));
        rooms.insert(room.to_string(), bus.clone());
        bus
    }

    /// Remove a room's bus (and its backlog) once empty.
    pub async fn remove_if_empty(&self, room: &str) -> bool {
        let mut rooms = self.rooms.write().await;
        if let Some(bus) = rooms.get(room) {
            if bus.peer_count().await == 0 {
                rooms.remove(room);
                return true;
            }
        }
        false
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_rooms(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }
}
