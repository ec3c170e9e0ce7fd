//! RocksDB-backed durable local cache.
//!
//! Column families:
//! - `documents`   — full CRDT document state per room (LZ4 compressed)
//! - `whiteboards` — last-known whiteboard snapshot per room (LZ4 compressed)
//! - `metadata`    — per-entry sizes and timestamps
//!
//! This is client-side storage: it is what lets a peer reopen a room
//! offline and still see the latest locally-known document, and what
//! backs the whiteboard recovery push after a server restart. The
//! relay itself persists nothing.
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapter 3

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::SystemTime;

const CF_DOCUMENTS: &str = "documents";
const CF_WHITEBOARDS: &str = "whiteboards";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_WHITEBOARDS, CF_METADATA];

/// Cache configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Database directory path.
    pub path: PathBuf,
    /// Block cache size in bytes.
    pub block_cache_size: usize,
    /// Bloom filter bits per key.
    pub bloom_filter_bits: i32,
    /// fsync every write (default: off, batch fsync).
    pub sync_writes: bool,
    /// Max open files for RocksDB.
    pub max_open_files: i32,
    /// Write buffer size per column family.
    pub write_buffer_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("huddle_cache"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl CacheConfig {
    /// Create config for testing (small caches, temp directory).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 4 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 2 * 1024 * 1024,
        }
    }
}

/// Sizes and timestamps tracked per cached entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryMeta {
    /// Uncompressed size in bytes.
    pub raw_size: u64,
    /// Compressed size in bytes.
    pub compressed_size: u64,
    /// Creation timestamp, seconds since epoch.
    pub created_at: u64,
    /// Last write timestamp, seconds since epoch.
    pub updated_at: u64,
}

impl EntryMeta {
    fn new() -> Self {
        let now = now_secs();
        Self {
            raw_size: 0,
            compressed_size: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, CacheError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| CacheError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, CacheError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| CacheError::Deserialization(e.to_string()))?;
        Ok(meta)
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Cache errors.
#[derive(Debug, Clone)]
pub enum CacheError {
    Database(String),
    /// No cached entry for this room.
    NotFound(String),
    Serialization(String),
    Deserialization(String),
    Compression(String),
}

impl std::fmt::Display for CacheError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheError::Database(e) => write!(f, "database error: {e}"),
            CacheError::NotFound(room) => write!(f, "no cached entry for room {room}"),
            CacheError::Serialization(e) => write!(f, "serialization error: {e}"),
            CacheError::Deserialization(e) => write!(f, "deserialization error: {e}"),
            CacheError::Compression(e) => write!(f, "compression error: {e}"),
        }
    }
}

impl std::error::Error for CacheError {}

impl From<rocksdb::Error> for CacheError {
    fn from(e: rocksdb::Error) -> Self {
        CacheError::Database(e.to_string())
    }
}

/// Durable local cache for document state and whiteboard snapshots.
///
/// Single-threaded RocksDB mode — concurrency comes from tokio, not
/// from the storage engine. Values are LZ4 compressed.
pub struct DocCache {
    db: DBWithThreadMode<SingleThreaded>,
    config: CacheConfig,
}

impl DocCache {
    /// Open the cache at the configured path, creating it if missing.
    pub fn open(config: CacheConfig) -> Result<Self, CacheError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(&config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        Ok(Self { db, config })
    }

    fn cf_options(config: &CacheConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);
        opts.optimize_for_point_lookup(config.block_cache_size as u64);

        opts
    }

    /// Save the full CRDT document state for a room.
    pub fn save_document(&self, room: &str, state: &[u8]) -> Result<EntryMeta, CacheError> {
        self.save(CF_DOCUMENTS, room, state)
    }

    /// Load the cached CRDT document state for a room.
    pub fn load_document(&self, room: &str) -> Result<Vec<u8>, CacheError> {
        self.load(CF_DOCUMENTS, room)
    }

    /// Save the last-known whiteboard snapshot for a room.
    pub fn save_whiteboard(&self, room: &str, snapshot: &[u8]) -> Result<EntryMeta, CacheError> {
        self.save(CF_WHITEBOARDS, room, snapshot)
    }

    /// Load the cached whiteboard snapshot for a room.
    pub fn load_whiteboard(&self, room: &str) -> Result<Vec<u8>, CacheError> {
        self.load(CF_WHITEBOARDS, room)
    }

    /// Entry metadata for a cached document, if present.
    pub fn document_meta(&self, room: &str) -> Result<EntryMeta, CacheError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(&cf, Self::meta_key(CF_DOCUMENTS, room))? {
            Some(bytes) => EntryMeta::decode(&bytes),
            None => Err(CacheError::NotFound(room.to_string())),
        }
    }

    /// All rooms with a cached document.
    pub fn cached_rooms(&self) -> Result<Vec<String>, CacheError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        let mut rooms = Vec::new();
        for entry in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = entry?;
            rooms.push(String::from_utf8_lossy(&key).into_owned());
        }
        Ok(rooms)
    }

    /// Drop every cached entry for a room.
    pub fn forget_room(&self, room: &str) -> Result<(), CacheError> {
        let mut batch = WriteBatch::default();
        batch.delete_cf(&self.cf(CF_DOCUMENTS)?, room.as_bytes());
        batch.delete_cf(&self.cf(CF_WHITEBOARDS)?, room.as_bytes());
        batch.delete_cf(&self.cf(CF_METADATA)?, Self::meta_key(CF_DOCUMENTS, room));
        batch.delete_cf(&self.cf(CF_METADATA)?, Self::meta_key(CF_WHITEBOARDS, room));
        self.db.write(batch)?;
        Ok(())
    }

    fn save(&self, cf_name: &str, room: &str, value: &[u8]) -> Result<EntryMeta, CacheError> {
        let cf = self.cf(cf_name)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let compressed = lz4_flex::compress_prepend_size(value);

        let meta_key = Self::meta_key(cf_name, room);
        let mut meta = match self.db.get_cf(&cf_meta, &meta_key)? {
            Some(bytes) => EntryMeta::decode(&bytes)?,
            None => EntryMeta::new(),
        };
        meta.raw_size = value.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.updated_at = now_secs();

        // Value + metadata land atomically.
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf, room.as_bytes(), &compressed);
        batch.put_cf(&cf_meta, &meta_key, &meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        Ok(meta)
    }

    fn load(&self, cf_name: &str, room: &str) -> Result<Vec<u8>, CacheError> {
        let cf = self.cf(cf_name)?;
        match self.db.get_cf(&cf, room.as_bytes())? {
            Some(compressed) => lz4_flex::decompress_size_prepended(&compressed)
                .map_err(|e| CacheError::Compression(e.to_string())),
            None => Err(CacheError::NotFound(room.to_string())),
        }
    }

    fn meta_key(cf_name: &str, room: &str) -> Vec<u8> {
        format!("{cf_name}:{room}").into_bytes()
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, CacheError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| CacheError::Database(format!("missing column family {name}")))
    }
}
