//! RocksDB-backed room store.
//!
//! Column families:
//! - `rooms`    — canonical document snapshots, LZ4 compressed, keyed by
//!                room code. Exactly one `doc` value per room.
//! - `audio`    — side-channel blobs, keyed `{room}/{item}` (raw bytes;
//!                float sample data does not compress usefully).
//! - `metadata` — per-room bookkeeping records (bincode).
//!
//! The store is shared by every room actor but each room only ever touches
//! its own keys; the actor's sequential processing keeps per-room writes
//! ordered.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::SystemTime;

const CF_ROOMS: &str = "rooms";
const CF_AUDIO: &str = "audio";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_ROOMS, CF_AUDIO, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("patchbay_data"),
            block_cache_size: 64 * 1024 * 1024,
            sync_writes: false,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches, temp directory).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 4 * 1024 * 1024,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 1024 * 1024,
        }
    }
}

/// Per-room bookkeeping stored alongside the snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomRecord {
    pub room_code: String,
    /// Uncompressed snapshot size in bytes
    pub doc_size: u64,
    /// Compressed snapshot size in bytes
    pub compressed_size: u64,
    /// Creation timestamp (seconds since epoch)
    pub created_at: u64,
    /// Last persisted timestamp (seconds since epoch)
    pub updated_at: u64,
}

impl RoomRecord {
    fn new(room_code: &str) -> Self {
        let now = epoch_secs();
        Self {
            room_code: room_code.to_string(),
            doc_size: 0,
            compressed_size: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (record, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(record)
    }
}

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// RocksDB internal error
    DatabaseError(String),
    /// Room snapshot or blob not found
    NotFound(String),
    /// Serialization failed
    SerializationError(String),
    /// Deserialization failed
    DeserializationError(String),
    /// Compression error
    CompressionError(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::NotFound(key) => write!(f, "Not found: {key}"),
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::CompressionError(e) => write!(f, "Compression error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

/// RocksDB-backed room store.
pub struct RoomStore {
    /// RocksDB instance (single-threaded mode — concurrency via tokio)
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RoomStore {
    /// Open the store at the configured path, creating the database and
    /// column families if they don't exist.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_ROOMS => {
                // Snapshots are already LZ4 compressed before the write.
                opts.set_compression_type(DBCompressionType::None);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_AUDIO => {
                opts.set_compression_type(DBCompressionType::None);
            }
            CF_METADATA => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    // ─── Room documents ───────────────────────────────────────────────

    /// Persist the canonical document for a room (LZ4 compressed), updating
    /// the room record in the same atomic batch.
    pub fn save_doc(&self, room_code: &str, doc_bytes: &[u8]) -> Result<RoomRecord, StoreError> {
        let cf_rooms = self.cf(CF_ROOMS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let compressed = lz4_flex::compress_prepend_size(doc_bytes);

        let mut record = self
            .load_record(room_code)
            .unwrap_or_else(|_| RoomRecord::new(room_code));
        record.doc_size = doc_bytes.len() as u64;
        record.compressed_size = compressed.len() as u64;
        record.updated_at = epoch_secs();

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_rooms, room_code.as_bytes(), &compressed);
        batch.put_cf(&cf_meta, room_code.as_bytes(), &record.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        Ok(record)
    }

    /// Load a room's canonical document bytes.
    pub fn load_doc(&self, room_code: &str) -> Result<Vec<u8>, StoreError> {
        let cf = self.cf(CF_ROOMS)?;
        match self.db.get_cf(&cf, room_code.as_bytes())? {
            Some(compressed) => lz4_flex::decompress_size_prepended(&compressed)
                .map_err(|e| StoreError::CompressionError(e.to_string())),
            None => Err(StoreError::NotFound(room_code.to_string())),
        }
    }

    /// Check whether a room has ever been persisted.
    pub fn room_exists(&self, room_code: &str) -> Result<bool, StoreError> {
        let cf = self.cf(CF_ROOMS)?;
        Ok(self.db.get_cf(&cf, room_code.as_bytes())?.is_some())
    }

    /// All persisted room codes.
    pub fn list_rooms(&self) -> Result<Vec<String>, StoreError> {
        let cf = self.cf(CF_ROOMS)?;
        let mut rooms = Vec::new();
        for entry in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = entry?;
            rooms.push(String::from_utf8_lossy(&key).into_owned());
        }
        Ok(rooms)
    }

    /// Load a room's bookkeeping record.
    pub fn load_record(&self, room_code: &str) -> Result<RoomRecord, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(&cf, room_code.as_bytes())? {
            Some(bytes) => RoomRecord::decode(&bytes),
            None => Err(StoreError::NotFound(room_code.to_string())),
        }
    }

    // ─── Audio blobs ──────────────────────────────────────────────────

    /// Store a side-channel blob.
    pub fn put_audio(&self, room_code: &str, item_id: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let cf = self.cf(CF_AUDIO)?;
        self.db.put_cf(&cf, audio_key(room_code, item_id), bytes)?;
        Ok(())
    }

    /// Fetch a side-channel blob.
    pub fn get_audio(&self, room_code: &str, item_id: &str) -> Result<Vec<u8>, StoreError> {
        let cf = self.cf(CF_AUDIO)?;
        match self.db.get_cf(&cf, audio_key(room_code, item_id))? {
            Some(bytes) => Ok(bytes),
            None => Err(StoreError::NotFound(audio_key(room_code, item_id))),
        }
    }

    /// Delete a side-channel blob. Deleting a missing key is not an error.
    pub fn delete_audio(&self, room_code: &str, item_id: &str) -> Result<(), StoreError> {
        let cf = self.cf(CF_AUDIO)?;
        self.db.delete_cf(&cf, audio_key(room_code, item_id))?;
        Ok(())
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("missing column family {name}")))
    }
}

fn audio_key(room_code: &str, item_id: &str) -> String {
    format!("{room_code}/{item_id}")
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
