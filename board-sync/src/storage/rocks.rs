//! RocksDB-backed persistent event store.
//!
//! Column families:
//! - `events`: Board log events (bincode, LZ4 compressed, keyed by board_id:seq)
//! - `boards`: Per-board metadata (bincode: last seq, event count, timestamps)
//!
//! A board's events share a 16-byte key prefix, so rehydration is a single
//! forward prefix scan returning events in `seq` order.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use uuid::Uuid;

use super::{ActionStore, StoreError};
use crate::action::{BoardId, LogEvent};

/// Column family names.
const CF_EVENTS: &str = "events";
const CF_BOARDS: &str = "boards";

const COLUMN_FAMILIES: &[&str] = &[CF_EVENTS, CF_BOARDS];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("board_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches, caller-provided directory.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// Board metadata stored alongside the events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoardMetadata {
    pub board_id: Uuid,
    /// Highest `seq` written
    pub last_seq: u64,
    pub event_count: u64,
    /// Compressed bytes written for this board
    pub stored_bytes: u64,
    /// Creation timestamp (seconds since epoch)
    pub created_at: u64,
    /// Last modified timestamp (seconds since epoch)
    pub updated_at: u64,
}

impl BoardMetadata {
    fn new(board_id: Uuid) -> Self {
        let now = unix_seconds();
        Self {
            board_id,
            last_seq: 0,
            event_count: 0,
            stored_bytes: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(meta)
    }
}

/// bincode, then LZ4 with the uncompressed size prepended.
fn encode_event(event: &LogEvent) -> Result<Vec<u8>, StoreError> {
    let raw = bincode::serde::encode_to_vec(event, bincode::config::standard())
        .map_err(|e| StoreError::SerializationError(e.to_string()))?;
    Ok(lz4_flex::compress_prepend_size(&raw))
}

fn decode_event(bytes: &[u8]) -> Result<LogEvent, StoreError> {
    let raw = lz4_flex::decompress_size_prepended(bytes)
        .map_err(|e| StoreError::CompressionError(e.to_string()))?;
    let (event, _) = bincode::serde::decode_from_slice(&raw, bincode::config::standard())
        .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
    Ok(event)
}

/// RocksDB-backed [`ActionStore`].
pub struct RocksStore {
    /// RocksDB instance (single-threaded mode: column families are fixed at open)
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksStore {
    /// Open the store at the configured path, creating the database and
    /// column families if they don't exist.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::info!("Opened board store at {}", config.path.display());
        Ok(Self { db, config })
    }

    /// Build column-family-specific options.
    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_EVENTS => {
                // Values are already LZ4 compressed.
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(4);
                opts.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(16));
            }
            CF_BOARDS => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    /// Load board metadata.
    pub fn load_metadata(&self, board_id: BoardId) -> Result<BoardMetadata, StoreError> {
        let cf = self.cf(CF_BOARDS)?;
        match self.db.get_cf(cf, board_id.as_bytes())? {
            Some(bytes) => BoardMetadata::decode(&bytes),
            None => Err(StoreError::NotFound(board_id)),
        }
    }

    /// Force buffered writes to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Get a column family handle.
    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }

    /// Event key: board_id (16 bytes) + seq (8 bytes big-endian).
    fn event_key(board_id: BoardId, seq: u64) -> Vec<u8> {
        let mut key = Vec::with_capacity(24);
        key.extend_from_slice(board_id.as_bytes());
        key.extend_from_slice(&seq.to_be_bytes());
        key
    }

    /// Keys of all events of a board, in seq order.
    fn scan_board(&self, board_id: BoardId) -> Result<Vec<(Box<[u8]>, Box<[u8]>)>, StoreError> {
        let cf = self.cf(CF_EVENTS)?;
        let start_key = Self::event_key(board_id, 0);

        let mut entries = Vec::new();
        let iter = self.db.iterator_cf(
            cf,
            IteratorMode::From(&start_key, rocksdb::Direction::Forward),
        );
        for item in iter {
            let (key, value) = item?;
            if key.len() < 24 || &key[..16] != board_id.as_bytes() {
                break;
            }
            entries.push((key, value));
        }
        Ok(entries)
    }
}

impl ActionStore for RocksStore {
    fn append(&self, board_id: BoardId, seq: u64, event: &LogEvent) -> Result<(), StoreError> {
        let cf_events = self.cf(CF_EVENTS)?;
        let cf_boards = self.cf(CF_BOARDS)?;

        let value = encode_event(event)?;

        let mut meta = match self.load_metadata(board_id) {
            Ok(meta) => meta,
            Err(StoreError::NotFound(_)) => BoardMetadata::new(board_id),
            Err(e) => return Err(e),
        };
        meta.last_seq = meta.last_seq.max(seq);
        meta.event_count += 1;
        meta.stored_bytes += value.len() as u64;
        meta.updated_at = unix_seconds();

        // Event and metadata land together or not at all.
        let mut batch = WriteBatch::default();
        batch.put_cf(cf_events, Self::event_key(board_id, seq), &value);
        batch.put_cf(cf_boards, board_id.as_bytes(), meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        Ok(())
    }

    fn load_all(&self, board_id: BoardId) -> Result<Vec<LogEvent>, StoreError> {
        self.scan_board(board_id)?
            .iter()
            .map(|(_, value)| decode_event(value))
            .collect()
    }

    fn list_boards(&self) -> Result<Vec<BoardId>, StoreError> {
        let cf = self.cf(CF_BOARDS)?;
        let mut board_ids = Vec::new();

        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            if key.len() == 16 {
                let bytes: [u8; 16] = key
                    .as_ref()
                    .try_into()
                    .map_err(|_| StoreError::DeserializationError("Invalid UUID key".into()))?;
                board_ids.push(Uuid::from_bytes(bytes));
            }
        }

        Ok(board_ids)
    }

    fn delete_board(&self, board_id: BoardId) -> Result<(), StoreError> {
        let cf_events = self.cf(CF_EVENTS)?;
        let cf_boards = self.cf(CF_BOARDS)?;

        let mut batch = WriteBatch::default();
        for (key, _) in self.scan_board(board_id)? {
            batch.delete_cf(cf_events, key);
        }
        batch.delete_cf(cf_boards, board_id.as_bytes());

        self.db.write(batch)?;
        log::info!("Deleted board {board_id} from store");
        Ok(())
    }
}

fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{Action, ActionPayload, Attachment, Point, StrokePayload, TextPayload};
    use tempfile::TempDir;

    fn open_temp() -> (TempDir, RocksStore) {
        let dir = TempDir::new().unwrap();
        let store = RocksStore::open(StoreConfig::for_testing(dir.path())).unwrap();
        (dir, store)
    }

    fn committed(board_id: BoardId, id: u64) -> LogEvent {
        LogEvent::Committed(Action {
            id,
            board_id,
            author_id: "alice".into(),
            committed_at: 1_700_000_000_000 + id,
            payload: ActionPayload::Stroke(StrokePayload {
                points: vec![Point::new(0.0, 0.0), Point::new(id as f64, 2.5)],
                color: "#112233".into(),
                width: 3.0,
            }),
        })
    }

    #[test]
    fn test_store_open() {
        let (dir, store) = open_temp();
        assert_eq!(store.path(), dir.path());
        assert!(store.list_boards().unwrap().is_empty());
    }

    #[test]
    fn test_append_load_all() {
        let (_dir, store) = open_temp();
        let board = Uuid::new_v4();

        store.append(board, 1, &committed(board, 1)).unwrap();
        store.append(board, 2, &committed(board, 2)).unwrap();
        store.append(board, 3, &LogEvent::Undone(2)).unwrap();

        let events = store.load_all(board).unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0], committed(board, 1));
        assert_eq!(events[2], LogEvent::Undone(2));

        let meta = store.load_metadata(board).unwrap();
        assert_eq!(meta.last_seq, 3);
        assert_eq!(meta.event_count, 3);
        assert!(meta.stored_bytes > 0);
    }

    #[test]
    fn test_seq_order_beyond_byte_boundary() {
        let (_dir, store) = open_temp();
        let board = Uuid::new_v4();

        // Big-endian keys keep 255 < 256 < 1000 in scan order.
        for seq in [1000u64, 255, 256, 1] {
            store.append(board, seq, &LogEvent::Undone(seq)).unwrap();
        }
        let ids: Vec<u64> = store
            .load_all(board)
            .unwrap()
            .iter()
            .map(LogEvent::action_id)
            .collect();
        assert_eq!(ids, vec![1, 255, 256, 1000]);
    }

    #[test]
    fn test_boards_do_not_mix() {
        let (_dir, store) = open_temp();
        let board_a = Uuid::new_v4();
        let board_b = Uuid::new_v4();

        store.append(board_a, 1, &committed(board_a, 1)).unwrap();
        store.append(board_b, 1, &committed(board_b, 1)).unwrap();
        store.append(board_b, 2, &committed(board_b, 2)).unwrap();

        assert_eq!(store.load_all(board_a).unwrap().len(), 1);
        assert_eq!(store.load_all(board_b).unwrap().len(), 2);
        assert!(store.load_all(Uuid::new_v4()).unwrap().is_empty());

        let listed = store.list_boards().unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed.contains(&board_a) && listed.contains(&board_b));
    }

    #[test]
    fn test_attachment_survives_storage() {
        let (_dir, store) = open_temp();
        let board = Uuid::new_v4();
        let event = LogEvent::Committed(Action {
            id: 1,
            board_id: board,
            author_id: "owner".into(),
            committed_at: 0,
            payload: ActionPayload::Text(TextPayload {
                text: "notes.pdf".into(),
                x: None,
                y: Some(4.0),
                attachment: Some(Attachment {
                    mime: "application/pdf".into(),
                    data: "JVBERi0xLjQK".repeat(64),
                }),
            }),
        });

        store.append(board, 1, &event).unwrap();
        assert_eq!(store.load_all(board).unwrap(), vec![event]);
    }

    #[test]
    fn test_delete_board() {
        let (_dir, store) = open_temp();
        let board = Uuid::new_v4();
        store.append(board, 1, &committed(board, 1)).unwrap();
        store.append(board, 2, &LogEvent::Undone(1)).unwrap();

        store.delete_board(board).unwrap();
        assert!(store.load_all(board).unwrap().is_empty());
        assert!(matches!(store.load_metadata(board), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_reopen_keeps_events() {
        let dir = TempDir::new().unwrap();
        let board = Uuid::new_v4();
        {
            let store = RocksStore::open(StoreConfig::for_testing(dir.path())).unwrap();
            store.append(board, 1, &committed(board, 1)).unwrap();
            store.sync().unwrap();
        }
        let store = RocksStore::open(StoreConfig::for_testing(dir.path())).unwrap();
        assert_eq!(store.load_all(board).unwrap(), vec![committed(board, 1)]);
    }

    #[test]
    fn test_corrupt_value_is_an_error() {
        assert!(matches!(
            decode_event(b"junk"),
            Err(StoreError::CompressionError(_)) | Err(StoreError::DeserializationError(_))
        ));
    }
}
