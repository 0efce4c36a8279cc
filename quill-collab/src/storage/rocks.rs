//! RocksDB-backed checkpoint store.
//!
//! Column families:
//! - `checkpoints`: latest checkpoint per document (bincode, LZ4 compressed)
//! - `log_tail`: applied entries since the checkpoint (keyed by doc:version)
//! - `metadata`: per-document bookkeeping (versions, sizes, timestamps)
//!
//! Keys: `<doc_id len:4 BE><doc_id bytes>` for point lookups, with the
//! version appended as 8 big-endian bytes for log entries, so a forward
//! iterator from `(doc, v)` walks that document's tail in version order.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::{Checkpoint, CheckpointStore, StoreError};
use crate::event_log::EventLogEntry;
use crate::operation::{now_millis, DocumentId, Version};

const CF_CHECKPOINTS: &str = "checkpoints";
const CF_LOG_TAIL: &str = "log_tail";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_CHECKPOINTS, CF_LOG_TAIL, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync every write batch (default: true for checkpoints' sake)
    pub sync_writes: bool,
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("quill_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches, no fsync.
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

/// Bookkeeping stored next to each document's checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub document_id: DocumentId,
    /// Version of the stored checkpoint (0 if none yet)
    pub checkpoint_version: Version,
    /// Highest version appended to the log tail
    pub last_log_version: Version,
    /// Uncompressed encoded checkpoint size in bytes
    pub checkpoint_size: u64,
    pub compressed_size: u64,
    /// Milliseconds since the Unix epoch
    pub created_at: u64,
    pub updated_at: u64,
}

impl DocumentMetadata {
    fn new(document_id: &str) -> Self {
        let now = now_millis();
        Self {
            document_id: document_id.to_string(),
            checkpoint_version: 0,
            last_log_version: 0,
            checkpoint_size: 0,
            compressed_size: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, StoreError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::Deserialization(e.to_string()))?;
    Ok(value)
}

/// Durable `CheckpointStore` on RocksDB.
///
/// Every mutation is a single atomic `WriteBatch` that also updates the
/// document's metadata row.
pub struct RocksCheckpointStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksCheckpointStore {
    /// Open the store, creating the database and column families if missing.
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

        log::info!("Opened checkpoint store at {}", config.path.display());
        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_CHECKPOINTS => {
                // Values are already LZ4 framed.
                opts.set_compression_type(DBCompressionType::None);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_LOG_TAIL => {
                // Many small appends, range-scanned per document
                opts.set_max_write_buffer_number(4);
                opts.set_compression_type(DBCompressionType::Lz4);
            }
            CF_METADATA => {
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    // ─── Metadata ─────────────────────────────────────────────────────

    pub fn load_metadata(&self, document_id: &str) -> Result<Option<DocumentMetadata>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(cf, doc_key(document_id))? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Every document with a metadata row.
    pub fn list_documents(&self) -> Result<Vec<DocumentId>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut ids = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            let meta: DocumentMetadata = decode(&value)?;
            ids.push(meta.document_id);
        }
        Ok(ids)
    }

    /// Force memtables to disk.
    pub fn flush(&self) -> Result<(), StoreError> {
        for name in COLUMN_FAMILIES {
            self.db.flush_cf(self.cf(name)?)?;
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family '{name}' not found")))
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    fn metadata_or_new(&self, document_id: &str) -> Result<DocumentMetadata, StoreError> {
        Ok(self
            .load_metadata(document_id)?
            .unwrap_or_else(|| DocumentMetadata::new(document_id)))
    }
}

impl CheckpointStore for RocksCheckpointStore {
    fn load_checkpoint(&self, document_id: &str) -> Result<Option<Checkpoint>, StoreError> {
        let cf = self.cf(CF_CHECKPOINTS)?;
        let Some(compressed) = self.db.get_cf(cf, doc_key(document_id))? else {
            return Ok(None);
        };
        let bytes = lz4_flex::decompress_size_prepended(&compressed)
            .map_err(|e| StoreError::Compression(e.to_string()))?;
        Ok(Some(decode(&bytes)?))
    }

    fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<bool, StoreError> {
        let cf_ckpt = self.cf(CF_CHECKPOINTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        // The version check and the write are not one transaction; each
        // document has a single writer.
        let mut meta = self.metadata_or_new(&checkpoint.document_id)?;
        let has_checkpoint = self.db.get_cf(cf_ckpt, doc_key(&checkpoint.document_id))?.is_some();
        if has_checkpoint && meta.checkpoint_version >= checkpoint.version {
            log::debug!(
                "Ignoring checkpoint v{} for {}: store already holds v{}",
                checkpoint.version,
                checkpoint.document_id,
                meta.checkpoint_version
            );
            return Ok(false);
        }

        let encoded = encode(checkpoint)?;
        let compressed = lz4_flex::compress_prepend_size(&encoded);

        meta.checkpoint_version = checkpoint.version;
        meta.checkpoint_size = encoded.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.updated_at = now_millis();

        let key = doc_key(&checkpoint.document_id);
        let mut batch = WriteBatch::default();
        batch.put_cf(cf_ckpt, &key, &compressed);
        batch.put_cf(cf_meta, &key, encode(&meta)?);
        self.write(batch)?;
        Ok(true)
    }

    fn append_log(&self, document_id: &str, entry: &EventLogEntry) -> Result<(), StoreError> {
        let cf_tail = self.cf(CF_LOG_TAIL)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let mut meta = self.metadata_or_new(document_id)?;
        meta.last_log_version = meta.last_log_version.max(entry.version);
        meta.updated_at = now_millis();

        let mut batch = WriteBatch::default();
        batch.put_cf(cf_tail, log_key(document_id, entry.version), encode(entry)?);
        batch.put_cf(cf_meta, doc_key(document_id), encode(&meta)?);
        self.write(batch)
    }

    fn load_log_since(
        &self,
        document_id: &str,
        after: Version,
    ) -> Result<Vec<EventLogEntry>, StoreError> {
        let cf = self.cf(CF_LOG_TAIL)?;
        let prefix = doc_key(document_id);
        let start = log_key(document_id, after.saturating_add(1));

        let mut entries = Vec::new();
        for item in self
            .db
            .iterator_cf(cf, IteratorMode::From(&start, Direction::Forward))
        {
            let (key, value) = item?;
            if key.len() != prefix.len() + 8 || !key.starts_with(&prefix) {
                break;
            }
            entries.push(decode(&value)?);
        }
        Ok(entries)
    }

    fn truncate_log(&self, document_id: &str, up_to: Version) -> Result<u64, StoreError> {
        let cf = self.cf(CF_LOG_TAIL)?;
        let prefix = doc_key(document_id);
        let start = log_key(document_id, 0);
        let end = log_key(document_id, up_to.saturating_add(1));

        let mut count = 0u64;
        let mut batch = WriteBatch::default();
        for item in self
            .db
            .iterator_cf(cf, IteratorMode::From(&start, Direction::Forward))
        {
            let (key, _) = item?;
            if key.len() != prefix.len() + 8
                || !key.starts_with(&prefix)
                || key.as_ref() >= end.as_slice()
            {
                break;
            }
            batch.delete_cf(cf, &key);
            count += 1;
        }

        if count > 0 {
            self.write(batch)?;
        }
        Ok(count)
    }
}

/// `<len:4 BE><doc_id>`; the length prefix keeps "a" from matching "ab".
fn doc_key(document_id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(4 + document_id.len());
    key.extend_from_slice(&(document_id.len() as u32).to_be_bytes());
    key.extend_from_slice(document_id.as_bytes());
    key
}

/// `doc_key(doc_id)` followed by the version, 8 bytes big-endian.
fn log_key(document_id: &str, version: Version) -> Vec<u8> {
    let mut key = doc_key(document_id);
    key.extend_from_slice(&version.to_be_bytes());
    key
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
