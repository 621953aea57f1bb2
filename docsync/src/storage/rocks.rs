//! RocksDB-backed record store.
//!
//! Column families:
//! - `documents`      — latest `DocumentRecord` per document (key: document id)
//! - `snapshots`      — `SnapshotRecord`s (key: snapshot uuid)
//! - `snapshot_index` — ordered per-document index
//!                      (key: document id, 0x00, version BE, snapshot uuid)
//!
//! Values are bincode-encoded and LZ4-compressed (see `records`).
//! A flush writes the document record and its snapshot in one `WriteBatch`.

use super::records::{decode_record, encode_record};
use super::{DocumentRecord, RecordStore, SnapshotRecord, StoreError};
use crate::protocol::DocumentId;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use std::path::{Path, PathBuf};
use uuid::Uuid;

const CF_DOCUMENTS: &str = "documents";
const CF_SNAPSHOTS: &str = "snapshots";
const CF_SNAPSHOT_INDEX: &str = "snapshot_index";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_SNAPSHOTS, CF_SNAPSHOT_INDEX];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 256MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync every write batch (default: true, flushes are already debounced)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 64MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("docsync_data"),
            block_cache_size: 256 * 1024 * 1024, // 256MB
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 512,
            write_buffer_size: 64 * 1024 * 1024, // 64MB
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches, caller-provided directory).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024, // 8MB
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024, // 4MB
        }
    }
}

/// RocksDB-backed document store.
pub struct DocumentStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl DocumentStore {
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

        log::info!("opened document store at {}", config.path.display());
        Ok(Self { db, config })
    }

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
            CF_DOCUMENTS => {
                // Values are already LZ4 compressed by the record codec.
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_SNAPSHOTS => {
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(2);
            }
            CF_SNAPSHOT_INDEX => {
                // Empty values, prefix-scanned by document id.
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.set_max_write_buffer_number(2);
            }
            _ => {}
        }

        opts
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
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

    fn index_prefix(document_id: &DocumentId) -> Vec<u8> {
        let mut prefix = Vec::with_capacity(document_id.as_bytes().len() + 1);
        prefix.extend_from_slice(document_id.as_bytes());
        prefix.push(0);
        prefix
    }

    /// Index key: document id, separator, version (8 bytes BE), snapshot uuid.
    fn index_key(snapshot: &SnapshotRecord) -> Vec<u8> {
        let mut key = Self::index_prefix(&snapshot.document_id);
        key.extend_from_slice(&snapshot.version.to_be_bytes());
        key.extend_from_slice(snapshot.id.as_bytes());
        key
    }
}

impl RecordStore for DocumentStore {
    fn load_document(&self, id: &DocumentId) -> Result<Option<DocumentRecord>, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        match self.db.get_cf(cf, id.as_bytes())? {
            Some(bytes) => Ok(Some(decode_record(&bytes)?)),
            None => Ok(None),
        }
    }

    fn put_document(
        &self,
        record: &DocumentRecord,
        snapshot: Option<&SnapshotRecord>,
    ) -> Result<(), StoreError> {
        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_DOCUMENTS)?, record.id.as_bytes(), encode_record(record)?);

        if let Some(snapshot) = snapshot {
            batch.put_cf(
                self.cf(CF_SNAPSHOTS)?,
                snapshot.id.as_bytes(),
                encode_record(snapshot)?,
            );
            batch.put_cf(self.cf(CF_SNAPSHOT_INDEX)?, Self::index_key(snapshot), b"");
        }

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    fn load_snapshot(&self, id: Uuid) -> Result<Option<SnapshotRecord>, StoreError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        match self.db.get_cf(cf, id.as_bytes())? {
            Some(bytes) => Ok(Some(decode_record(&bytes)?)),
            None => Ok(None),
        }
    }

    fn list_snapshots(&self, document_id: &DocumentId) -> Result<Vec<SnapshotRecord>, StoreError> {
        let cf = self.cf(CF_SNAPSHOT_INDEX)?;
        let prefix = Self::index_prefix(document_id);
        let mut snapshots = Vec::new();

        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(prefix.as_slice(), Direction::Forward));
        for item in iter {
            let (key, _) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            let raw_id = key
                .len()
                .checked_sub(16)
                .map(|start| &key[start..])
                .ok_or_else(|| StoreError::Deserialization("short snapshot index key".into()))?;
            let id = Uuid::from_slice(raw_id)
                .map_err(|e| StoreError::Deserialization(e.to_string()))?;
            match self.load_snapshot(id)? {
                Some(snapshot) => snapshots.push(snapshot),
                None => log::warn!("snapshot index points at missing snapshot {id}"),
            }
        }

        Ok(snapshots)
    }

    fn list_documents(&self) -> Result<Vec<DocumentId>, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        let mut ids = Vec::new();

        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            let token = std::str::from_utf8(&key)
                .map_err(|e| StoreError::Deserialization(e.to_string()))?;
            let id = DocumentId::parse(token)
                .map_err(|e| StoreError::Deserialization(e.to_string()))?;
            ids.push(id);
        }

        Ok(ids)
    }
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
