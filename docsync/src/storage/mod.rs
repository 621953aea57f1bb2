//! Durable record store behind the persistence manager.
//!
//! ```text
//! ┌────────────────────┐   records   ┌───────────────────────────────────┐
//! │ PersistenceManager │ ──────────► │ RecordStore                       │
//! │ (versions, locks)  │             │  DocumentStore (RocksDB)          │
//! └────────────────────┘             │  MemoryStore   (in-process)       │
//!                                    └───────────────────────────────────┘
//! ```
//!
//! A store only keeps the latest [`DocumentRecord`] per document and an
//! append-only list of [`SnapshotRecord`]s. Version bookkeeping and flush
//! serialization live one layer up.
//!
//! Store calls are blocking and are driven from `spawn_blocking`.

pub mod memory;
pub mod records;
pub mod rocks;

pub use memory::MemoryStore;
pub use records::{unix_millis, DocumentRecord, SnapshotRecord, SnapshotTrigger};
pub use rocks::{DocumentStore, StoreConfig};

use crate::protocol::DocumentId;
use uuid::Uuid;

/// Storage errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("compression error: {0}")]
    Compression(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Durable key/record store for documents and snapshots.
pub trait RecordStore: Send + Sync + 'static {
    fn load_document(&self, id: &DocumentId) -> Result<Option<DocumentRecord>, StoreError>;

    /// Write `record`, and `snapshot` if given, as one atomic unit.
    fn put_document(
        &self,
        record: &DocumentRecord,
        snapshot: Option<&SnapshotRecord>,
    ) -> Result<(), StoreError>;

    fn load_snapshot(&self, id: Uuid) -> Result<Option<SnapshotRecord>, StoreError>;

    /// All snapshots of `document_id`, oldest version first.
    fn list_snapshots(&self, document_id: &DocumentId) -> Result<Vec<SnapshotRecord>, StoreError>;

    fn list_documents(&self) -> Result<Vec<DocumentId>, StoreError>;
}
