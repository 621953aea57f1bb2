//! Durable record types and their on-disk encoding.
//!
//! Records are serialized with bincode (standard config) and then LZ4
//! compressed with the uncompressed size prepended.

use crate::protocol::DocumentId;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use uuid::Uuid;

use super::StoreError;

/// Latest persisted state of one document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub id: DocumentId,
    pub workspace_id: String,
    /// Full-state CRDT encoding (zero-length for a fresh document).
    pub content: Vec<u8>,
    /// Starts at 1, bumped by exactly 1 on every flush.
    pub version: u64,
    pub created_by: String,
    /// Milliseconds since the Unix epoch.
    pub created_at: u64,
    pub updated_at: u64,
}

impl DocumentRecord {
    /// A brand-new document: empty content, version 1.
    pub fn new(id: DocumentId, workspace_id: impl Into<String>, created_by: impl Into<String>) -> Self {
        let now = unix_millis();
        Self {
            id,
            workspace_id: workspace_id.into(),
            content: Vec::new(),
            version: 1,
            created_by: created_by.into(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Why a snapshot was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotTrigger {
    /// Requested explicitly by a user.
    Manual,
    /// Written by the final flush when the last client left.
    Disconnect,
    /// Documents a restore from snapshot `source`.
    Restore { source: Uuid },
}

/// Immutable, append-only copy of a document at one version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub id: Uuid,
    pub document_id: DocumentId,
    pub content: Vec<u8>,
    pub version: u64,
    pub created_by: String,
    pub description: String,
    pub trigger: SnapshotTrigger,
    pub created_at: u64,
}

pub(crate) fn encode_record<T: Serialize>(record: &T) -> Result<Vec<u8>, StoreError> {
    let bytes = bincode::serde::encode_to_vec(record, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    Ok(lz4_flex::compress_prepend_size(&bytes))
}

pub(crate) fn decode_record<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let raw = lz4_flex::decompress_size_prepended(bytes)
        .map_err(|e| StoreError::Compression(e.to_string()))?;
    let (record, _) = bincode::serde::decode_from_slice(&raw, bincode::config::standard())
        .map_err(|e| StoreError::Deserialization(e.to_string()))?;
    Ok(record)
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
