//! In-process record store.
//!
//! Used when no storage path is configured and throughout the tests.
//! Write failures can be injected to exercise the retry paths.

use super::{DocumentRecord, RecordStore, SnapshotRecord, StoreError};
use crate::protocol::DocumentId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

#[derive(Default)]
struct Tables {
    documents: HashMap<DocumentId, DocumentRecord>,
    snapshots: HashMap<Uuid, SnapshotRecord>,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `put_document` fail until reset.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn tables(&self) -> Result<MutexGuard<'_, Tables>, StoreError> {
        self.tables
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store poisoned".into()))
    }
}

impl RecordStore for MemoryStore {
    fn load_document(&self, id: &DocumentId) -> Result<Option<DocumentRecord>, StoreError> {
        Ok(self.tables()?.documents.get(id).cloned())
    }

    fn put_document(
        &self,
        record: &DocumentRecord,
        snapshot: Option<&SnapshotRecord>,
    ) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected write failure".into()));
        }
        let mut tables = self.tables()?;
        tables.documents.insert(record.id.clone(), record.clone());
        if let Some(snapshot) = snapshot {
            tables.snapshots.insert(snapshot.id, snapshot.clone());
        }
        Ok(())
    }

    fn load_snapshot(&self, id: Uuid) -> Result<Option<SnapshotRecord>, StoreError> {
        Ok(self.tables()?.snapshots.get(&id).cloned())
    }

    fn list_snapshots(&self, document_id: &DocumentId) -> Result<Vec<SnapshotRecord>, StoreError> {
        let mut snapshots: Vec<SnapshotRecord> = self
            .tables()?
            .snapshots
            .values()
            .filter(|s| &s.document_id == document_id)
            .cloned()
            .collect();
        snapshots.sort_by_key(|s| (s.version, s.created_at));
        Ok(snapshots)
    }

    fn list_documents(&self) -> Result<Vec<DocumentId>, StoreError> {
        let mut ids: Vec<DocumentId> = self.tables()?.documents.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{unix_millis, SnapshotTrigger};

    fn snapshot(doc: &DocumentId, version: u64) -> SnapshotRecord {
        SnapshotRecord {
            id: Uuid::new_v4(),
            document_id: doc.clone(),
            content: vec![version as u8],
            version,
            created_by: "alice".into(),
            description: String::new(),
            trigger: SnapshotTrigger::Manual,
            created_at: unix_millis(),
        }
    }

    #[test]
    fn test_put_and_load() {
        let store = MemoryStore::new();
        let id = DocumentId::parse("doc-1").unwrap();
        assert!(store.load_document(&id).unwrap().is_none());

        let record = DocumentRecord::new(id.clone(), "ws", "alice");
        let snap = snapshot(&id, 1);
        store.put_document(&record, Some(&snap)).unwrap();

        assert_eq!(store.load_document(&id).unwrap(), Some(record));
        assert_eq!(store.load_snapshot(snap.id).unwrap(), Some(snap));
        assert_eq!(store.list_documents().unwrap(), vec![id]);
    }

    #[test]
    fn test_snapshots_listed_by_version() {
        let store = MemoryStore::new();
        let id = DocumentId::parse("doc-1").unwrap();
        let other = DocumentId::parse("doc-2").unwrap();
        let record = DocumentRecord::new(id.clone(), "ws", "alice");

        for v in [3, 1, 2] {
            store.put_document(&record, Some(&snapshot(&id, v))).unwrap();
        }
        store.put_document(&record, Some(&snapshot(&other, 9))).unwrap();

        let versions: Vec<u64> = store
            .list_snapshots(&id)
            .unwrap()
            .iter()
            .map(|s| s.version)
            .collect();
        assert_eq!(versions, vec![1, 2, 3]);
    }

    #[test]
    fn test_injected_failure_writes_nothing() {
        let store = MemoryStore::new();
        let id = DocumentId::parse("doc-1").unwrap();
        store.set_fail_writes(true);

        let record = DocumentRecord::new(id.clone(), "ws", "alice");
        assert!(store.put_document(&record, None).is_err());
        assert!(store.load_document(&id).unwrap().is_none());

        store.set_fail_writes(false);
        assert!(store.put_document(&record, None).is_ok());
    }
}
