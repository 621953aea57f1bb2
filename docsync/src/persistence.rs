//! Persistence manager: versioned flushes and snapshot history.
//!
//! Every write for a document goes through [`PersistenceManager::commit_flush`]
//! while holding that document's [`DocumentLock`], so at most one flush per
//! document is in flight and each bumps the stored version by exactly one.
//! Locks are per document; unrelated documents never wait on each other.
//!
//! Debouncing lives with the session (see `session`); this layer only
//! knows how to write.

use crate::merge::MergeError;
use crate::protocol::DocumentId;
use crate::storage::{
    unix_millis, DocumentRecord, RecordStore, SnapshotRecord, SnapshotTrigger, StoreError,
};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

/// Identity recorded on snapshots written by the server itself.
pub const SYSTEM_ACTOR: &str = "system";

/// Workspace assigned to documents created on first open.
pub const DEFAULT_WORKSPACE: &str = "default";

/// Persistence errors.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("document not found: {0}")]
    DocumentNotFound(DocumentId),
    #[error("document already exists: {0}")]
    DocumentExists(DocumentId),
    #[error("snapshot not found: {0}")]
    SnapshotNotFound(Uuid),
    #[error("stored state is unreadable: {0}")]
    Merge(#[from] MergeError),
    #[error("storage task failed: {0}")]
    Task(String),
}

/// Snapshot to write alongside a flush.
#[derive(Debug, Clone)]
pub struct SnapshotSpec {
    pub created_by: String,
    pub description: String,
    pub trigger: SnapshotTrigger,
}

impl SnapshotSpec {
    pub fn manual(requester: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            created_by: requester.into(),
            description: description.into(),
            trigger: SnapshotTrigger::Manual,
        }
    }

    pub fn disconnect() -> Self {
        Self {
            created_by: SYSTEM_ACTOR.into(),
            description: "final flush after last client left".into(),
            trigger: SnapshotTrigger::Disconnect,
        }
    }

    pub fn restore(requester: impl Into<String>, source: &SnapshotRecord) -> Self {
        Self {
            created_by: requester.into(),
            description: format!("restored from snapshot {} (version {})", source.id, source.version),
            trigger: SnapshotTrigger::Restore { source: source.id },
        }
    }
}

/// Result of a successful flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushOutcome {
    pub version: u64,
    pub saved_at: u64,
    pub snapshot_id: Option<Uuid>,
}

/// Exclusive right to write one document.
pub struct DocumentLock {
    document_id: DocumentId,
    _guard: OwnedMutexGuard<()>,
}

impl DocumentLock {
    pub fn document_id(&self) -> &DocumentId {
        &self.document_id
    }
}

pub struct PersistenceManager {
    store: Arc<dyn RecordStore>,
    locks: Mutex<HashMap<DocumentId, Weak<Mutex<()>>>>,
}

impl PersistenceManager {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self {
            store,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    /// Wait for exclusive write access to `id`.
    pub async fn lock_document(&self, id: &DocumentId) -> DocumentLock {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks.retain(|_, weak| weak.strong_count() > 0);
            match locks.get(id).and_then(Weak::upgrade) {
                Some(lock) => lock,
                None => {
                    let lock = Arc::new(Mutex::new(()));
                    locks.insert(id.clone(), Arc::downgrade(&lock));
                    lock
                }
            }
        };

        DocumentLock {
            document_id: id.clone(),
            _guard: lock.lock_owned().await,
        }
    }

    /// Create an empty document at version 1.
    pub async fn create_document(
        &self,
        id: &DocumentId,
        workspace_id: &str,
        created_by: &str,
    ) -> Result<DocumentRecord, PersistenceError> {
        let _lock = self.lock_document(id).await;
        let record = DocumentRecord::new(id.clone(), workspace_id, created_by);
        let created = self
            .blocking(move |store| {
                if store.load_document(&record.id)?.is_some() {
                    return Err(PersistenceError::DocumentExists(record.id));
                }
                store.put_document(&record, None)?;
                Ok(record)
            })
            .await?;
        log::info!("created document {} in workspace {}", created.id, created.workspace_id);
        Ok(created)
    }

    /// Load the locked document, creating an empty record at version 1 if
    /// it has never been stored.
    pub async fn open_document(
        &self,
        lock: &DocumentLock,
    ) -> Result<DocumentRecord, PersistenceError> {
        let id = lock.document_id().clone();
        let (record, created) = self
            .blocking(move |store| {
                if let Some(record) = store.load_document(&id)? {
                    return Ok((record, false));
                }
                let record = DocumentRecord::new(id, DEFAULT_WORKSPACE, SYSTEM_ACTOR);
                store.put_document(&record, None)?;
                Ok((record, true))
            })
            .await?;
        if created {
            log::info!("created document {} on first open", record.id);
        }
        Ok(record)
    }

    pub async fn load_document(
        &self,
        id: &DocumentId,
    ) -> Result<Option<DocumentRecord>, PersistenceError> {
        let id = id.clone();
        self.blocking(move |store| Ok(store.load_document(&id)?)).await
    }

    /// Persist `content` as the next version of the locked document,
    /// optionally writing a snapshot in the same atomic batch.
    pub async fn commit_flush(
        &self,
        lock: &DocumentLock,
        content: Vec<u8>,
        snapshot: Option<SnapshotSpec>,
    ) -> Result<FlushOutcome, PersistenceError> {
        let id = lock.document_id().clone();
        self.blocking(move |store| {
            let mut record = store
                .load_document(&id)?
                .ok_or_else(|| PersistenceError::DocumentNotFound(id.clone()))?;

            let now = unix_millis();
            record.version += 1;
            record.updated_at = now;
            record.content = content;

            let snapshot = snapshot.map(|spec| SnapshotRecord {
                id: Uuid::new_v4(),
                document_id: id.clone(),
                content: record.content.clone(),
                version: record.version,
                created_by: spec.created_by,
                description: spec.description,
                trigger: spec.trigger,
                created_at: now,
            });

            store.put_document(&record, snapshot.as_ref())?;
            log::trace!("flushed {} at version {}", id, record.version);

            Ok(FlushOutcome {
                version: record.version,
                saved_at: now,
                snapshot_id: snapshot.map(|s| s.id),
            })
        })
        .await
    }

    pub async fn load_snapshot(&self, id: Uuid) -> Result<SnapshotRecord, PersistenceError> {
        self.blocking(move |store| {
            store
                .load_snapshot(id)?
                .ok_or(PersistenceError::SnapshotNotFound(id))
        })
        .await
    }

    pub async fn list_snapshots(
        &self,
        document_id: &DocumentId,
    ) -> Result<Vec<SnapshotRecord>, PersistenceError> {
        let id = document_id.clone();
        self.blocking(move |store| Ok(store.list_snapshots(&id)?)).await
    }

    pub async fn list_documents(&self) -> Result<Vec<DocumentId>, PersistenceError> {
        self.blocking(|store| Ok(store.list_documents()?)).await
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, PersistenceError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn RecordStore) -> Result<T, PersistenceError> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || f(store.as_ref()))
            .await
            .map_err(|e| PersistenceError::Task(e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use std::time::Duration;

    fn manager() -> (Arc<MemoryStore>, PersistenceManager) {
        let store = Arc::new(MemoryStore::new());
        let manager = PersistenceManager::new(store.clone());
        (store, manager)
    }

    fn doc(id: &str) -> DocumentId {
        DocumentId::parse(id).unwrap()
    }

    #[tokio::test]
    async fn test_create_document_starts_at_version_one() {
        let (_, pm) = manager();
        let id = doc("doc-1");

        let record = pm.create_document(&id, "ws", "alice").await.unwrap();
        assert_eq!(record.version, 1);
        assert!(record.content.is_empty());

        let again = pm.create_document(&id, "ws", "alice").await;
        assert!(matches!(again, Err(PersistenceError::DocumentExists(_))));
    }

    #[tokio::test]
    async fn test_flush_bumps_version_by_one() {
        let (_, pm) = manager();
        let id = doc("doc-1");
        pm.create_document(&id, "ws", "alice").await.unwrap();

        for expected in 2..=4 {
            let lock = pm.lock_document(&id).await;
            let outcome = pm.commit_flush(&lock, vec![expected as u8], None).await.unwrap();
            assert_eq!(outcome.version, expected);
            assert!(outcome.snapshot_id.is_none());
        }

        let record = pm.load_document(&id).await.unwrap().unwrap();
        assert_eq!(record.version, 4);
        assert_eq!(record.content, vec![4]);
    }

    #[tokio::test]
    async fn test_open_document_creates_missing_record() {
        let (store, pm) = manager();
        let id = doc("first-open");

        let lock = pm.lock_document(&id).await;
        let created = pm.open_document(&lock).await.unwrap();
        assert_eq!(created.version, 1);
        assert_eq!(created.workspace_id, DEFAULT_WORKSPACE);
        assert_eq!(created.created_by, SYSTEM_ACTOR);

        let outcome = pm.commit_flush(&lock, vec![9], None).await.unwrap();
        assert_eq!(outcome.version, 2);
        let reopened = pm.open_document(&lock).await.unwrap();
        assert_eq!(reopened.version, 2);
        assert_eq!(reopened.content, vec![9]);
        drop(lock);

        store.set_fail_writes(true);
        let lock = pm.lock_document(&doc("unwritable")).await;
        assert!(matches!(
            pm.open_document(&lock).await,
            Err(PersistenceError::Store(_))
        ));
    }

    #[tokio::test]
    async fn test_flush_missing_document_fails() {
        let (_, pm) = manager();
        let id = doc("ghost");
        let lock = pm.lock_document(&id).await;
        let result = pm.commit_flush(&lock, vec![1], None).await;
        assert!(matches!(result, Err(PersistenceError::DocumentNotFound(_))));
    }

    #[tokio::test]
    async fn test_snapshot_written_atomically_with_flush() {
        let (_, pm) = manager();
        let id = doc("doc-1");
        pm.create_document(&id, "ws", "alice").await.unwrap();

        let lock = pm.lock_document(&id).await;
        let outcome = pm
            .commit_flush(&lock, b"state".to_vec(), Some(SnapshotSpec::manual("bob", "milestone")))
            .await
            .unwrap();
        drop(lock);

        let snapshot_id = outcome.snapshot_id.unwrap();
        let snapshot = pm.load_snapshot(snapshot_id).await.unwrap();
        assert_eq!(snapshot.version, outcome.version);
        assert_eq!(snapshot.content, b"state".to_vec());
        assert_eq!(snapshot.created_by, "bob");
        assert_eq!(snapshot.trigger, SnapshotTrigger::Manual);

        assert_eq!(pm.list_snapshots(&id).await.unwrap().len(), 1);
        assert!(matches!(
            pm.load_snapshot(Uuid::new_v4()).await,
            Err(PersistenceError::SnapshotNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_write_does_not_consume_version() {
        let (store, pm) = manager();
        let id = doc("doc-1");
        pm.create_document(&id, "ws", "alice").await.unwrap();

        store.set_fail_writes(true);
        let lock = pm.lock_document(&id).await;
        assert!(pm.commit_flush(&lock, vec![1], None).await.is_err());

        store.set_fail_writes(false);
        let outcome = pm.commit_flush(&lock, vec![2], None).await.unwrap();
        assert_eq!(outcome.version, 2);
    }

    #[tokio::test]
    async fn test_concurrent_flushes_get_unique_versions() {
        let (_, pm) = manager();
        let pm = Arc::new(pm);
        let id = doc("doc-1");
        pm.create_document(&id, "ws", "alice").await.unwrap();

        let mut handles = Vec::new();
        for i in 0..16u8 {
            let pm = pm.clone();
            let id = id.clone();
            handles.push(tokio::spawn(async move {
                let lock = pm.lock_document(&id).await;
                let spec = SnapshotSpec::manual("alice", format!("snap {i}"));
                pm.commit_flush(&lock, vec![i], Some(spec)).await.unwrap().version
            }));
        }

        let mut versions = Vec::new();
        for handle in handles {
            versions.push(handle.await.unwrap());
        }
        versions.sort_unstable();
        assert_eq!(versions, (2..=17).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn test_locks_are_per_document() {
        let (_, pm) = manager();
        let _held = pm.lock_document(&doc("a")).await;
        let other = tokio::time::timeout(Duration::from_millis(200), pm.lock_document(&doc("b"))).await;
        assert!(other.is_ok(), "unrelated documents must not contend");

        let same = tokio::time::timeout(Duration::from_millis(50), pm.lock_document(&doc("a"))).await;
        assert!(same.is_err(), "same document must be exclusive");
    }
}
