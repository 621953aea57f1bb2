//! Session registry: the arena of live document sessions.
//!
//! At most one session per document id exists at any instant. Creation
//! is serialized through the registry's write lock; after that each
//! session is independent, so different documents never contend beyond
//! a map lookup.

use crate::merge::{CrdtDocument, YrsDocument};
use crate::persistence::{FlushOutcome, PersistenceError, PersistenceManager, SnapshotSpec};
use crate::protocol::DocumentId;
use crate::relay::ClientId;
use crate::session::{
    Attachment, DocumentSession, SessionConfig, SessionError, SessionState, SessionSummary,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

pub struct SessionRegistry<D: CrdtDocument = YrsDocument> {
    sessions: RwLock<HashMap<DocumentId, Arc<DocumentSession<D>>>>,
    persistence: Arc<PersistenceManager>,
    config: SessionConfig,
}

impl SessionRegistry {
    /// Registry backed by the Yrs merge engine.
    pub fn new(persistence: Arc<PersistenceManager>, config: SessionConfig) -> Self {
        Self::with_engine(persistence, config)
    }
}

impl<D: CrdtDocument> SessionRegistry<D> {
    /// Registry backed by any [`CrdtDocument`] implementation.
    pub fn with_engine(persistence: Arc<PersistenceManager>, config: SessionConfig) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            persistence,
            config,
        }
    }

    pub fn persistence(&self) -> &Arc<PersistenceManager> {
        &self.persistence
    }

    /// Return the active session for `id`, hydrating a new one if needed.
    ///
    /// Concurrent callers for the same id share one session. A session
    /// that is draining is waited out, and a fresh one is created after it.
    pub async fn get_or_create(
        &self,
        id: &DocumentId,
    ) -> Result<Arc<DocumentSession<D>>, SessionError> {
        loop {
            let existing = self.sessions.read().await.get(id).cloned();
            if let Some(session) = existing {
                match session.wait_settled().await {
                    SessionState::Active => return Ok(session),
                    SessionState::Draining => {
                        session.wait_destroyed().await;
                        self.evict(&session).await;
                    }
                    SessionState::Destroyed | SessionState::Loading => {
                        self.evict(&session).await;
                    }
                }
                continue;
            }

            let session = {
                let mut sessions = self.sessions.write().await;
                match sessions.get(id) {
                    Some(current) if current.state() != SessionState::Destroyed => continue,
                    _ => {
                        let session = Arc::new(DocumentSession::new(
                            id.clone(),
                            Arc::clone(&self.persistence),
                            self.config.clone(),
                        ));
                        sessions.insert(id.clone(), Arc::clone(&session));
                        session
                    }
                }
            };

            log::info!("session {id} created");
            match session.hydrate().await {
                Ok(()) => return Ok(session),
                Err(e) => {
                    log::error!("failed to hydrate {id}: {e}");
                    session.abandon().await;
                    self.evict(&session).await;
                    return Err(e);
                }
            }
        }
    }

    /// Attach `client` to the document, creating the session if needed.
    pub async fn join(
        &self,
        id: &DocumentId,
        client: ClientId,
    ) -> Result<(Arc<DocumentSession<D>>, Attachment), SessionError> {
        loop {
            let session = self.get_or_create(id).await?;
            match session.add_client(client).await {
                Ok(attachment) => return Ok((session, attachment)),
                // Lost a race with teardown; the next round gets a new session.
                Err(SessionError::Closed) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Detach `client`; the last one out drains and removes the session.
    pub async fn leave(&self, session: &Arc<DocumentSession<D>>, client: ClientId) {
        if session.remove_client(client).await {
            session.drain().await;
            self.evict(session).await;
        }
    }

    async fn evict(&self, session: &Arc<DocumentSession<D>>) {
        let mut sessions = self.sessions.write().await;
        if let Some(current) = sessions.get(session.id()) {
            if Arc::ptr_eq(current, session) {
                sessions.remove(session.id());
            }
        }
    }

    /// The session for `id` if it holds authoritative live state.
    async fn live_session(&self, id: &DocumentId) -> Option<Arc<DocumentSession<D>>> {
        let session = self.sessions.read().await.get(id).cloned()?;
        match session.state() {
            SessionState::Active | SessionState::Draining => Some(session),
            SessionState::Loading | SessionState::Destroyed => None,
        }
    }

    pub async fn get(&self, id: &DocumentId) -> Option<Arc<DocumentSession<D>>> {
        self.sessions.read().await.get(id).cloned()
    }

    /// Flush now, bump the version and record a manual snapshot.
    ///
    /// Uses the live state if the document is open, the stored content
    /// otherwise. Errors are returned to the caller.
    pub async fn create_snapshot(
        &self,
        id: &DocumentId,
        requester: &str,
        description: &str,
    ) -> Result<FlushOutcome, SessionError> {
        let lock = self.persistence.lock_document(id).await;
        let spec = SnapshotSpec::manual(requester, description);

        let outcome = match self.live_session(id).await {
            Some(session) => session.checkpoint(&lock, Some(spec)).await?,
            None => {
                let record = self
                    .persistence
                    .load_document(id)
                    .await?
                    .ok_or_else(|| PersistenceError::DocumentNotFound(id.clone()))?;
                self.persistence
                    .commit_flush(&lock, record.content, Some(spec))
                    .await?
            }
        };

        log::info!(
            "manual snapshot of {id} by {requester} at version {}",
            outcome.version
        );
        Ok(outcome)
    }

    /// Roll a document back to the content of snapshot `snapshot_id`.
    ///
    /// The restored content is written as a new version; no history is
    /// removed. A live session has its state replaced and its clients
    /// reset so they resync from the restored state.
    pub async fn restore_snapshot(
        &self,
        snapshot_id: Uuid,
        requester: &str,
    ) -> Result<FlushOutcome, SessionError> {
        let snapshot = self.persistence.load_snapshot(snapshot_id).await?;
        let id = snapshot.document_id.clone();
        let lock = self.persistence.lock_document(&id).await;
        let spec = SnapshotSpec::restore(requester, &snapshot);

        // Nothing live changes until the restored version is durable.
        let restored = D::load_state(&snapshot.content)?;
        let outcome = self
            .persistence
            .commit_flush(&lock, snapshot.content.clone(), Some(spec))
            .await?;
        if let Some(session) = self.live_session(&id).await {
            session.install_restored(restored, &outcome).await;
        }

        log::info!(
            "restored {id} from snapshot {snapshot_id} (version {}) as version {}",
            snapshot.version,
            outcome.version
        );
        Ok(outcome)
    }

    /// Flush every active session that has unsaved changes.
    pub async fn flush_all(&self) -> usize {
        let sessions: Vec<_> = self.sessions.read().await.values().cloned().collect();
        let mut flushed = 0;
        for session in sessions {
            if session.state() != SessionState::Active {
                continue;
            }
            match session.flush().await {
                Ok(Some(_)) => flushed += 1,
                Ok(None) => {}
                Err(e) => log::error!("flush of {} failed: {e}", session.id()),
            }
        }
        flushed
    }

    /// Monitoring view of every session currently in memory.
    pub async fn active_sessions(&self) -> Vec<SessionSummary> {
        let sessions: Vec<_> = self.sessions.read().await.values().cloned().collect();
        let mut summaries = Vec::with_capacity(sessions.len());
        for session in sessions {
            summaries.push(session.summary().await);
        }
        summaries.sort_by(|a, b| a.document_id.cmp(&b.document_id));
        summaries
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::DEFAULT_TEXT;
    use crate::storage::{MemoryStore, SnapshotTrigger};
    use std::time::Duration;

    fn config() -> SessionConfig {
        SessionConfig {
            autosave_debounce: Duration::from_secs(60),
            broadcast_capacity: 16,
            final_flush_attempts: 2,
            final_flush_backoff: Duration::from_millis(10),
        }
    }

    async fn registry_with(ids: &[&str]) -> Arc<SessionRegistry> {
        registry_over(Arc::new(MemoryStore::new()), ids).await
    }

    async fn registry_over(store: Arc<MemoryStore>, ids: &[&str]) -> Arc<SessionRegistry> {
        let pm = Arc::new(PersistenceManager::new(store));
        for id in ids {
            pm.create_document(&DocumentId::parse(id).unwrap(), "ws", "alice")
                .await
                .unwrap();
        }
        Arc::new(SessionRegistry::new(pm, config()))
    }

    fn doc(id: &str) -> DocumentId {
        DocumentId::parse(id).unwrap()
    }

    fn edit(text: &str) -> Vec<u8> {
        YrsDocument::new().append_text(DEFAULT_TEXT, text)
    }

    fn text_of(state: &[u8]) -> String {
        YrsDocument::load_state(state).unwrap().text(DEFAULT_TEXT)
    }

    #[tokio::test]
    async fn test_concurrent_get_or_create_yields_one_session() {
        let registry = registry_with(&["doc-1"]).await;
        let id = doc("doc-1");

        let mut handles = Vec::new();
        for _ in 0..32 {
            let registry = registry.clone();
            let id = id.clone();
            handles.push(tokio::spawn(async move {
                registry.get_or_create(&id).await.unwrap()
            }));
        }

        let first = registry.get_or_create(&id).await.unwrap();
        for handle in handles {
            assert!(Arc::ptr_eq(&first, &handle.await.unwrap()));
        }
        assert_eq!(registry.session_count().await, 1);
    }

    #[tokio::test]
    async fn test_last_leave_tears_down() {
        let registry = registry_with(&["doc-1"]).await;
        let id = doc("doc-1");
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        let (session, _) = registry.join(&id, a).await.unwrap();
        registry.join(&id, b).await.unwrap();
        session.apply_remote_delta(a, edit("bye")).await.unwrap();

        registry.leave(&session, a).await;
        assert_eq!(session.state(), SessionState::Active);
        assert_eq!(registry.session_count().await, 1);

        registry.leave(&session, b).await;
        assert_eq!(session.state(), SessionState::Destroyed);
        assert_eq!(registry.session_count().await, 0);

        let record = registry.persistence().load_document(&id).await.unwrap().unwrap();
        assert_eq!(record.version, 2);
        assert_eq!(text_of(&record.content), "bye");
    }

    #[tokio::test]
    async fn test_rejoin_after_teardown_gets_fresh_session() {
        let registry = registry_with(&["doc-1"]).await;
        let id = doc("doc-1");
        let a = Uuid::new_v4();

        let (first, _) = registry.join(&id, a).await.unwrap();
        first.apply_remote_delta(a, edit("persisted")).await.unwrap();
        registry.leave(&first, a).await;

        let (second, attachment) = registry.join(&id, Uuid::new_v4()).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(text_of(&attachment.initial_state), "persisted");
    }

    #[tokio::test]
    async fn test_manual_snapshot_live_and_stored() {
        let registry = registry_with(&["doc-1", "doc-2"]).await;
        let live = doc("doc-1");
        let a = Uuid::new_v4();
        let (session, _) = registry.join(&live, a).await.unwrap();
        session.apply_remote_delta(a, edit("draft")).await.unwrap();

        let outcome = registry.create_snapshot(&live, "alice", "first draft").await.unwrap();
        assert_eq!(outcome.version, 2);
        let snapshot = registry
            .persistence()
            .load_snapshot(outcome.snapshot_id.unwrap())
            .await
            .unwrap();
        assert_eq!(text_of(&snapshot.content), "draft");
        assert_eq!(snapshot.description, "first draft");

        // Nothing changed since the snapshot, so no autosave is owed.
        assert!(session.flush().await.unwrap().is_none());

        let stored = registry.create_snapshot(&doc("doc-2"), "bob", "empty").await.unwrap();
        assert_eq!(stored.version, 2);

        let missing = registry.create_snapshot(&doc("nope"), "bob", "x").await;
        assert!(matches!(
            missing,
            Err(SessionError::Persistence(PersistenceError::DocumentNotFound(_)))
        ));
    }

    #[tokio::test]
    async fn test_restore_stored_document() {
        let registry = registry_with(&["doc-1"]).await;
        let id = doc("doc-1");
        let a = Uuid::new_v4();

        let (session, _) = registry.join(&id, a).await.unwrap();
        session.apply_remote_delta(a, edit("v1 text")).await.unwrap();
        let snap = registry.create_snapshot(&id, "alice", "good").await.unwrap();
        session.apply_remote_delta(a, edit(" oops")).await.unwrap();
        registry.leave(&session, a).await;

        let restored = registry
            .restore_snapshot(snap.snapshot_id.unwrap(), "alice")
            .await
            .unwrap();
        // v2 manual snapshot, v3 final flush, v4 restore.
        assert_eq!(restored.version, 4);

        let record = registry.persistence().load_document(&id).await.unwrap().unwrap();
        assert_eq!(record.version, 4);
        assert_eq!(text_of(&record.content), "v1 text");

        let history = registry.persistence().list_snapshots(&id).await.unwrap();
        let triggers: Vec<_> = history.iter().map(|s| s.trigger).collect();
        assert_eq!(
            triggers,
            vec![
                SnapshotTrigger::Manual,
                SnapshotTrigger::Disconnect,
                SnapshotTrigger::Restore { source: snap.snapshot_id.unwrap() },
            ]
        );
    }

    #[tokio::test]
    async fn test_restore_live_session_resets_clients() {
        let registry = registry_with(&["doc-1"]).await;
        let id = doc("doc-1");
        let a = Uuid::new_v4();

        let (session, attachment) = registry.join(&id, a).await.unwrap();
        let mut subscription = attachment.subscription;
        session.apply_remote_delta(a, edit("keep")).await.unwrap();
        let snap = registry.create_snapshot(&id, "alice", "keep").await.unwrap();
        session.apply_remote_delta(a, edit(" discard")).await.unwrap();

        let restored = registry
            .restore_snapshot(snap.snapshot_id.unwrap(), "alice")
            .await
            .unwrap();
        assert_eq!(restored.version, 3);
        assert_eq!(text_of(&session.encode_state().await), "keep");
        assert!(matches!(
            subscription.recv().await,
            crate::relay::RelayEvent::Reset
        ));
    }

    #[tokio::test]
    async fn test_failed_restore_leaves_live_session_untouched() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry_over(store.clone(), &["doc-1"]).await;
        let id = doc("doc-1");
        let a = Uuid::new_v4();

        let (session, attachment) = registry.join(&id, a).await.unwrap();
        let mut subscription = attachment.subscription;
        session.apply_remote_delta(a, edit("keep")).await.unwrap();
        let snap = registry.create_snapshot(&id, "alice", "keep").await.unwrap();
        session.apply_remote_delta(a, edit(" later")).await.unwrap();
        let before = session.encode_state().await;

        store.set_fail_writes(true);
        let result = registry.restore_snapshot(snap.snapshot_id.unwrap(), "alice").await;
        assert!(matches!(result, Err(SessionError::Persistence(_))));

        assert_eq!(session.encode_state().await, before);
        assert_eq!(session.summary().await.version, Some(2));
        let no_reset = tokio::time::timeout(Duration::from_millis(50), subscription.recv()).await;
        assert!(no_reset.is_err(), "clients must not be reset by a failed restore");

        store.set_fail_writes(false);
        let restored = registry
            .restore_snapshot(snap.snapshot_id.unwrap(), "alice")
            .await
            .unwrap();
        assert_eq!(restored.version, 3);
        assert_eq!(text_of(&session.encode_state().await), "keep");
    }

    #[tokio::test]
    async fn test_unstored_document_persists_across_rejoin() {
        let registry = registry_with(&[]).await;
        let id = doc("never-created");
        let a = Uuid::new_v4();

        let (session, attachment) = registry.join(&id, a).await.unwrap();
        assert!(attachment.initial_state.is_empty());
        session.apply_remote_delta(a, edit("important")).await.unwrap();
        registry.leave(&session, a).await;

        let record = registry.persistence().load_document(&id).await.unwrap().unwrap();
        assert_eq!(record.version, 2);

        let (_, attachment) = registry.join(&id, a).await.unwrap();
        assert_eq!(text_of(&attachment.initial_state), "important");
    }

    #[tokio::test]
    async fn test_restore_unknown_snapshot_fails() {
        let registry = registry_with(&[]).await;
        let result = registry.restore_snapshot(Uuid::new_v4(), "alice").await;
        assert!(matches!(
            result,
            Err(SessionError::Persistence(PersistenceError::SnapshotNotFound(_)))
        ));
    }

    #[tokio::test]
    async fn test_monitoring_and_flush_all() {
        let registry = registry_with(&["doc-1", "doc-2"]).await;
        let a = Uuid::new_v4();
        let (s1, _) = registry.join(&doc("doc-1"), a).await.unwrap();
        registry.join(&doc("doc-2"), Uuid::new_v4()).await.unwrap();
        registry.join(&doc("doc-2"), Uuid::new_v4()).await.unwrap();
        s1.apply_remote_delta(a, edit("unsaved")).await.unwrap();

        let summaries = registry.active_sessions().await;
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].document_id, doc("doc-1"));
        assert_eq!(summaries[0].clients, 1);
        assert_eq!(summaries[1].clients, 2);
        assert!(summaries.iter().all(|s| s.state == SessionState::Active));

        assert_eq!(registry.flush_all().await, 1);
        assert_eq!(registry.flush_all().await, 0);
        let summaries = registry.active_sessions().await;
        assert_eq!(summaries[0].version, Some(2));
        assert!(summaries[0].last_saved_at.is_some());
    }
}
