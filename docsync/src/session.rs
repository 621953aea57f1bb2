//! One actively edited document and its connected clients.
//!
//! ```text
//! LOADING ──hydrate──► ACTIVE ──last client leaves──► DRAINING ──final flush──► DESTROYED
//! ```
//!
//! No path returns to an earlier state; a later connection for the same
//! document gets a fresh session.
//!
//! Locking: the document's persistence lock is always taken before the
//! session's `inner` lock, never the other way round. Merging, relaying and
//! state transitions all happen under `inner`, which gives a single total
//! order per document.

use crate::merge::{CrdtDocument, MergeError, YrsDocument};
use crate::persistence::{
    DocumentLock, FlushOutcome, PersistenceError, PersistenceManager, SnapshotSpec,
};
use crate::protocol::DocumentId;
use crate::relay::{BroadcastRelay, ClientId, RelayStats, RelaySubscription};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

/// Lifecycle of a [`DocumentSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Loading,
    Active,
    Draining,
    Destroyed,
}

/// Session errors.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session is closed")]
    Closed,
    #[error("client is not attached to this session")]
    NotAttached,
    #[error(transparent)]
    Merge(#[from] MergeError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

/// Tunables shared by every session of a registry.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Quiescence window before an autosave fires.
    pub autosave_debounce: Duration,
    /// Frames a peer may trail the relay by before it is evicted.
    pub broadcast_capacity: usize,
    /// Attempts at the final flush before giving up.
    pub final_flush_attempts: u32,
    /// Base delay between final flush attempts (multiplied by attempt).
    pub final_flush_backoff: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            autosave_debounce: Duration::from_millis(1500),
            broadcast_capacity: 256,
            final_flush_attempts: 3,
            final_flush_backoff: Duration::from_millis(200),
        }
    }
}

/// What a newly attached client needs: the full state, then live deltas.
pub struct Attachment {
    pub initial_state: Vec<u8>,
    pub subscription: RelaySubscription,
}

/// Read-only view of a session for monitoring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub document_id: DocumentId,
    pub state: SessionState,
    pub clients: usize,
    /// Milliseconds since the Unix epoch of the last successful flush.
    pub last_saved_at: Option<u64>,
    /// Last persisted version, `None` until hydrated.
    pub version: Option<u64>,
    pub relay: RelayStats,
}

struct SessionInner<D> {
    doc: D,
    clients: HashSet<ClientId>,
    last_saved_at: Option<u64>,
    version: Option<u64>,
    /// Bumped on every in-memory mutation.
    revision: u64,
    /// Highest revision known to be durable.
    saved_revision: u64,
    pending_flush: Option<JoinHandle<()>>,
    flush_generation: u64,
}

pub struct DocumentSession<D: CrdtDocument = YrsDocument> {
    id: DocumentId,
    inner: Mutex<SessionInner<D>>,
    relay: BroadcastRelay,
    state: watch::Sender<SessionState>,
    persistence: Arc<PersistenceManager>,
    config: SessionConfig,
}

impl<D: CrdtDocument> DocumentSession<D> {
    /// A new session in `Loading`. Call [`hydrate`](Self::hydrate) next.
    pub fn new(id: DocumentId, persistence: Arc<PersistenceManager>, config: SessionConfig) -> Self {
        let (state, _) = watch::channel(SessionState::Loading);
        Self {
            id,
            inner: Mutex::new(SessionInner {
                doc: D::empty(),
                clients: HashSet::new(),
                last_saved_at: None,
                version: None,
                revision: 0,
                saved_revision: 0,
                pending_flush: None,
                flush_generation: 0,
            }),
            relay: BroadcastRelay::new(config.broadcast_capacity),
            state,
            persistence,
            config,
        }
    }

    pub fn id(&self) -> &DocumentId {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn relay_stats(&self) -> RelayStats {
        self.relay.stats()
    }

    /// Load the latest stored content (or start empty) and become `Active`.
    pub async fn hydrate(&self) -> Result<(), SessionError> {
        let lock = self.persistence.lock_document(&self.id).await;
        let record = self.persistence.open_document(&lock).await?;
        let doc = D::load_state(&record.content)?;

        let mut inner = self.inner.lock().await;
        inner.doc = doc;
        inner.last_saved_at = Some(record.updated_at);
        inner.version = Some(record.version);
        self.state.send_replace(SessionState::Active);

        log::info!(
            "session {} hydrated at version {} ({} bytes)",
            self.id,
            record.version,
            record.content.len()
        );
        Ok(())
    }

    /// Wait until the session has left `Loading` and return the state.
    pub async fn wait_settled(&self) -> SessionState {
        self.wait_for(|state| state != SessionState::Loading).await
    }

    pub async fn wait_destroyed(&self) {
        self.wait_for(|state| state == SessionState::Destroyed).await;
    }

    async fn wait_for(&self, done: impl Fn(SessionState) -> bool) -> SessionState {
        let mut rx = self.state.subscribe();
        let state = match rx.wait_for(|state| done(*state)).await {
            Ok(state) => *state,
            Err(_) => SessionState::Destroyed,
        };
        state
    }

    /// Mark a session that never became usable as destroyed.
    pub(crate) async fn abandon(&self) {
        let _inner = self.inner.lock().await;
        self.state.send_replace(SessionState::Destroyed);
    }

    /// Register `client` and hand it the current full state.
    ///
    /// Subscribing and encoding happen atomically with respect to incoming
    /// deltas, so the client sees every later delta exactly once.
    pub async fn add_client(&self, client: ClientId) -> Result<Attachment, SessionError> {
        let mut inner = self.inner.lock().await;
        if self.state() != SessionState::Active {
            return Err(SessionError::Closed);
        }
        inner.clients.insert(client);
        let subscription = self.relay.subscribe(client);
        let initial_state = inner.doc.encode_state();
        log::debug!(
            "client {client} attached to {} ({} clients)",
            self.id,
            inner.clients.len()
        );
        Ok(Attachment {
            initial_state,
            subscription,
        })
    }

    /// Deregister `client`. Returns `true` if it was the last one and the
    /// session moved to `Draining`; the caller must then run
    /// [`drain`](Self::drain).
    pub async fn remove_client(&self, client: ClientId) -> bool {
        let mut inner = self.inner.lock().await;
        if !inner.clients.remove(&client) {
            return false;
        }
        log::debug!(
            "client {client} detached from {} ({} clients left)",
            self.id,
            inner.clients.len()
        );
        if !inner.clients.is_empty() || self.state() != SessionState::Active {
            return false;
        }
        if let Some(pending) = inner.pending_flush.take() {
            pending.abort();
        }
        self.state.send_replace(SessionState::Draining);
        true
    }

    /// Merge a delta from `origin`, relay it to the other clients and
    /// (re)arm the autosave timer.
    ///
    /// A delta the engine rejects is dropped; the state is left untouched.
    pub async fn apply_remote_delta(
        self: &Arc<Self>,
        origin: ClientId,
        delta: Vec<u8>,
    ) -> Result<(), SessionError> {
        let mut inner = self.inner.lock().await;
        if !inner.clients.contains(&origin) {
            return Err(SessionError::NotAttached);
        }

        if let Err(e) = inner.doc.apply_delta(&delta) {
            log::warn!(
                "dropped malformed delta ({} bytes) from {origin} on {}: {e}",
                delta.len(),
                self.id
            );
            return Err(e.into());
        }

        inner.revision += 1;
        self.relay.relay_delta(origin, Arc::new(delta));
        self.schedule_autosave(&mut inner);
        Ok(())
    }

    fn schedule_autosave(self: &Arc<Self>, inner: &mut SessionInner<D>) {
        if let Some(pending) = inner.pending_flush.take() {
            pending.abort();
        }
        inner.flush_generation += 1;
        let generation = inner.flush_generation;
        let delay = self.config.autosave_debounce;
        let session = Arc::clone(self);
        inner.pending_flush = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            session.run_autosave(generation).await;
        }));
    }

    async fn run_autosave(self: Arc<Self>, generation: u64) {
        {
            let mut inner = self.inner.lock().await;
            if inner.flush_generation != generation {
                return;
            }
            // Detached from here on: later mutations re-arm a new timer
            // instead of cancelling this flush.
            inner.pending_flush = None;
        }

        match self.flush().await {
            Ok(Some(outcome)) => {
                log::debug!("autosaved {} at version {}", self.id, outcome.version)
            }
            Ok(None) => {}
            Err(e @ PersistenceError::DocumentNotFound(_)) => {
                log::error!("autosave of {} impossible: {e}", self.id);
            }
            Err(e) => {
                log::warn!("autosave of {} failed, will retry: {e}", self.id);
                let mut inner = self.inner.lock().await;
                if self.state() == SessionState::Active && inner.pending_flush.is_none() {
                    self.schedule_autosave(&mut inner);
                }
            }
        }
    }

    /// Persist the state if it changed since the last successful flush.
    pub async fn flush(&self) -> Result<Option<FlushOutcome>, PersistenceError> {
        let lock = self.persistence.lock_document(&self.id).await;
        let (content, revision) = {
            let inner = self.inner.lock().await;
            if inner.revision == inner.saved_revision {
                return Ok(None);
            }
            (inner.doc.encode_state(), inner.revision)
        };
        self.commit(&lock, content, revision, None).await.map(Some)
    }

    /// Persist the current state unconditionally, bumping the version.
    pub async fn checkpoint(
        &self,
        lock: &DocumentLock,
        snapshot: Option<SnapshotSpec>,
    ) -> Result<FlushOutcome, PersistenceError> {
        let (content, revision) = {
            let inner = self.inner.lock().await;
            (inner.doc.encode_state(), inner.revision)
        };
        self.commit(lock, content, revision, snapshot).await
    }

    async fn commit(
        &self,
        lock: &DocumentLock,
        content: Vec<u8>,
        revision: u64,
        snapshot: Option<SnapshotSpec>,
    ) -> Result<FlushOutcome, PersistenceError> {
        let outcome = self.persistence.commit_flush(lock, content, snapshot).await?;
        let mut inner = self.inner.lock().await;
        inner.saved_revision = inner.saved_revision.max(revision);
        inner.last_saved_at = Some(outcome.saved_at);
        inner.version = Some(outcome.version);
        Ok(outcome)
    }

    /// Swap in restored state that is already durable as `outcome` and
    /// tell every client to resync.
    ///
    /// Replicas cannot be rewound by merging, so attached clients are sent
    /// a reset and must reconnect.
    pub async fn install_restored(&self, doc: D, outcome: &FlushOutcome) {
        let mut inner = self.inner.lock().await;
        inner.doc = doc;
        inner.revision += 1;
        inner.saved_revision = inner.revision;
        inner.last_saved_at = Some(outcome.saved_at);
        inner.version = Some(outcome.version);
        let notified = self.relay.reset();
        log::info!(
            "session {} restored at version {}, {notified} clients reset",
            self.id,
            outcome.version
        );
    }

    /// Final flush of a `Draining` session, then `Destroyed`.
    ///
    /// Always writes a disconnect snapshot. Failed attempts are retried
    /// with a growing delay; if all fail the session is destroyed anyway
    /// and the last autosaved version remains the durable one.
    pub async fn drain(&self) {
        let attempts = self.config.final_flush_attempts.max(1);
        for attempt in 1..=attempts {
            let lock = self.persistence.lock_document(&self.id).await;
            match self.checkpoint(&lock, Some(SnapshotSpec::disconnect())).await {
                Ok(outcome) => {
                    log::info!(
                        "final flush of {} at version {} (snapshot {:?})",
                        self.id,
                        outcome.version,
                        outcome.snapshot_id
                    );
                    break;
                }
                Err(e @ PersistenceError::DocumentNotFound(_)) => {
                    log::error!("final flush of {} impossible: {e}", self.id);
                    break;
                }
                Err(e) if attempt < attempts => {
                    log::warn!(
                        "final flush of {} failed (attempt {attempt}/{attempts}): {e}",
                        self.id
                    );
                    drop(lock);
                    tokio::time::sleep(self.config.final_flush_backoff * attempt).await;
                }
                Err(e) => {
                    log::error!(
                        "final flush of {} failed after {attempts} attempts, unsaved edits lost: {e}",
                        self.id
                    );
                }
            }
        }

        let _inner = self.inner.lock().await;
        self.state.send_replace(SessionState::Destroyed);
        log::info!("session {} destroyed", self.id);
    }

    pub async fn summary(&self) -> SessionSummary {
        let inner = self.inner.lock().await;
        SessionSummary {
            document_id: self.id.clone(),
            state: self.state(),
            clients: inner.clients.len(),
            last_saved_at: inner.last_saved_at,
            version: inner.version,
            relay: self.relay.stats(),
        }
    }

    pub async fn client_count(&self) -> usize {
        self.inner.lock().await.clients.len()
    }

    /// Current full-state encoding of the live document.
    pub async fn encode_state(&self) -> Vec<u8> {
        self.inner.lock().await.doc.encode_state()
    }
}
