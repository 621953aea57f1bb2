//! WebSocket sync server on a shared listener.
//!
//! Architecture:
//! ```text
//!                 TcpListener (shared)
//!                        │
//!                  UpgradeRouter ──── sibling routes (chat, board, ...)
//!                        │ /doc/<id>
//!                  DocumentRoute
//!                        │
//!                 SessionRegistry ──── PersistenceManager ──── RecordStore
//!                        │                                      (RocksDB / memory)
//!         ┌──────────────┼──────────────┐
//!         ▼              ▼              ▼
//!     Client A       Client B       Client C
//! ```

use crate::access::{AccessPolicy, AllowAll};
use crate::persistence::PersistenceManager;
use crate::protocol::DEFAULT_DOCUMENT_PREFIX;
use crate::registry::SessionRegistry;
use crate::router::{DocumentRoute, UpgradeRoute, UpgradeRouter};
use crate::session::SessionConfig;
use crate::storage::{DocumentStore, MemoryStore, RecordStore, StoreConfig, StoreError};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// Path prefix identifying document connections
    pub document_prefix: String,
    /// Quiescence window before an autosave
    pub autosave_debounce: Duration,
    /// Upper bound on the upgrade handshake
    pub handshake_timeout: Duration,
    /// Broadcast channel capacity per session
    pub broadcast_capacity: usize,
    /// Attempts at the final flush on teardown
    pub final_flush_attempts: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            storage_path: None,
            document_prefix: DEFAULT_DOCUMENT_PREFIX.to_string(),
            autosave_debounce: Duration::from_millis(1500),
            handshake_timeout: Duration::from_secs(10),
            broadcast_capacity: 256,
            final_flush_attempts: 3,
        }
    }
}

impl ServerConfig {
    /// Short timers and small buffers for tests.
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            autosave_debounce: Duration::from_millis(100),
            handshake_timeout: Duration::from_secs(2),
            broadcast_capacity: 64,
            ..Self::default()
        }
    }

    /// Load configuration from `DOCSYNC_*` environment variables, falling
    /// back to defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bind_addr: std::env::var("DOCSYNC_BIND_ADDR").unwrap_or(defaults.bind_addr),
            storage_path: std::env::var("DOCSYNC_STORAGE_PATH")
                .ok()
                .filter(|p| !p.is_empty())
                .map(PathBuf::from),
            document_prefix: std::env::var("DOCSYNC_DOCUMENT_PREFIX")
                .unwrap_or(defaults.document_prefix),
            autosave_debounce: Duration::from_millis(env_or(
                "DOCSYNC_AUTOSAVE_DEBOUNCE_MS",
                defaults.autosave_debounce.as_millis() as u64,
            )),
            handshake_timeout: Duration::from_millis(env_or(
                "DOCSYNC_HANDSHAKE_TIMEOUT_MS",
                defaults.handshake_timeout.as_millis() as u64,
            )),
            broadcast_capacity: env_or("DOCSYNC_BROADCAST_CAPACITY", defaults.broadcast_capacity),
            final_flush_attempts: defaults.final_flush_attempts,
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            autosave_debounce: self.autosave_debounce,
            broadcast_capacity: self.broadcast_capacity,
            final_flush_attempts: self.final_flush_attempts,
            ..SessionConfig::default()
        }
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            log::warn!("ignoring unparseable {name}={raw:?}");
            default
        }),
        Err(_) => default,
    }
}

/// Server statistics snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub total_connections: u64,
    pub active_connections: u64,
    pub frames_received: u64,
    pub bytes_received: u64,
    pub frames_rejected: u64,
    pub peers_evicted: u64,
    pub handshakes_rejected: u64,
}

/// Server-wide counters, updated lock-free from connection tasks.
#[derive(Debug, Default)]
pub struct ServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    frames_received: AtomicU64,
    bytes_received: AtomicU64,
    frames_rejected: AtomicU64,
    peers_evicted: AtomicU64,
    handshakes_rejected: AtomicU64,
}

impl ServerStats {
    pub(crate) fn connection_opened(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn frame_received(&self, bytes: usize) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn frame_rejected(&self) {
        self.frames_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn peer_evicted(&self) {
        self.peers_evicted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn handshake_rejected(&self) {
        self.handshakes_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            frames_rejected: self.frames_rejected.load(Ordering::Relaxed),
            peers_evicted: self.peers_evicted.load(Ordering::Relaxed),
            handshakes_rejected: self.handshakes_rejected.load(Ordering::Relaxed),
        }
    }
}

/// Server errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    registry: Arc<SessionRegistry>,
    policy: Arc<dyn AccessPolicy>,
    sibling_routes: Vec<Arc<dyn UpgradeRoute>>,
    stats: Arc<ServerStats>,
}

impl SyncServer {
    /// Create a server over an already opened record store.
    pub fn new(config: ServerConfig, store: Arc<dyn RecordStore>) -> Self {
        let persistence = Arc::new(PersistenceManager::new(store));
        let registry = Arc::new(SessionRegistry::new(persistence, config.session_config()));
        Self {
            config,
            registry,
            policy: Arc::new(AllowAll),
            sibling_routes: Vec::new(),
            stats: Arc::new(ServerStats::default()),
        }
    }

    /// Open the configured store (RocksDB if a path is set, memory
    /// otherwise) and create the server.
    pub fn open(config: ServerConfig) -> Result<Self, ServerError> {
        let store: Arc<dyn RecordStore> = match &config.storage_path {
            Some(path) => Arc::new(DocumentStore::open(StoreConfig {
                path: path.clone(),
                ..StoreConfig::default()
            })?),
            None => {
                log::warn!("no storage path configured, documents are kept in memory only");
                Arc::new(MemoryStore::new())
            }
        };
        Ok(Self::new(config, store))
    }

    pub fn with_policy(mut self, policy: Arc<dyn AccessPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Share the listener with another upgrade handler.
    pub fn with_route(mut self, route: Arc<dyn UpgradeRoute>) -> Self {
        self.sibling_routes.push(route);
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn stats(&self) -> &Arc<ServerStats> {
        &self.stats
    }

    fn build_router(&self) -> UpgradeRouter {
        let documents = DocumentRoute::new(
            self.config.document_prefix.clone(),
            Arc::clone(&self.registry),
            Arc::clone(&self.policy),
            Arc::clone(&self.stats),
        );
        let mut router = UpgradeRouter::new(self.config.handshake_timeout, Arc::clone(&self.stats))
            .with_route(Arc::new(documents));
        for route in &self.sibling_routes {
            router = router.with_route(Arc::clone(route));
        }
        router
    }

    /// Bind the configured address and serve until the task is dropped.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("sync server listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        let router = Arc::new(self.build_router());
        log::info!("serving routes: {}", router.route_names().join(", "));
        loop {
            let (stream, peer) = listener.accept().await?;
            log::trace!("new TCP connection from {peer}");

            let router = Arc::clone(&router);
            tokio::spawn(async move {
                if let Err(e) = router.dispatch(stream, peer).await {
                    log::debug!("connection from {peer} ended: {e}");
                }
            });
        }
    }
}
