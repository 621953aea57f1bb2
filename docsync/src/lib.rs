//! # docsync — Real-time collaborative document synchronization
//!
//! Many clients edit one logical document concurrently over WebSockets.
//! Edits are CRDT deltas, merged without coordination, relayed to peers,
//! and checkpointed to a durable store without blocking live editing.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────┐   binary frames   ┌────────────────┐
//! │ DocumentClient │ ◄───────────────► │ UpgradeRouter  │──► sibling routes
//! │ (replica)      │                   └───────┬────────┘
//! └────────────────┘                           │ /doc/<id>
//!                                      ┌───────┴────────┐
//!                                      │ SessionRegistry│
//!                                      └───────┬────────┘
//!                          ┌───────────────────┼───────────────────┐
//!                          ▼                   ▼                   ▼
//!                  ┌──────────────┐   ┌────────────────┐   ┌──────────────────┐
//!                  │ CrdtDocument │   │ BroadcastRelay │   │PersistenceManager│
//!                  │ (merge)      │   │ (fan-out)      │   │ (RecordStore)    │
//!                  └──────────────┘   └────────────────┘   └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Document ids, endpoint paths, close codes
//! - [`merge`] — CRDT merge contract and its Yrs implementation
//! - [`relay`] — Per-session fan-out with lag-based eviction
//! - [`session`] — Session state machine, debounced autosave, teardown
//! - [`registry`] — Session arena, snapshots, restore, monitoring
//! - [`persistence`] — Versioned flushes and snapshot history
//! - [`storage`] — Record stores (RocksDB, in-memory)
//! - [`access`] — Handshake-time authorization
//! - [`router`] — Upgrade routing over a shared listener
//! - [`server`] — Server assembly, configuration, statistics
//! - [`client`] — Client replica with offline queue and reconnect

pub mod access;
pub mod client;
pub mod merge;
pub mod persistence;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod router;
pub mod server;
pub mod session;
pub mod storage;

// Re-exports for convenience
pub use access::{AccessDenied, AccessPolicy, AllowAll, TokenPolicy};
pub use client::{
    ClientConfig, ClientEvent, ConnectionState, DocumentClient, OfflineQueue, ReconnectPolicy,
};
pub use merge::{CrdtDocument, MergeError, YrsDocument, DEFAULT_TEXT};
pub use persistence::{FlushOutcome, PersistenceError, PersistenceManager, SnapshotSpec};
pub use protocol::{DocumentId, ProtocolError};
pub use registry::SessionRegistry;
pub use relay::{BroadcastRelay, ClientId, RelayStats};
pub use router::{DocumentRoute, RouteRequest, ServerSocket, UpgradeRoute, UpgradeRouter};
pub use server::{ServerConfig, ServerError, ServerStats, StatsSnapshot, SyncServer};
pub use session::{DocumentSession, SessionConfig, SessionError, SessionState, SessionSummary};
pub use storage::{
    DocumentRecord, DocumentStore, MemoryStore, RecordStore, SnapshotRecord, SnapshotTrigger,
    StoreConfig, StoreError,
};
