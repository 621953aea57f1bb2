//! docsync-server — standalone document synchronization server.
//!
//! Configured from `DOCSYNC_*` environment variables; logging via `RUST_LOG`
//! (defaults to `info`).

use docsync::{ServerConfig, SyncServer};
use std::sync::Arc;
use std::time::Duration;

const MONITOR_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServerConfig::from_env();
    log::info!(
        "starting docsync-server on {} (prefix {}, debounce {:?}, storage {})",
        config.bind_addr,
        config.document_prefix,
        config.autosave_debounce,
        config
            .storage_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "memory".to_string()),
    );

    let server = match SyncServer::open(config) {
        Ok(server) => Arc::new(server),
        Err(e) => {
            log::error!("failed to start: {e}");
            std::process::exit(1);
        }
    };

    let monitor = tokio::spawn(monitor(Arc::clone(&server)));

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                log::error!("server stopped: {e}");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            log::info!("shutdown requested");
        }
    }

    monitor.abort();
    let flushed = server.registry().flush_all().await;
    log::info!("flushed {flushed} sessions, bye");
}

/// Periodically log every live session.
async fn monitor(server: Arc<SyncServer>) {
    let mut ticker = tokio::time::interval(MONITOR_INTERVAL);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let stats = server.stats().snapshot();
        let sessions = server.registry().active_sessions().await;
        log::info!(
            "{} sessions, {} connections ({} total), {} frames, {} rejected, {} evicted",
            sessions.len(),
            stats.active_connections,
            stats.total_connections,
            stats.frames_received,
            stats.frames_rejected,
            stats.peers_evicted,
        );
        for session in sessions {
            log::info!(
                "  {} [{:?}] clients={} version={:?} last_saved_at={:?}",
                session.document_id,
                session.state,
                session.clients,
                session.version,
                session.last_saved_at,
            );
        }
    }
}
