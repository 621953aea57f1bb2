//! Client replica for document connections.
//!
//! Provides:
//! - A local CRDT replica merged from the server's initial state and
//!   relayed deltas
//! - Local edits streamed as deltas
//! - Offline queue for edits made while disconnected
//! - Reconnection with bounded exponential backoff
//!
//! After every initial sync the client sends one diff against the server's
//! state vector. It covers queued edits and edits lost in flight when the
//! previous connection died; merging it twice is harmless.
//!
//! A reset close (code 4001, sent after a restore) discards the replica
//! and the queue, then reconnects straight away for the restored state.

use crate::merge::{CrdtDocument, YrsDocument, DEFAULT_TEXT};
use crate::protocol::{DocumentId, CLOSE_DOCUMENT_RESET, DEFAULT_DOCUMENT_PREFIX};
use futures_util::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// Connected and holding the server's initial state.
    Connected,
    Reconnecting,
    /// Retries exhausted or closed by the application.
    Closed,
}

/// Events emitted by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Connected,
    /// Initial state merged; `bytes` is the size of the server's encoding.
    Synced { bytes: usize },
    RemoteDelta(Vec<u8>),
    /// The document was restored on the server; the replica was dropped.
    Reset,
    Disconnected { close_code: Option<u16> },
    GaveUp { attempts: u32 },
}

/// Bounded exponential backoff.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub max_retries: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(10),
            max_retries: 8,
        }
    }
}

impl ReconnectPolicy {
    /// `initial_delay * 2^attempt`, capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server base URL, e.g. `ws://127.0.0.1:9090`
    pub server_url: String,
    pub document_prefix: String,
    /// Sent as the `token` query parameter.
    pub token: Option<String>,
    pub reconnect: ReconnectPolicy,
    pub offline_queue_capacity: usize,
}

impl ClientConfig {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            document_prefix: DEFAULT_DOCUMENT_PREFIX.to_string(),
            token: None,
            reconnect: ReconnectPolicy::default(),
            offline_queue_capacity: 10_000,
        }
    }

    pub fn document_url(&self, document: &DocumentId) -> String {
        let base = self.server_url.trim_end_matches('/');
        match &self.token {
            Some(token) => format!("{base}{}{document}?token={token}", self.document_prefix),
            None => format!("{base}{}{document}", self.document_prefix),
        }
    }
}

/// Edits made while disconnected, awaiting the next sync.
///
/// The replica already holds every queued edit; the catch-up diff sent after
/// the next initial sync supersedes the queue, which is then cleared.
pub struct OfflineQueue {
    queue: VecDeque<Vec<u8>>,
    max_size: usize,
    overflowed: bool,
}

impl OfflineQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
            overflowed: false,
        }
    }

    /// Queue a delta; returns false (and marks the overflow) if full.
    pub fn enqueue(&mut self, delta: Vec<u8>) -> bool {
        if self.queue.len() >= self.max_size {
            self.overflowed = true;
            return false;
        }
        self.queue.push_back(delta);
        true
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn overflowed(&self) -> bool {
        self.overflowed
    }

    pub fn clear(&mut self) {
        self.queue.clear();
        self.overflowed = false;
    }
}

/// Where local edits go: the live connection, or the queue.
struct Link {
    outgoing: Option<mpsc::UnboundedSender<Vec<u8>>>,
    queue: OfflineQueue,
}

struct Shared {
    url: String,
    policy: ReconnectPolicy,
    replica: Mutex<YrsDocument>,
    link: Mutex<Link>,
    state: watch::Sender<ConnectionState>,
    events: mpsc::Sender<ClientEvent>,
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    fn emit(&self, event: ClientEvent) {
        if self.events.try_send(event).is_err() {
            log::trace!("client event dropped (receiver full or gone)");
        }
    }
}

enum SessionEnd {
    Reset,
    Closed(Option<u16>),
    Shutdown,
}

/// A document replica kept in sync with the server.
pub struct DocumentClient {
    document_id: DocumentId,
    shared: Arc<Shared>,
    events: Option<mpsc::Receiver<ClientEvent>>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl DocumentClient {
    /// Start connecting in the background.
    pub fn connect(config: ClientConfig, document_id: DocumentId) -> Self {
        let (events_tx, events_rx) = mpsc::channel(256);
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let shared = Arc::new(Shared {
            url: config.document_url(&document_id),
            policy: config.reconnect.clone(),
            replica: Mutex::new(YrsDocument::new()),
            link: Mutex::new(Link {
                outgoing: None,
                queue: OfflineQueue::new(config.offline_queue_capacity),
            }),
            state,
            events: events_tx,
        });

        let task = tokio::spawn(connection_loop(Arc::clone(&shared), shutdown_rx));

        Self {
            document_id,
            shared,
            events: Some(events_rx),
            shutdown,
            task,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.events.take()
    }

    pub fn document_id(&self) -> &DocumentId {
        &self.document_id
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Wait until connected and synced. Returns false if the client gave up.
    pub async fn wait_connected(&self) -> bool {
        let mut rx = self.shared.state.subscribe();
        let connected = match rx
            .wait_for(|s| matches!(s, ConnectionState::Connected | ConnectionState::Closed))
            .await
        {
            Ok(state) => *state == ConnectionState::Connected,
            Err(_) => false,
        };
        connected
    }

    /// Current text of the replica's default text root.
    pub async fn text(&self) -> String {
        self.shared.replica.lock().await.text(DEFAULT_TEXT)
    }

    pub async fn encode_state(&self) -> Vec<u8> {
        self.shared.replica.lock().await.encode_state()
    }

    pub async fn insert_text(&self, index: u32, chunk: &str) {
        let delta = self.shared.replica.lock().await.insert_text(DEFAULT_TEXT, index, chunk);
        self.submit(delta).await;
    }

    pub async fn append_text(&self, chunk: &str) {
        let delta = self.shared.replica.lock().await.append_text(DEFAULT_TEXT, chunk);
        self.submit(delta).await;
    }

    pub async fn remove_text(&self, index: u32, len: u32) {
        let delta = self.shared.replica.lock().await.remove_text(DEFAULT_TEXT, index, len);
        self.submit(delta).await;
    }

    async fn submit(&self, delta: Vec<u8>) {
        let mut link = self.shared.link.lock().await;
        let delta = match &link.outgoing {
            Some(tx) => match tx.send(delta) {
                Ok(()) => return,
                Err(mpsc::error::SendError(delta)) => delta,
            },
            None => delta,
        };
        if !link.queue.enqueue(delta) {
            log::trace!("offline queue full, edit kept in the replica only");
        }
    }

    pub async fn offline_queue_len(&self) -> usize {
        self.shared.link.lock().await.queue.len()
    }

    /// Close the connection and stop reconnecting.
    pub async fn close(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}

async fn connection_loop(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    let mut attempt: u32 = 0;
    let mut connected_before = false;

    loop {
        shared.set_state(if connected_before {
            ConnectionState::Reconnecting
        } else {
            ConnectionState::Connecting
        });

        let connect = tokio_tungstenite::connect_async(shared.url.as_str());
        let result = tokio::select! {
            result = connect => result,
            _ = shutdown.changed() => break,
        };

        match result {
            Ok((socket, _)) => {
                connected_before = true;
                shared.emit(ClientEvent::Connected);
                match run_session(&shared, socket, &mut shutdown, &mut attempt).await {
                    SessionEnd::Shutdown => break,
                    SessionEnd::Reset => {
                        log::info!("document reset by server, resyncing");
                        *shared.replica.lock().await = YrsDocument::new();
                        shared.link.lock().await.queue.clear();
                        shared.emit(ClientEvent::Reset);
                        continue;
                    }
                    SessionEnd::Closed(close_code) => {
                        shared.emit(ClientEvent::Disconnected { close_code });
                    }
                }
            }
            Err(e) => log::debug!("connect to {} failed: {e}", shared.url),
        }

        if attempt >= shared.policy.max_retries {
            log::warn!("giving up on {} after {attempt} attempts", shared.url);
            shared.emit(ClientEvent::GaveUp { attempts: attempt });
            break;
        }
        shared.set_state(ConnectionState::Disconnected);
        let delay = shared.policy.delay_for(attempt);
        attempt += 1;
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => break,
        }
    }

    shared.link.lock().await.outgoing = None;
    shared.set_state(ConnectionState::Closed);
}

async fn run_session<S>(
    shared: &Shared,
    socket: tokio_tungstenite::WebSocketStream<S>,
    shutdown: &mut watch::Receiver<bool>,
    attempt: &mut u32,
) -> SessionEnd
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut sink, mut stream) = socket.split();

    // The first frame is always the server's full state.
    let initial: Vec<u8> = loop {
        match stream.next().await {
            Some(Ok(Message::Binary(data))) => break data.into(),
            Some(Ok(Message::Close(frame))) => return close_outcome(frame.map(|f| u16::from(f.code))),
            Some(Ok(_)) => continue,
            Some(Err(_)) | None => return SessionEnd::Closed(None),
        }
    };

    // A brand-new document arrives as a zero-length state.
    let server = match YrsDocument::load_state(&initial) {
        Ok(server) => server,
        Err(e) => {
            log::error!("initial state from {} rejected: {e}", shared.url);
            return SessionEnd::Closed(None);
        }
    };

    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let catch_up = {
        let mut link = shared.link.lock().await;
        let mut replica = shared.replica.lock().await;
        if !initial.is_empty() {
            if let Err(e) = replica.apply_delta(&initial) {
                log::error!("initial state from {} rejected: {e}", shared.url);
                return SessionEnd::Closed(None);
            }
        }
        let queued = link.queue.len();
        link.queue.clear();
        link.outgoing = Some(tx);
        match replica.diff(&server.state_vector()) {
            Ok(diff) => {
                if queued > 0 {
                    log::info!("sending {queued} offline edits as one diff");
                }
                diff
            }
            Err(e) => {
                log::error!("catch-up diff for {} failed: {e}", shared.url);
                Vec::new()
            }
        }
    };

    *attempt = 0;
    shared.set_state(ConnectionState::Connected);
    shared.emit(ClientEvent::Synced { bytes: initial.len() });

    let end = 'session: {
        if !catch_up.is_empty() && sink.send(Message::Binary(catch_up.into())).await.is_err() {
            break 'session SessionEnd::Closed(None);
        }

        loop {
            tokio::select! {
                outgoing = rx.recv() => match outgoing {
                    Some(delta) => {
                        if sink.send(Message::Binary(delta.into())).await.is_err() {
                            break 'session SessionEnd::Closed(None);
                        }
                    }
                    None => break 'session SessionEnd::Closed(None),
                },
                frame = stream.next() => match frame {
                    Some(Ok(Message::Binary(data))) => {
                        let bytes: Vec<u8> = data.into();
                        if let Err(e) = shared.replica.lock().await.apply_delta(&bytes) {
                            log::warn!("ignoring undecodable delta from server: {e}");
                            continue;
                        }
                        shared.emit(ClientEvent::RemoteDelta(bytes));
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break 'session close_outcome(frame.map(|f| u16::from(f.code)));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(_)) | None => break 'session SessionEnd::Closed(None),
                },
                _ = shutdown.changed() => {
                    let _ = sink.send(Message::Close(None)).await;
                    break 'session SessionEnd::Shutdown;
                }
            }
        }
    };

    // Unsent edits are still in the replica; the queue only counts them.
    let mut link = shared.link.lock().await;
    link.outgoing = None;
    while let Ok(delta) = rx.try_recv() {
        link.queue.enqueue(delta);
    }
    end
}

fn close_outcome(code: Option<u16>) -> SessionEnd {
    match code {
        Some(CLOSE_DOCUMENT_RESET) => SessionEnd::Reset,
        other => SessionEnd::Closed(other),
    }
}
