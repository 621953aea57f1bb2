//! Fan-out of deltas to the other clients of one session.
//!
//! Uses a tokio broadcast channel so a send never waits on any receiver.
//! Every subscriber gets an independent cursor into a ring of `capacity`
//! frames; a subscriber that falls further behind than that lags, loses
//! frames, and is told so, which the connection driver turns into a
//! disconnect. Other subscribers are unaffected.
//!
//! Frames are delivered to each subscriber in send order, so a single
//! sender's deltas keep their emission order at every peer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;

/// Identifies one live connection within the server.
pub type ClientId = Uuid;

/// A frame travelling through the relay.
#[derive(Debug, Clone)]
pub enum RelayFrame {
    /// Raw delta bytes, exactly as received from `origin`.
    Delta {
        origin: ClientId,
        payload: Arc<Vec<u8>>,
    },
    /// The session state was replaced; replicas must resync.
    Reset,
}

/// What a subscriber should do next.
#[derive(Debug)]
pub enum RelayEvent {
    Deliver(Arc<Vec<u8>>),
    Reset,
    /// The subscriber missed `n` frames and can no longer be kept consistent.
    Lagged(u64),
    Closed,
}

/// Statistics for monitoring relay health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub frames_relayed: u64,
    pub frames_dropped: u64,
    pub subscribers: usize,
    /// Frames a subscriber may trail by before it is evicted.
    pub capacity: usize,
}

struct AtomicRelayStats {
    frames_relayed: AtomicU64,
    frames_dropped: AtomicU64,
}

/// Per-session broadcast relay.
pub struct BroadcastRelay {
    sender: broadcast::Sender<RelayFrame>,
    capacity: usize,
    stats: Arc<AtomicRelayStats>,
}

impl BroadcastRelay {
    /// `capacity` bounds how many frames a slow subscriber may trail by.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            capacity,
            stats: Arc::new(AtomicRelayStats {
                frames_relayed: AtomicU64::new(0),
                frames_dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Subscribe `client` to this relay. Its own deltas are filtered out.
    pub fn subscribe(&self, client: ClientId) -> RelaySubscription {
        RelaySubscription {
            client,
            receiver: self.sender.subscribe(),
            stats: self.stats.clone(),
        }
    }

    /// Forward `payload` from `origin` to every other subscriber.
    ///
    /// Returns the number of subscribers the frame was queued for (the
    /// origin included, it discards the frame on receipt).
    pub fn relay_delta(&self, origin: ClientId, payload: Arc<Vec<u8>>) -> usize {
        let count = self
            .sender
            .send(RelayFrame::Delta { origin, payload })
            .unwrap_or(0);
        self.stats.frames_relayed.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Tell every subscriber to drop its replica and resync.
    pub fn reset(&self) -> usize {
        self.sender.send(RelayFrame::Reset).unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn stats(&self) -> RelayStats {
        RelayStats {
            frames_relayed: self.stats.frames_relayed.load(Ordering::Relaxed),
            frames_dropped: self.stats.frames_dropped.load(Ordering::Relaxed),
            subscribers: self.sender.receiver_count(),
            capacity: self.capacity,
        }
    }
}

/// One client's view of a relay.
pub struct RelaySubscription {
    client: ClientId,
    receiver: broadcast::Receiver<RelayFrame>,
    stats: Arc<AtomicRelayStats>,
}

impl RelaySubscription {
    pub fn client(&self) -> ClientId {
        self.client
    }

    /// Wait for the next frame addressed to this client.
    pub async fn recv(&mut self) -> RelayEvent {
        loop {
            match self.receiver.recv().await {
                Ok(RelayFrame::Delta { origin, .. }) if origin == self.client => continue,
                Ok(RelayFrame::Delta { payload, .. }) => return RelayEvent::Deliver(payload),
                Ok(RelayFrame::Reset) => return RelayEvent::Reset,
                Err(RecvError::Lagged(n)) => {
                    self.stats.frames_dropped.fetch_add(n, Ordering::Relaxed);
                    return RelayEvent::Lagged(n);
                }
                Err(RecvError::Closed) => return RelayEvent::Closed,
            }
        }
    }
}
