//! Per-room fan-out with bounded buffering.
//!
//! Uses a tokio broadcast channel so one send reaches every member. Each
//! frame is encoded once and tagged with the connection it came from; the
//! receiving connection tasks skip frames they originated, so the sender
//! never gets its own edit/cursor/chat echoed back.
//!
//! A receiver that falls more than `capacity` frames behind observes
//! `RecvError::Lagged`; the server drops that connection rather than
//! buffering without bound.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;
use uuid::Uuid;

use crate::protocol::{WireError, WireMessage};

/// Server-assigned identity of one WebSocket connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One encoded frame queued for a room.
#[derive(Debug)]
pub struct RoomFrame {
    /// Connection that caused the frame; `None` for server-originated frames
    pub origin: Option<ConnectionId>,
    pub text: String,
}

impl RoomFrame {
    /// Whether `connection` should forward this frame to its socket.
    pub fn is_for(&self, connection: ConnectionId) -> bool {
        self.origin != Some(connection)
    }
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_peers: usize,
}

/// Lock-free counters for the hot path.
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

/// A broadcast group for a single document room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<RoomFrame>>,
    capacity: usize,
    stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    /// `capacity` frames are buffered per receiver before it lags.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            capacity,
            stats: AtomicBroadcastStats {
                messages_sent: AtomicU64::new(0),
                messages_dropped: AtomicU64::new(0),
            },
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<RoomFrame>> {
        self.sender.subscribe()
    }

    /// Encode `msg` once and fan it out. Returns the number of receivers,
    /// the origin's own receiver included.
    pub fn broadcast(
        &self,
        origin: Option<ConnectionId>,
        msg: &WireMessage,
    ) -> Result<usize, WireError> {
        let text = msg.encode()?;
        Ok(self.broadcast_frame(Arc::new(RoomFrame { origin, text })))
    }

    /// Fan out an already encoded frame.
    pub fn broadcast_frame(&self, frame: Arc<RoomFrame>) -> usize {
        let count = self.sender.send(frame).unwrap_or(0);
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Account for frames a lagging receiver skipped.
    pub fn record_dropped(&self, frames: u64) {
        self.stats.messages_dropped.fetch_add(frames, Ordering::Relaxed);
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            active_peers: self.sender.receiver_count(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl fmt::Debug for BroadcastGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BroadcastGroup")
            .field("capacity", &self.capacity)
            .field("receivers", &self.sender.receiver_count())
            .finish()
    }
}
