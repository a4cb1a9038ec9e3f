//! Live client connection state.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tether_core::events::RelayEvent;
use tether_core::ids::{ConnectionId, PrincipalId};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// One authenticated transport connection.
///
/// Owns the sending half of the connection's outbound queue. The receiving
/// half lives in the transport's writer task, which also watches
/// [`ClientConnection::closed`] so [`ClientConnection::close`] tears the
/// socket down even while frames are still queued.
pub struct ClientConnection {
    /// Unique connection ID.
    pub id: ConnectionId,
    /// Principal this connection authenticated as.
    pub principal: PrincipalId,
    tx: mpsc::Sender<Arc<String>>,
    /// When this connection was established.
    pub connected_at: Instant,
    /// Whether the client has responded to the last ping.
    pub is_alive: AtomicBool,
    last_pong: Mutex<Instant>,
    /// Count of messages dropped due to a full queue.
    pub dropped_messages: AtomicU64,
    shutdown: CancellationToken,
}

impl ClientConnection {
    /// Create a new connection.
    pub fn new(id: ConnectionId, principal: PrincipalId, tx: mpsc::Sender<Arc<String>>) -> Self {
        let now = Instant::now();
        Self {
            id,
            principal,
            tx,
            connected_at: now,
            is_alive: AtomicBool::new(true),
            last_pong: Mutex::new(now),
            dropped_messages: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        }
    }

    /// Queue a serialized frame.
    ///
    /// Never blocks. Returns `false` if the connection is closed or the queue
    /// is full; a full queue also bumps the drop counter.
    pub fn send(&self, message: Arc<String>) -> bool {
        if self.is_closed() {
            return false;
        }
        if self.tx.try_send(message).is_ok() {
            true
        } else {
            let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Serialize an event into the outbound envelope and queue it.
    pub fn send_event(&self, event: &RelayEvent, timestamp_ms: i64, request_id: Option<&str>) -> bool {
        match event.to_frame(timestamp_ms, request_id) {
            Ok(json) => self.send(Arc::new(json)),
            Err(e) => {
                warn!(conn_id = %self.id, event_type = event.event_type(), error = %e, "failed to serialize event");
                false
            }
        }
    }

    /// Total messages dropped for this connection.
    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    /// Mark closed. Later sends fail and the writer task stops.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    /// Whether [`ClientConnection::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Resolves once the connection is closed.
    pub async fn closed(&self) {
        self.shutdown.cancelled().await;
    }

    /// Mark the connection as alive (pong received).
    pub fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::Relaxed);
        *self.last_pong.lock() = Instant::now();
    }

    /// Duration since the last pong (or connection establishment).
    pub fn last_pong_elapsed(&self) -> Duration {
        self.last_pong.lock().elapsed()
    }

    /// Check and reset the alive flag for heartbeat.
    pub fn check_alive(&self) -> bool {
        self.is_alive.swap(false, Ordering::Relaxed)
    }

    /// Connection age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}

impl std::fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConnection")
            .field("id", &self.id)
            .field("principal", &self.principal)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
