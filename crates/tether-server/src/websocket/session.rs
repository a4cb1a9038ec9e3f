//! One WebSocket client from upgrade through disconnect.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge, histogram};
use tether_core::errors::RelayError;
use tether_core::ids::{ConnectionId, PrincipalId};
use tether_runtime::{ClientConnection, LifecycleManager};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::handler::handle_text;
use crate::config::ServerConfig;
use crate::metrics::{
    WS_CONNECTION_DURATION_SECONDS, WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL, WS_DISCONNECTIONS_TOTAL,
};

/// How long the writer gets to flush a close frame after the reader stops.
const WRITER_GRACE: Duration = Duration::from_secs(5);

/// Transport knobs for one connection.
#[derive(Clone, Copy, Debug)]
pub struct SessionOptions {
    /// Ping period.
    pub heartbeat_interval: Duration,
    /// Close after this long without a pong.
    pub heartbeat_timeout: Duration,
    /// Outbound queue depth.
    pub outbound_buffer: usize,
}

impl From<&ServerConfig> for SessionOptions {
    fn from(config: &ServerConfig) -> Self {
        Self {
            heartbeat_interval: config.heartbeat_interval,
            heartbeat_timeout: config.heartbeat_timeout,
            outbound_buffer: config.outbound_buffer,
        }
    }
}

/// Drive an authenticated socket until it closes.
///
/// 1. Registers the connection (sends `connection-established` and any resume)
/// 2. Dispatches inbound text frames in arrival order
/// 3. Forwards the outbound queue and pings from a writer task
/// 4. On close, error, heartbeat timeout, or `cancel`: unregisters, which may
///    end the principal's shares
#[instrument(skip_all, fields(conn_id, principal = %principal))]
pub async fn run_ws_session(
    ws: WebSocket,
    principal: PrincipalId,
    lifecycle: Arc<LifecycleManager>,
    options: SessionOptions,
    cancel: CancellationToken,
) {
    let (ws_tx, mut ws_rx) = ws.split();
    let (send_tx, send_rx) = mpsc::channel::<Arc<String>>(options.outbound_buffer.max(1));
    let connection = Arc::new(ClientConnection::new(ConnectionId::new(), principal, send_tx));
    let _ = tracing::Span::current().record("conn_id", connection.id.as_str());

    if let Err(e) = lifecycle.handle_connect(&connection) {
        warn!(error = %e, "failed to register connection");
        return;
    }

    info!("client connected");
    counter!(WS_CONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);

    let writer = tokio::spawn(run_writer(ws_tx, send_rx, Arc::clone(&connection), options));

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                let text = match msg {
                    Some(Ok(Message::Text(t))) => t.to_string(),
                    // Some clients send JSON in binary frames.
                    Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                        Ok(s) => s.to_string(),
                        Err(_) => {
                            debug!(len = data.len(), "ignoring non-UTF8 binary frame");
                            continue;
                        }
                    },
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                        connection.mark_alive();
                        continue;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("client closed the socket");
                        break;
                    }
                    Some(Err(e)) => {
                        let err = read_failure(&e);
                        debug!(code = err.code(), error = %err, "socket read failed");
                        break;
                    }
                };
                handle_text(&lifecycle, &connection, &text);
            }
            () = connection.closed() => break,
            () = cancel.cancelled() => {
                debug!("server shutting down, closing connection");
                break;
            }
        }
    }

    connection.close();
    let ended = lifecycle.handle_disconnect(&connection);
    if tokio::time::timeout(WRITER_GRACE, writer).await.is_err() {
        debug!("writer did not finish in time");
    }

    info!(
        sessions_ended = ended.len(),
        dropped = connection.drop_count(),
        "client disconnected"
    );
    counter!(WS_DISCONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
    histogram!(WS_CONNECTION_DURATION_SECONDS).record(connection.age().as_secs_f64());
}

/// A failed socket read. Reconnecting is the client's job.
fn read_failure(err: &axum::Error) -> RelayError {
    RelayError::Transport {
        message: err.to_string(),
    }
}

/// Forward queued frames and send pings until the connection closes or the
/// socket fails. Frames already queued are flushed before closing.
async fn run_writer(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut send_rx: mpsc::Receiver<Arc<String>>,
    connection: Arc<ClientConnection>,
    options: SessionOptions,
) {
    let mut ping_interval = tokio::time::interval(options.heartbeat_interval);
    let _ = ping_interval.tick().await;

    loop {
        tokio::select! {
            biased;
            msg = send_rx.recv() => {
                let Some(text) = msg else { break };
                if ws_tx.send(Message::Text(text.to_string().into())).await.is_err() {
                    break;
                }
            }
            () = connection.closed() => break,
            _ = ping_interval.tick() => {
                if !connection.check_alive() && connection.last_pong_elapsed() > options.heartbeat_timeout {
                    warn!(timeout = ?options.heartbeat_timeout, "client unresponsive, disconnecting");
                    break;
                }
                if ws_tx.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }

    // The reader watches `closed()`, so this stops it too.
    connection.close();
    let _ = ws_tx.send(Message::Close(None)).await;
}
