//! Inbound frame dispatch.
//!
//! Parses one text frame, runs the matching lifecycle operation, and turns
//! any failure into an `error` reply on the same connection. A failure never
//! ends the connection.

use metrics::counter;
use tether_core::errors::RelayError;
use tether_core::events::{ClientCommand, FrameError, InboundFrame, RelayEvent};
use tether_runtime::{ClientConnection, LifecycleManager};
use tracing::{debug, instrument, warn};

use crate::metrics::{RELAY_ERRORS_TOTAL, RELAY_EVENTS_RECEIVED_TOTAL};

/// Handle one inbound text frame from `conn`.
#[instrument(skip_all, fields(conn_id = %conn.id, principal = %conn.principal, event))]
pub fn handle_text(lifecycle: &LifecycleManager, conn: &ClientConnection, text: &str) {
    let frame = match InboundFrame::parse(text) {
        Ok(frame) => frame,
        Err(FrameError { request_id, error }) => {
            warn!(error = %error, "rejected client frame");
            reply_error(lifecycle, conn, &error, request_id.as_deref());
            return;
        }
    };

    let name = frame.command.name();
    let _ = tracing::Span::current().record("event", name);
    counter!(RELAY_EVENTS_RECEIVED_TOTAL, "event" => name).increment(1);
    debug!(request_id = ?frame.request_id, "dispatching client event");

    let request_id = frame.request_id.as_deref();
    if let Err(error) = dispatch(lifecycle, conn, frame.command, request_id) {
        debug!(code = error.code(), error = %error, "client event failed");
        reply_error(lifecycle, conn, &error, request_id);
    }
}

fn dispatch(
    lifecycle: &LifecycleManager,
    conn: &ClientConnection,
    command: ClientCommand,
    request_id: Option<&str>,
) -> Result<(), RelayError> {
    match command {
        ClientCommand::StartSharing(payload) => lifecycle.start_sharing(conn, payload, request_id).map(drop),
        ClientCommand::Join(target) => lifecycle.join_session(conn, &target.session_id, request_id),
        ClientCommand::LocationUpdate(payload) => lifecycle.report_location(conn, &payload),
        ClientCommand::Stop(target) => lifecycle.stop_sharing(conn, &target.session_id).map(drop),
        ClientCommand::RegisterDeviceToken(payload) => lifecycle.register_device_token(conn, payload.device_token),
    }
}

fn reply_error(lifecycle: &LifecycleManager, conn: &ClientConnection, error: &RelayError, request_id: Option<&str>) {
    counter!(RELAY_ERRORS_TOTAL, "code" => error.code()).increment(1);
    let _ = lifecycle.router().reply(conn, &RelayEvent::error(error), request_id);
}
