//! Session lifecycle state machine.
//!
//! ```text
//! active --(stop | expire | sharer-disconnect)--> ended
//! ```
//!
//! `ended` is terminal. Every transition goes through [`SessionStore`],
//! which reports whether the caller made the transition; only that caller
//! announces the end, so `live-location-ended` goes out exactly once per
//! session no matter how stop, sweep, and disconnect race.
//!
//! Operations send their own success replies so ordering on the requesting
//! connection is fixed (e.g. join confirmation before the catch-up position).
//! Failures are returned; the transport turns them into `error` replies.

use std::sync::Arc;

use metrics::{counter, gauge};
use tether_core::clock::{Clock, format_rfc3339};
use tether_core::errors::RelayError;
use tether_core::events::{EndReason, LocationUpdatePayload, RelayEvent, StartSharingPayload};
use tether_core::ids::{PrincipalId, SessionId};
use tracing::{debug, info, instrument, warn};

use crate::config::RelayConfig;
use crate::connection::ClientConnection;
use crate::notifier::{DeviceTokenRegistry, FallbackNotifier};
use crate::registry::{ConnectionRegistry, RegisterOutcome};
use crate::router::{Exclude, MessageRouter};
use crate::session::{LiveSession, SessionSummary};
use crate::store::SessionStore;

/// What a "stop" did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopOutcome {
    /// Sharer ended the session (or it was already ended).
    Ended {
        /// This call made the transition.
        transitioned: bool,
    },
    /// A participant left; the session is unchanged.
    Left,
}

/// Result of one sweep tick.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Sessions newly ended as expired.
    pub expired: Vec<SessionId>,
    /// Ended records reclaimed.
    pub reaped: usize,
}

/// Owns the relay components and drives session transitions.
pub struct LifecycleManager {
    registry: Arc<ConnectionRegistry>,
    store: Arc<SessionStore>,
    router: Arc<MessageRouter>,
    tokens: Arc<DeviceTokenRegistry>,
    config: RelayConfig,
}

impl LifecycleManager {
    /// Wire a fresh registry, store, and router together.
    pub fn new(
        config: RelayConfig,
        clock: Arc<dyn Clock>,
        notifier: Arc<dyn FallbackNotifier>,
        tokens: Arc<DeviceTokenRegistry>,
    ) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let store = Arc::new(SessionStore::new(
            Arc::clone(&clock),
            config.max_duration_ms,
            config.ended_retention_ms(),
        ));
        let router = Arc::new(MessageRouter::new(
            Arc::clone(&registry),
            notifier,
            clock,
            config.fallback_timeout,
        ));
        Self {
            registry,
            store,
            router,
            tokens,
            config,
        }
    }

    /// Connection registry.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Session store.
    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    /// Message router.
    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    /// Device token registry.
    pub fn tokens(&self) -> &Arc<DeviceTokenRegistry> {
        &self.tokens
    }

    /// Active configuration.
    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    // ── Connections ─────────────────────────────────────────────────

    /// Register a freshly authenticated connection.
    ///
    /// Sends `connection-established`, then the current position of every
    /// session the principal is receiving. Missed ticks are not replayed.
    #[instrument(skip_all, fields(conn_id = %conn.id, principal = %conn.principal))]
    pub fn handle_connect(&self, conn: &Arc<ClientConnection>) -> Result<RegisterOutcome, RelayError> {
        let outcome = self.registry.register(Arc::clone(conn))?;
        let _ = self.router.reply(
            conn,
            &RelayEvent::ConnectionEstablished {
                connection_id: conn.id.clone(),
                principal_id: conn.principal.clone(),
            },
            None,
        );

        if outcome.came_online {
            self.router.clear_fallback_marks_for(&conn.principal);
        }

        let mut resumed = 0usize;
        for session in self.store.resumable_for(&conn.principal) {
            if let Some(position) = &session.last_position {
                let event = RelayEvent::location_updated(session.id.clone(), session.sharer.clone(), position);
                resumed += usize::from(self.router.reply(conn, &event, None));
            }
        }
        debug!(came_online = outcome.came_online, resumed, "connection attached");
        Ok(outcome)
    }

    /// Tear down a connection and end every active session its principal
    /// shares. A session already past its expiry ends as `expired`; the rest
    /// end as `sharer-disconnected`. The sharer's other devices are told too.
    ///
    /// Viewers disconnecting never end a session and stay joined.
    #[instrument(skip_all, fields(conn_id = %conn.id, principal = %conn.principal))]
    pub fn handle_disconnect(&self, conn: &ClientConnection) -> Vec<SessionId> {
        let outcome = self.registry.unregister(conn);
        let principal = &conn.principal;
        let mut ended = Vec::new();
        for session_id in self.store.active_shared_by(principal) {
            let end = match self.store.expire(&session_id) {
                Ok(end) if end.transitioned => Ok(end),
                _ => self.store.end(&session_id, principal, EndReason::SharerDisconnected),
            };
            match end {
                Ok(end) if end.transitioned => {
                    self.announce_end(&end.session, Exclude::Connection(&conn.id));
                    ended.push(session_id);
                }
                Ok(_) => {}
                Err(e) => warn!(session_id = %session_id, error = %e, "failed to end session on disconnect"),
            }
        }
        if !ended.is_empty() {
            info!(
                sessions = ended.len(),
                went_offline = outcome.went_offline,
                "sharer connection closed, sessions ended"
            );
        }
        ended
    }

    // ── Client operations ───────────────────────────────────────────

    /// Start a share from `conn`'s principal and invite the participants.
    pub fn start_sharing(
        &self,
        conn: &ClientConnection,
        payload: StartSharingPayload,
        request_id: Option<&str>,
    ) -> Result<LiveSession, RelayError> {
        self.ensure_online(conn)?;
        let duration_ms = payload.duration_ms.unwrap_or(self.config.default_duration_ms);
        let session = self
            .store
            .create(&conn.principal, payload.friend_principal_ids, duration_ms)?;
        let expires_at = format_rfc3339(session.expires_at_ms);

        let _ = self.router.reply(
            conn,
            &RelayEvent::SessionCreated {
                session_id: session.id.clone(),
                recipients: session.participants.len(),
                expires_at: expires_at.clone(),
            },
            request_id,
        );
        let report = self.router.invite(
            &session,
            &RelayEvent::SharingStarted {
                session_id: session.id.clone(),
                sharer_id: session.sharer.clone(),
                duration_ms: session.duration_ms,
                expires_at,
            },
        );

        counter!("relay_sessions_started_total").increment(1);
        gauge!("relay_sessions_active").increment(1.0);
        info!(
            session_id = %session.id,
            sharer = %session.sharer,
            participants = session.participants.len(),
            duration_ms = session.duration_ms,
            delivered = report.delivered,
            pushed = report.pushed,
            "live location started"
        );
        Ok(session)
    }

    /// Join `session_id` as a viewer.
    ///
    /// Replies `joined-live-location`, tells the sharer on first join, and
    /// sends the last known position if there is one.
    pub fn join_session(
        &self,
        conn: &ClientConnection,
        session_id: &SessionId,
        request_id: Option<&str>,
    ) -> Result<(), RelayError> {
        let joined = match self.store.mark_joined(session_id, &conn.principal) {
            Ok(joined) => joined,
            Err(e) => return Err(self.on_terminal_error(session_id, e)),
        };
        let session = &joined.session;

        let _ = self.router.reply(
            conn,
            &RelayEvent::Joined {
                session_id: session.id.clone(),
                sharer_id: session.sharer.clone(),
            },
            request_id,
        );

        if joined.newly_joined {
            let _ = self.router.route_to_principal(
                &session.sharer,
                &RelayEvent::ParticipantJoined {
                    session_id: session.id.clone(),
                    principal_id: conn.principal.clone(),
                },
            );
            info!(session_id = %session.id, principal = %conn.principal, "participant joined");
        }

        if let Some(position) = &session.last_position {
            let event = RelayEvent::location_updated(session.id.clone(), session.sharer.clone(), position);
            let _ = self.router.reply(conn, &event, None);
        }
        Ok(())
    }

    /// Apply a sharer's position tick and fan it out.
    ///
    /// The sharer's other devices receive it too; the reporting device does
    /// not get an echo.
    pub fn report_location(&self, conn: &ClientConnection, payload: &LocationUpdatePayload) -> Result<(), RelayError> {
        let position = payload.position(self.store.now_ms());
        position.validate()?;

        let relayed = self
            .store
            .update_position(&payload.session_id, position, &conn.principal, |session| {
                let event = RelayEvent::location_updated(session.id.clone(), session.sharer.clone(), &position);
                self.router
                    .broadcast_to_session(session, &event, Exclude::Connection(&conn.id))
            });
        let report = match relayed {
            Ok(report) => report,
            Err(e) => return Err(self.on_terminal_error(&payload.session_id, e)),
        };

        counter!("relay_location_updates_total").increment(1);
        debug!(
            session_id = %payload.session_id,
            delivered = report.delivered,
            pushed = report.pushed,
            "location update relayed"
        );
        Ok(())
    }

    /// Stop sharing (sharer) or leave (participant).
    ///
    /// A participant's stop leaves the session untouched. Anyone else is
    /// refused.
    pub fn stop_sharing(&self, conn: &ClientConnection, session_id: &SessionId) -> Result<StopOutcome, RelayError> {
        let session = self.store.get(session_id)?;
        if session.sharer != conn.principal {
            if session.participants.contains(&conn.principal) {
                debug!(session_id = %session_id, principal = %conn.principal, "participant left");
                return Ok(StopOutcome::Left);
            }
            return Err(RelayError::unauthorized(format!(
                "{} is not part of session {session_id}",
                conn.principal
            )));
        }

        let end = self.store.end(session_id, &conn.principal, EndReason::Stopped)?;
        if end.transitioned {
            self.announce_end(&end.session, Exclude::Nobody);
        }
        Ok(StopOutcome::Ended {
            transitioned: end.transitioned,
        })
    }

    /// Remember the push token for `conn`'s principal.
    pub fn register_device_token(&self, conn: &ClientConnection, token: String) -> Result<(), RelayError> {
        if token.trim().is_empty() {
            return Err(RelayError::invalid_payload("deviceToken must not be empty"));
        }
        self.tokens.register(conn.principal.clone(), token);
        Ok(())
    }

    /// Active sessions `principal` shares or was invited to.
    pub fn active_sessions_for(&self, principal: &PrincipalId) -> Vec<SessionSummary> {
        self.store.active_for(principal)
    }

    // ── Expiry ──────────────────────────────────────────────────────

    /// End every expired session, announce each once, then reclaim ended
    /// records past retention.
    pub fn sweep(&self) -> SweepReport {
        let expired = self.store.sweep_expired();
        let mut report = SweepReport {
            expired: Vec::with_capacity(expired.len()),
            reaped: 0,
        };
        for session in &expired {
            self.announce_end(session, Exclude::Nobody);
            report.expired.push(session.id.clone());
        }
        report.reaped = self.store.reap_ended();
        if !report.expired.is_empty() || report.reaped > 0 {
            info!(expired = report.expired.len(), reaped = report.reaped, "session sweep");
        }
        report
    }

    // ── Internals ───────────────────────────────────────────────────

    fn ensure_online(&self, conn: &ClientConnection) -> Result<(), RelayError> {
        if conn.is_closed() || !self.registry.contains(conn) {
            return Err(RelayError::NotOnline {
                connection_id: conn.id.to_string(),
            });
        }
        Ok(())
    }

    /// A terminal error may be the first observer of a lapsed session; end
    /// it here rather than waiting for the sweep. Already-ended sessions were
    /// announced by whoever ended them, so `expire` is a no-op for those.
    fn on_terminal_error(&self, session_id: &SessionId, err: RelayError) -> RelayError {
        if err.is_terminal() {
            match self.store.expire(session_id) {
                Ok(end) if end.transitioned => self.announce_end(&end.session, Exclude::Nobody),
                Ok(_) => {}
                Err(e) => debug!(session_id = %session_id, error = %e, "expire after failed operation"),
            }
        }
        err
    }

    fn announce_end(&self, session: &LiveSession, exclude: Exclude<'_>) {
        let reason = session.end_reason().unwrap_or(EndReason::Stopped);
        let report = self.router.broadcast_to_session(
            session,
            &RelayEvent::SessionEnded {
                session_id: session.id.clone(),
                sharer_id: session.sharer.clone(),
                reason,
            },
            exclude,
        );
        self.router.forget_session(&session.id);

        counter!("relay_sessions_ended_total", "reason" => reason.as_str()).increment(1);
        gauge!("relay_sessions_active").decrement(1.0);
        info!(
            session_id = %session.id,
            sharer = %session.sharer,
            reason = reason.as_str(),
            delivered = report.delivered,
            pushed = report.pushed,
            "live location ended"
        );
    }
}
