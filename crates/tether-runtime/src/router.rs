//! Outbound event fan-out.
//!
//! Each event is serialized once and queued on every live connection of
//! every target principal. Principals with no live connection may get a
//! fallback push instead, depending on the event:
//!
//! | event                    | offline recipient                                 |
//! |--------------------------|---------------------------------------------------|
//! | `live-location-started`  | push                                              |
//! | `live-location-ended`    | push                                              |
//! | `location-updated`       | push only to never-joined participants, once per  |
//! |                          | session per offline period (the invite counts)    |
//! | everything else          | dropped                                           |
//!
//! Pushes run as tracked background tasks bounded by a timeout, so a slow
//! provider never holds up live delivery.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use metrics::counter;
use tether_core::clock::Clock;
use tether_core::errors::RelayError;
use tether_core::events::RelayEvent;
use tether_core::ids::{ConnectionId, PrincipalId, SessionId};
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::connection::ClientConnection;
use crate::notifier::{FallbackError, FallbackNotifier, PushMessage};
use crate::registry::ConnectionRegistry;
use crate::session::LiveSession;

/// Lifetime queue-full drops after which a slow client is disconnected.
const MAX_TOTAL_DROPS: u64 = 100;

/// Who to leave out of a broadcast.
#[derive(Clone, Copy, Debug, Default)]
pub enum Exclude<'a> {
    /// Nobody.
    #[default]
    Nobody,
    /// Only this connection; the principal's other devices still receive.
    Connection(&'a ConnectionId),
}

impl Exclude<'_> {
    fn skips_connection(&self, connection: &ClientConnection) -> bool {
        matches!(self, Self::Connection(id) if *id == &connection.id)
    }
}

/// Offline handling for one delivery.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Fallback {
    Never,
    Always,
    /// At most one push per (session, principal) until the marks are cleared.
    RateLimited,
}

/// What happened to one principal's delivery.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RouteOutcome {
    /// Connections the frame was queued on.
    pub delivered: usize,
    /// A fallback push was started.
    pub pushed: bool,
}

/// Aggregate of a session broadcast.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Principals considered.
    pub recipients: usize,
    /// Connections the frame was queued on.
    pub delivered: usize,
    /// Fallback pushes started.
    pub pushed: usize,
}

impl BroadcastReport {
    fn add(&mut self, outcome: RouteOutcome) {
        self.recipients += 1;
        self.delivered += outcome.delivered;
        self.pushed += usize::from(outcome.pushed);
    }
}

/// Resolves recipients and delivers live or via fallback.
pub struct MessageRouter {
    registry: Arc<ConnectionRegistry>,
    notifier: Arc<dyn FallbackNotifier>,
    clock: Arc<dyn Clock>,
    fallback_marks: DashMap<SessionId, HashSet<PrincipalId>>,
    fallback_timeout: Duration,
    pending: TaskTracker,
}

impl MessageRouter {
    /// Create a router over the shared registry.
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        notifier: Arc<dyn FallbackNotifier>,
        clock: Arc<dyn Clock>,
        fallback_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            notifier,
            clock,
            fallback_marks: DashMap::new(),
            fallback_timeout,
            pending: TaskTracker::new(),
        }
    }

    /// Send a reply to exactly one connection, tagged with the request id.
    pub fn reply(&self, connection: &ClientConnection, event: &RelayEvent, request_id: Option<&str>) -> bool {
        let sent = connection.send_event(event, self.clock.now_ms(), request_id);
        if sent {
            counter!("relay_events_routed_total", "event" => event.event_type()).increment(1);
        } else {
            self.note_failed_send(connection, event.event_type());
        }
        sent
    }

    /// Deliver to every live connection of `principal`; if it has none,
    /// push for `live-location-started` and `live-location-ended`.
    pub fn route_to_principal(&self, principal: &PrincipalId, event: &RelayEvent) -> RouteOutcome {
        let Some(frame) = self.serialize(event) else {
            return RouteOutcome::default();
        };
        let fallback = match event {
            RelayEvent::SharingStarted { .. } | RelayEvent::SessionEnded { .. } => Fallback::Always,
            _ => Fallback::Never,
        };
        self.deliver(principal, event, &frame, fallback, Exclude::Nobody)
    }

    /// Invite every participant of a freshly created session.
    pub fn invite(&self, session: &LiveSession, event: &RelayEvent) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        let Some(frame) = self.serialize(event) else {
            return report;
        };
        for participant in &session.participants {
            report.add(self.deliver(participant, event, &frame, Fallback::Always, Exclude::Nobody));
        }
        log_broadcast(session, event, report);
        report
    }

    /// Deliver to the sharer and every joined participant.
    ///
    /// For `location-updated`, participants that never joined and are
    /// offline get a rate-limited push; joined-but-offline participants get
    /// nothing for routine ticks. `live-location-ended` pushes to anyone
    /// offline.
    pub fn broadcast_to_session(&self, session: &LiveSession, event: &RelayEvent, exclude: Exclude<'_>) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        let Some(frame) = self.serialize(event) else {
            return report;
        };
        let audience_fallback = match event {
            RelayEvent::SessionEnded { .. } => Fallback::Always,
            _ => Fallback::Never,
        };

        let mut seen = HashSet::new();
        for principal in session.audience() {
            if !seen.insert(principal) {
                continue;
            }
            report.add(self.deliver(principal, event, &frame, audience_fallback, exclude));
        }

        // An ended snapshot must not start pushes or leave marks behind
        // after `forget_session`.
        if matches!(event, RelayEvent::LocationUpdated { .. }) && session.is_active() {
            for principal in session.participants.difference(session.joined()) {
                if self.registry.is_online(principal) {
                    continue;
                }
                report.add(self.deliver(principal, event, &frame, Fallback::RateLimited, exclude));
            }
        }

        log_broadcast(session, event, report);
        report
    }

    /// Forget rate-limit marks for a principal that just came online.
    pub fn clear_fallback_marks_for(&self, principal: &PrincipalId) {
        for mut marks in self.fallback_marks.iter_mut() {
            let _ = marks.remove(principal);
        }
        self.fallback_marks.retain(|_, marks| !marks.is_empty());
    }

    /// Drop all rate-limit state for an ended session.
    pub fn forget_session(&self, session_id: &SessionId) {
        let _ = self.fallback_marks.remove(session_id);
    }

    /// Whether `principal` has used its push for `session_id`.
    pub fn has_fallback_mark(&self, session_id: &SessionId, principal: &PrincipalId) -> bool {
        self.fallback_marks
            .get(session_id)
            .is_some_and(|marks| marks.contains(principal))
    }

    /// Fallback pushes still running.
    pub fn pending_pushes(&self) -> usize {
        self.pending.len()
    }

    /// Wait up to `timeout` for in-flight pushes. Returns `true` if all
    /// finished. New pushes may still be started afterwards.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let _ = self.pending.close();
        let drained = tokio::time::timeout(timeout, self.pending.wait()).await.is_ok();
        let _ = self.pending.reopen();
        if !drained {
            warn!(pending = self.pending.len(), "fallback pushes still running after drain timeout");
        }
        drained
    }

    fn serialize(&self, event: &RelayEvent) -> Option<Arc<String>> {
        match event.to_frame(self.clock.now_ms(), None) {
            Ok(json) => Some(Arc::new(json)),
            Err(e) => {
                warn!(event_type = event.event_type(), error = %e, "failed to serialize event");
                None
            }
        }
    }

    fn deliver(
        &self,
        principal: &PrincipalId,
        event: &RelayEvent,
        frame: &Arc<String>,
        fallback: Fallback,
        exclude: Exclude<'_>,
    ) -> RouteOutcome {
        let connections = self.registry.connections_for(principal);
        let mut outcome = RouteOutcome::default();

        if !connections.is_empty() {
            for conn in connections.iter().filter(|c| !exclude.skips_connection(c)) {
                if conn.send(Arc::clone(frame)) {
                    outcome.delivered += 1;
                } else {
                    self.note_failed_send(conn, event.event_type());
                }
            }
            if outcome.delivered > 0 {
                counter!("relay_events_routed_total", "event" => event.event_type())
                    .increment(outcome.delivered as u64);
            }
            return outcome;
        }

        let should_push = match fallback {
            Fallback::Never => false,
            Fallback::Always => {
                if let Some(session_id) = event.session_id() {
                    let _ = self
                        .fallback_marks
                        .entry(session_id.clone())
                        .or_default()
                        .insert(principal.clone());
                }
                true
            }
            Fallback::RateLimited => event.session_id().is_some_and(|session_id| {
                self.fallback_marks
                    .entry(session_id.clone())
                    .or_default()
                    .insert(principal.clone())
            }),
        };

        if should_push {
            if let Some(message) = PushMessage::for_event(event) {
                self.spawn_push(principal.clone(), message, event.event_type());
                outcome.pushed = true;
            }
        }
        outcome
    }

    fn spawn_push(&self, principal: PrincipalId, message: PushMessage, event_type: &'static str) {
        counter!("relay_fallback_pushes_total", "event" => event_type).increment(1);
        let notifier = Arc::clone(&self.notifier);
        let timeout = self.fallback_timeout;
        let _ = self.pending.spawn(async move {
            match push_within(notifier.as_ref(), &principal, &message, timeout).await {
                Ok(()) => debug!(principal = %principal, event_type, "fallback push sent"),
                Err(e) => {
                    counter!("relay_fallback_failures_total", "event" => event_type).increment(1);
                    warn!(principal = %principal, event_type, code = e.code(), error = %e, "fallback push failed");
                }
            }
        });
    }

    fn note_failed_send(&self, conn: &ClientConnection, event_type: &'static str) {
        if conn.is_closed() {
            return;
        }
        counter!("relay_delivery_drops_total").increment(1);
        let drops = conn.drop_count();
        if drops >= MAX_TOTAL_DROPS {
            warn!(conn_id = %conn.id, principal = %conn.principal, drops, "disconnecting slow client");
            conn.close();
        } else {
            warn!(conn_id = %conn.id, event_type, total_drops = drops, "failed to queue event (channel full)");
        }
    }
}

/// One push attempt bounded by `timeout`. Failures never touch session
/// state; they surface as [`RelayError::FallbackDeliveryFailed`].
async fn push_within(
    notifier: &dyn FallbackNotifier,
    principal: &PrincipalId,
    message: &PushMessage,
    timeout: Duration,
) -> Result<(), RelayError> {
    match tokio::time::timeout(timeout, notifier.notify(principal, message)).await {
        Ok(result) => result.map_err(RelayError::from),
        Err(_) => Err(FallbackError::TimedOut {
            after_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }
        .into()),
    }
}

fn log_broadcast(session: &LiveSession, event: &RelayEvent, report: BroadcastReport) {
    debug!(
        session_id = %session.id,
        event_type = event.event_type(),
        recipients = report.recipients,
        delivered = report.delivered,
        pushed = report.pushed,
        "broadcast event"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use crate::store::SessionStore;
    use crate::testing::RecordingNotifier;
    use tether_core::clock::ManualClock;
    use tether_core::events::EndReason;
    use tether_core::geo::Position;
    use tokio::sync::mpsc;

    struct Harness {
        registry: Arc<ConnectionRegistry>,
        notifier: Arc<RecordingNotifier>,
        router: MessageRouter,
        store: SessionStore,
    }

    fn harness() -> Harness {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let registry = Arc::new(ConnectionRegistry::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let router = MessageRouter::new(
            Arc::clone(&registry),
            notifier.clone(),
            clock.clone(),
            Duration::from_secs(1),
        );
        let store = SessionStore::new(clock, 86_400_000, 60_000);
        Harness {
            registry,
            notifier,
            router,
            store,
        }
    }

    fn connect(h: &Harness, principal: &str) -> (Arc<ClientConnection>, mpsc::Receiver<Arc<String>>) {
        let (tx, rx) = mpsc::channel(16);
        let conn = Arc::new(ClientConnection::new(ConnectionId::new(), PrincipalId::from(principal), tx));
        let _ = h.registry.register(Arc::clone(&conn)).unwrap();
        (conn, rx)
    }

    fn p(id: &str) -> PrincipalId {
        PrincipalId::from(id)
    }

    fn types(rx: &mut mpsc::Receiver<Arc<String>>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            let v: serde_json::Value = serde_json::from_str(&msg).unwrap();
            out.push(v["type"].as_str().unwrap().to_string());
        }
        out
    }

    fn invite_event(session: &LiveSession) -> RelayEvent {
        RelayEvent::SharingStarted {
            session_id: session.id.clone(),
            sharer_id: session.sharer.clone(),
            duration_ms: session.duration_ms,
            expires_at: String::new(),
        }
    }

    fn tick(session: &LiveSession, ts: i64) -> RelayEvent {
        let pos = Position {
            latitude: 1.0,
            longitude: 2.0,
            timestamp: ts,
            accuracy: None,
        };
        RelayEvent::location_updated(session.id.clone(), session.sharer.clone(), &pos)
    }

    #[tokio::test]
    async fn route_to_online_principal_reaches_every_device() {
        let h = harness();
        let (_a, mut ra) = connect(&h, "P1");
        let (_b, mut rb) = connect(&h, "P1");
        let event = RelayEvent::error(&tether_core::errors::RelayError::unauthorized("x"));

        let outcome = h.router.route_to_principal(&p("P1"), &event);
        assert_eq!(outcome.delivered, 2);
        assert!(!outcome.pushed);
        assert_eq!(types(&mut ra), vec!["error"]);
        assert_eq!(types(&mut rb), vec!["error"]);
    }

    #[tokio::test]
    async fn offline_invite_pushes_once_and_marks() {
        let h = harness();
        let (_p1, mut r1) = connect(&h, "P1");
        let session = h.store.create(&p("S"), vec![p("P1"), p("P2")], 60_000).unwrap();

        let report = h.router.invite(&session, &invite_event(&session));
        assert_eq!(report.recipients, 2);
        assert_eq!(report.delivered, 1);
        assert_eq!(report.pushed, 1);
        assert_eq!(types(&mut r1), vec!["live-location-started"]);

        assert!(h.router.drain(Duration::from_secs(1)).await);
        let pushes = h.notifier.sent_to("P2");
        assert_eq!(pushes.len(), 1);
        assert_eq!(pushes[0].data["type"], "live-location-request");
        assert!(h.router.has_fallback_mark(&session.id, &p("P2")));
    }

    #[tokio::test]
    async fn ticks_reach_sharer_devices_and_joined_only() {
        let h = harness();
        let (s1, mut rs1) = connect(&h, "S");
        let (_s2, mut rs2) = connect(&h, "S");
        let (_p1, mut r1) = connect(&h, "P1");
        let (_p2, mut r2) = connect(&h, "P2");
        let session = h.store.create(&p("S"), vec![p("P1"), p("P2")], 60_000).unwrap();
        let session = h.store.mark_joined(&session.id, &p("P1")).unwrap().session;

        let report = h.router.broadcast_to_session(&session, &tick(&session, 1), Exclude::Connection(&s1.id));
        assert_eq!(report.delivered, 2);
        assert_eq!(report.pushed, 0);
        assert!(types(&mut rs1).is_empty());
        assert_eq!(types(&mut rs2), vec!["location-updated"]);
        assert_eq!(types(&mut r1), vec!["location-updated"]);
        assert!(types(&mut r2).is_empty());
    }

    #[tokio::test]
    async fn never_joined_offline_participant_is_rate_limited() {
        let h = harness();
        let session = h.store.create(&p("S"), vec![p("P2")], 60_000).unwrap();

        let first = h.router.broadcast_to_session(&session, &tick(&session, 1), Exclude::Nobody);
        let second = h.router.broadcast_to_session(&session, &tick(&session, 2), Exclude::Nobody);
        assert_eq!(first.pushed + second.pushed, 1);

        assert!(h.router.drain(Duration::from_secs(1)).await);
        assert_eq!(h.notifier.sent_to("P2").len(), 1);
    }

    #[tokio::test]
    async fn invite_push_consumes_the_tick_allowance() {
        let h = harness();
        let session = h.store.create(&p("S"), vec![p("P2")], 60_000).unwrap();
        let _ = h.router.invite(&session, &invite_event(&session));
        let report = h.router.broadcast_to_session(&session, &tick(&session, 1), Exclude::Nobody);
        assert_eq!(report.pushed, 0);
        assert!(h.router.drain(Duration::from_secs(1)).await);
        assert_eq!(h.notifier.sent_to("P2").len(), 1);
    }

    #[tokio::test]
    async fn cleared_marks_allow_another_push() {
        let h = harness();
        let session = h.store.create(&p("S"), vec![p("P2")], 60_000).unwrap();
        let _ = h.router.broadcast_to_session(&session, &tick(&session, 1), Exclude::Nobody);
        h.router.clear_fallback_marks_for(&p("P2"));
        assert!(!h.router.has_fallback_mark(&session.id, &p("P2")));
        let report = h.router.broadcast_to_session(&session, &tick(&session, 2), Exclude::Nobody);
        assert_eq!(report.pushed, 1);
    }

    #[tokio::test]
    async fn joined_offline_participant_gets_no_tick_push() {
        let h = harness();
        let session = h.store.create(&p("S"), vec![p("P1")], 60_000).unwrap();
        let session = h.store.mark_joined(&session.id, &p("P1")).unwrap().session;
        let report = h.router.broadcast_to_session(&session, &tick(&session, 1), Exclude::Nobody);
        assert_eq!(report.pushed, 0);
        assert!(h.router.drain(Duration::from_secs(1)).await);
        assert!(h.notifier.sent().is_empty());
    }

    #[tokio::test]
    async fn ended_pushes_to_offline_joined_and_skips_excluded() {
        let h = harness();
        let (s1, mut rs1) = connect(&h, "S");
        let session = h.store.create(&p("S"), vec![p("P1"), p("P2")], 60_000).unwrap();
        let session = h.store.mark_joined(&session.id, &p("P1")).unwrap().session;
        let ended = RelayEvent::SessionEnded {
            session_id: session.id.clone(),
            sharer_id: p("S"),
            reason: EndReason::SharerDisconnected,
        };
        let report = h.router.broadcast_to_session(&session, &ended, Exclude::Connection(&s1.id));
        assert_eq!(report.recipients, 2);
        assert_eq!(report.delivered, 0);
        assert_eq!(report.pushed, 1);
        assert!(types(&mut rs1).is_empty());
        assert!(h.router.drain(Duration::from_secs(1)).await);
        assert_eq!(h.notifier.sent_to("P1").len(), 1);
        assert!(h.notifier.sent_to("S").is_empty());
        assert!(h.notifier.sent_to("P2").is_empty());
    }

    #[tokio::test]
    async fn failed_push_is_swallowed() {
        let h = harness();
        h.notifier.fail_with(FallbackError::Transport { message: "down".into() });
        let outcome = h.router.route_to_principal(
            &p("P9"),
            &RelayEvent::SessionEnded {
                session_id: SessionId::from("s"),
                sharer_id: p("S"),
                reason: EndReason::Stopped,
            },
        );
        assert!(outcome.pushed);
        assert!(h.router.drain(Duration::from_secs(1)).await);
        assert_eq!(h.notifier.sent().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_push_is_bounded_by_timeout() {
        let h = harness();
        h.notifier.delay(Duration::from_secs(30));
        let _ = h.router.route_to_principal(
            &p("P9"),
            &RelayEvent::SessionEnded {
                session_id: SessionId::from("s"),
                sharer_id: p("S"),
                reason: EndReason::Stopped,
            },
        );
        assert_eq!(h.router.pending_pushes(), 1);
        assert!(h.router.drain(Duration::from_secs(5)).await);
        assert_eq!(h.router.pending_pushes(), 0);
        assert!(h.notifier.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_push_surfaces_as_fallback_failure() {
        let notifier = RecordingNotifier::new();
        notifier.delay(Duration::from_secs(30));
        let message = PushMessage::for_event(&RelayEvent::SessionEnded {
            session_id: SessionId::from("s"),
            sharer_id: p("S"),
            reason: EndReason::Stopped,
        })
        .unwrap();

        let err = push_within(&notifier, &p("P9"), &message, Duration::from_millis(250))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tether_core::errors::FALLBACK_DELIVERY_FAILED);
        assert!(err.to_string().contains("timed out after 250ms"), "{err}");
    }

    #[tokio::test]
    async fn rejected_push_surfaces_as_fallback_failure() {
        let notifier = RecordingNotifier::new();
        notifier.fail_with(FallbackError::Rejected {
            status: 410,
            reason: "Unregistered".into(),
        });
        let message = PushMessage::for_event(&RelayEvent::SessionEnded {
            session_id: SessionId::from("s"),
            sharer_id: p("S"),
            reason: EndReason::Stopped,
        })
        .unwrap();

        assert_matches!(
            push_within(&notifier, &p("P9"), &message, Duration::from_secs(1)).await,
            Err(RelayError::FallbackDeliveryFailed { .. })
        );
        assert_matches!(push_within(&RecordingNotifier::new(), &p("P9"), &message, Duration::from_secs(1)).await, Ok(()));
    }

    #[tokio::test]
    async fn ended_snapshot_starts_no_tick_push() {
        let h = harness();
        let session = h.store.create(&p("S"), vec![p("P2")], 60_000).unwrap();
        let ended = h.store.end(&session.id, &p("S"), EndReason::Stopped).unwrap().session;
        h.router.forget_session(&ended.id);

        let report = h.router.broadcast_to_session(&ended, &tick(&ended, 1), Exclude::Nobody);
        assert_eq!(report.pushed, 0);
        assert!(!h.router.has_fallback_mark(&ended.id, &p("P2")));
        assert!(h.router.drain(Duration::from_secs(1)).await);
        assert!(h.notifier.sent().is_empty());
    }

    #[tokio::test]
    async fn forget_session_drops_marks() {
        let h = harness();
        let session = h.store.create(&p("S"), vec![p("P2")], 60_000).unwrap();
        let _ = h.router.invite(&session, &invite_event(&session));
        h.router.forget_session(&session.id);
        assert!(!h.router.has_fallback_mark(&session.id, &p("P2")));
    }

    #[tokio::test]
    async fn slow_client_is_closed_after_drop_limit() {
        let h = harness();
        let (tx, _rx) = mpsc::channel(1);
        let conn = Arc::new(ClientConnection::new(ConnectionId::new(), p("P1"), tx));
        let _ = h.registry.register(Arc::clone(&conn)).unwrap();
        let event = RelayEvent::error(&tether_core::errors::RelayError::unauthorized("x"));

        for _ in 0..=MAX_TOTAL_DROPS {
            let _ = h.router.route_to_principal(&p("P1"), &event);
        }
        assert!(conn.is_closed());
    }
}
