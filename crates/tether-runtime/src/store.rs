//! Session store: sharded map of sessions, one lock per session.
//!
//! Every mutation of a session happens under that session's own mutex and
//! never awaits, so operations on different sessions never contend beyond a
//! shard lookup. The store only mutates and reports; it never delivers.

use std::collections::BTreeSet;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tether_core::clock::Clock;
use tether_core::errors::RelayError;
use tether_core::events::EndReason;
use tether_core::geo::Position;
use tether_core::ids::{PrincipalId, SessionId};
use tracing::debug;

use crate::session::{LiveSession, SessionSummary};

/// Result of ending a session.
#[derive(Clone, Debug, PartialEq)]
pub struct EndOutcome {
    /// Session after the call.
    pub session: LiveSession,
    /// This call moved it from active to ended. Exactly one caller sees
    /// `true` per session; only that caller broadcasts termination.
    pub transitioned: bool,
}

/// Result of a join.
#[derive(Clone, Debug, PartialEq)]
pub struct JoinOutcome {
    /// Session after the join.
    pub session: LiveSession,
    /// First join by this principal.
    pub newly_joined: bool,
}

/// In-memory session records.
pub struct SessionStore {
    sessions: DashMap<SessionId, Arc<Mutex<LiveSession>>>,
    clock: Arc<dyn Clock>,
    max_duration_ms: u64,
    ended_retention_ms: u64,
}

impl SessionStore {
    /// Create an empty store.
    pub fn new(clock: Arc<dyn Clock>, max_duration_ms: u64, ended_retention_ms: u64) -> Self {
        Self {
            sessions: DashMap::new(),
            clock,
            max_duration_ms,
            ended_retention_ms,
        }
    }

    /// Current time from the injected clock.
    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    /// Create an active session.
    ///
    /// Duplicate participants collapse; the sharer is dropped from its own
    /// participant list.
    pub fn create(
        &self,
        sharer: &PrincipalId,
        participants: Vec<PrincipalId>,
        duration_ms: u64,
    ) -> Result<LiveSession, RelayError> {
        if duration_ms == 0 || duration_ms > self.max_duration_ms {
            return Err(RelayError::InvalidDuration {
                duration_ms,
                max_ms: self.max_duration_ms,
            });
        }
        if participants.iter().any(PrincipalId::is_blank) {
            return Err(RelayError::InvalidParticipants {
                message: "participant ids must not be blank".into(),
            });
        }
        let participants: BTreeSet<PrincipalId> =
            participants.into_iter().filter(|p| p != sharer).collect();
        if participants.is_empty() {
            return Err(RelayError::InvalidParticipants {
                message: "at least one participant other than the sharer is required".into(),
            });
        }

        let session = LiveSession::new(sharer.clone(), participants, self.now_ms(), duration_ms);
        let _ = self
            .sessions
            .insert(session.id.clone(), Arc::new(Mutex::new(session.clone())));
        debug!(session_id = %session.id, sharer = %sharer, participants = session.participants.len(), "session created");
        Ok(session)
    }

    fn slot(&self, id: &SessionId) -> Result<Arc<Mutex<LiveSession>>, RelayError> {
        self.sessions
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| RelayError::NotFound {
                session_id: id.to_string(),
            })
    }

    /// Snapshot of a session.
    pub fn get(&self, id: &SessionId) -> Result<LiveSession, RelayError> {
        Ok(self.slot(id)?.lock().clone())
    }

    /// Add `principal` to the session's joined set. Re-join succeeds as a no-op.
    ///
    /// Checked in order: unknown id, not invited, ended, past expiry.
    pub fn mark_joined(&self, id: &SessionId, principal: &PrincipalId) -> Result<JoinOutcome, RelayError> {
        let slot = self.slot(id)?;
        let now = self.now_ms();
        let mut session = slot.lock();

        if !session.involves(principal) {
            return Err(RelayError::unauthorized(format!(
                "{principal} was not invited to session {id}"
            )));
        }
        ensure_live(&session, now)?;

        let newly_joined = session.mark_joined(principal);
        Ok(JoinOutcome {
            session: session.clone(),
            newly_joined,
        })
    }

    /// Overwrite the last known position, then run `relay` on the updated
    /// session before its lock is released. Only the sharer may update.
    ///
    /// An end cannot land between the update and whatever `relay` sends, so
    /// no tick follows the end notice. `relay` must not call back into the
    /// store.
    pub fn update_position<R>(
        &self,
        id: &SessionId,
        position: Position,
        requester: &PrincipalId,
        relay: impl FnOnce(&LiveSession) -> R,
    ) -> Result<R, RelayError> {
        let slot = self.slot(id)?;
        let now = self.now_ms();
        let mut session = slot.lock();

        if &session.sharer != requester {
            return Err(RelayError::unauthorized(format!(
                "only the sharer may update session {id}"
            )));
        }
        ensure_live(&session, now)?;

        session.last_position = Some(position);
        Ok(relay(&session))
    }

    /// End a session on behalf of its sharer. Idempotent.
    pub fn end(&self, id: &SessionId, requester: &PrincipalId, reason: EndReason) -> Result<EndOutcome, RelayError> {
        let slot = self.slot(id)?;
        let now = self.now_ms();
        let mut session = slot.lock();

        if &session.sharer != requester {
            return Err(RelayError::unauthorized(format!(
                "only the sharer may end session {id}"
            )));
        }
        let transitioned = session.end(now, reason);
        if transitioned {
            debug!(session_id = %id, reason = reason.as_str(), "session ended");
        }
        Ok(EndOutcome {
            session: session.clone(),
            transitioned,
        })
    }

    /// End the session as expired if it is active and past `expiresAt`.
    pub fn expire(&self, id: &SessionId) -> Result<EndOutcome, RelayError> {
        let slot = self.slot(id)?;
        let now = self.now_ms();
        let mut session = slot.lock();

        let transitioned = session.is_past_expiry(now) && session.end(now, EndReason::Expired);
        if transitioned {
            debug!(session_id = %id, "session expired");
        }
        Ok(EndOutcome {
            session: session.clone(),
            transitioned,
        })
    }

    /// End every active session at or past expiry and return them.
    pub fn sweep_expired(&self) -> Vec<LiveSession> {
        let now = self.now_ms();
        let mut expired = Vec::new();
        for slot in self.slots() {
            let mut session = slot.lock();
            if session.is_past_expiry(now) && session.end(now, EndReason::Expired) {
                expired.push(session.clone());
            }
        }
        expired.sort_by(|a, b| a.id.cmp(&b.id));
        expired
    }

    /// Drop ended sessions whose retention has elapsed. Returns how many.
    pub fn reap_ended(&self) -> usize {
        let now = self.now_ms();
        let retention = i64::try_from(self.ended_retention_ms).unwrap_or(i64::MAX);
        let before = self.sessions.len();
        self.sessions.retain(|_, slot| {
            slot.lock()
                .ended_at_ms()
                .is_none_or(|ended| now.saturating_sub(ended) < retention)
        });
        before.saturating_sub(self.sessions.len())
    }

    /// Active sessions the principal shares or was invited to.
    pub fn active_for(&self, principal: &PrincipalId) -> Vec<SessionSummary> {
        let now = self.now_ms();
        let mut out: Vec<_> = self
            .slots()
            .into_iter()
            .filter_map(|slot| {
                let session = slot.lock();
                (session.is_active() && !session.is_past_expiry(now) && session.involves(principal))
                    .then(|| session.summary_for(principal, now))
            })
            .collect();
        out.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        out
    }

    /// Ids of active sessions the principal is sharing.
    pub fn active_shared_by(&self, principal: &PrincipalId) -> Vec<SessionId> {
        let mut out: Vec<_> = self
            .slots()
            .into_iter()
            .filter_map(|slot| {
                let session = slot.lock();
                (session.is_active() && &session.sharer == principal).then(|| session.id.clone())
            })
            .collect();
        out.sort();
        out
    }

    /// Unexpired active sessions whose position stream `principal` receives
    /// (as sharer or joined participant).
    pub fn resumable_for(&self, principal: &PrincipalId) -> Vec<LiveSession> {
        let now = self.now_ms();
        let mut out: Vec<_> = self
            .slots()
            .into_iter()
            .filter_map(|slot| {
                let session = slot.lock();
                let receives = &session.sharer == principal || session.joined().contains(principal);
                (session.is_active() && !session.is_past_expiry(now) && receives).then(|| session.clone())
            })
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Number of active sessions.
    pub fn active_count(&self) -> usize {
        self.slots().into_iter().filter(|slot| slot.lock().is_active()).count()
    }

    /// Number of stored records, active or ended.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether the store holds no records.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    // Clone the Arcs out so no shard lock is held while a session lock is taken.
    fn slots(&self) -> Vec<Arc<Mutex<LiveSession>>> {
        self.sessions.iter().map(|entry| Arc::clone(entry.value())).collect()
    }
}

fn ensure_live(session: &LiveSession, now_ms: i64) -> Result<(), RelayError> {
    let session_id = session.id.to_string();
    match session.end_reason() {
        Some(EndReason::Expired) => Err(RelayError::Expired { session_id }),
        Some(_) => Err(RelayError::AlreadyEnded { session_id }),
        None if session.is_past_expiry(now_ms) => Err(RelayError::Expired { session_id }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use tether_core::clock::ManualClock;

    const HOUR: u64 = 3_600_000;

    fn store() -> (SessionStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let store = SessionStore::new(clock.clone(), 24 * HOUR, 60_000);
        (store, clock)
    }

    fn p(id: &str) -> PrincipalId {
        PrincipalId::from(id)
    }

    fn pos(ts: i64) -> Position {
        Position {
            latitude: 10.0,
            longitude: 20.0,
            timestamp: ts,
            accuracy: None,
        }
    }

    fn share(store: &SessionStore) -> LiveSession {
        store.create(&p("S"), vec![p("P1"), p("P2")], HOUR).unwrap()
    }

    // ── create ──────────────────────────────────────────────────────

    #[test]
    fn create_sets_expiry_and_state() {
        let (store, _) = store();
        let s = share(&store);
        assert!(s.is_active());
        assert_eq!(s.expires_at_ms, 1_000_000 + 3_600_000);
        assert!(s.joined().is_empty());
        assert_eq!(store.get(&s.id).unwrap(), s);
    }

    #[test]
    fn create_with_no_participants_fails() {
        let (store, _) = store();
        assert_matches!(
            store.create(&p("S"), vec![], HOUR),
            Err(RelayError::InvalidParticipants { .. })
        );
        assert_matches!(
            store.create(&p("S"), vec![p("S")], HOUR),
            Err(RelayError::InvalidParticipants { .. })
        );
        assert!(store.is_empty());
    }

    #[test]
    fn create_with_blank_participant_fails() {
        let (store, _) = store();
        assert_matches!(
            store.create(&p("S"), vec![p("P1"), p(" ")], HOUR),
            Err(RelayError::InvalidParticipants { .. })
        );
    }

    #[test]
    fn create_collapses_duplicates() {
        let (store, _) = store();
        let s = store.create(&p("S"), vec![p("P1"), p("P1"), p("P2")], HOUR).unwrap();
        assert_eq!(s.participants.len(), 2);
    }

    #[test]
    fn create_rejects_bad_duration() {
        let (store, _) = store();
        assert_matches!(
            store.create(&p("S"), vec![p("P1")], 0),
            Err(RelayError::InvalidDuration { duration_ms: 0, .. })
        );
        assert_matches!(
            store.create(&p("S"), vec![p("P1")], 25 * HOUR),
            Err(RelayError::InvalidDuration { .. })
        );
    }

    #[test]
    fn get_unknown_is_not_found() {
        let (store, _) = store();
        assert_matches!(store.get(&SessionId::from("nope")), Err(RelayError::NotFound { .. }));
    }

    // ── mark_joined ─────────────────────────────────────────────────

    #[test]
    fn join_adds_participant_once() {
        let (store, _) = store();
        let s = share(&store);
        let first = store.mark_joined(&s.id, &p("P1")).unwrap();
        assert!(first.newly_joined);
        let again = store.mark_joined(&s.id, &p("P1")).unwrap();
        assert!(!again.newly_joined);
        assert_eq!(again.session.joined().len(), 1);
    }

    #[test]
    fn join_errors() {
        let (store, clock) = store();
        let s = share(&store);
        assert_matches!(
            store.mark_joined(&SessionId::from("nope"), &p("P1")),
            Err(RelayError::NotFound { .. })
        );
        assert_matches!(
            store.mark_joined(&s.id, &p("X")),
            Err(RelayError::Unauthorized { .. })
        );

        clock.advance(3_600_000);
        assert_matches!(store.mark_joined(&s.id, &p("P1")), Err(RelayError::Expired { .. }));
        assert!(store.get(&s.id).unwrap().joined().is_empty());
    }

    #[test]
    fn join_after_stop_is_already_ended() {
        let (store, _) = store();
        let s = share(&store);
        let _ = store.end(&s.id, &p("S"), EndReason::Stopped).unwrap();
        assert_matches!(
            store.mark_joined(&s.id, &p("P1")),
            Err(RelayError::AlreadyEnded { .. })
        );
    }

    #[test]
    fn join_after_sweep_is_expired() {
        let (store, clock) = store();
        let s = share(&store);
        clock.advance(3_600_000);
        assert_eq!(store.sweep_expired().len(), 1);
        assert_matches!(store.mark_joined(&s.id, &p("P2")), Err(RelayError::Expired { .. }));
    }

    #[test]
    fn sharer_join_is_noop() {
        let (store, _) = store();
        let s = share(&store);
        let outcome = store.mark_joined(&s.id, &p("S")).unwrap();
        assert!(!outcome.newly_joined);
        assert!(outcome.session.joined().is_empty());
    }

    // ── update_position ─────────────────────────────────────────────

    #[test]
    fn update_by_sharer_last_write_wins() {
        let (store, _) = store();
        let s = share(&store);
        store.update_position(&s.id, pos(2), &p("S"), |_| ()).unwrap();
        store.update_position(&s.id, pos(1), &p("S"), |_| ()).unwrap();
        assert_eq!(store.get(&s.id).unwrap().last_position, Some(pos(1)));
    }

    #[test]
    fn relay_sees_update_and_is_skipped_once_ended() {
        let (store, _) = store();
        let s = share(&store);
        let seen = store
            .update_position(&s.id, pos(7), &p("S"), |session| session.last_position)
            .unwrap();
        assert_eq!(seen, Some(pos(7)));

        let _ = store.end(&s.id, &p("S"), EndReason::Stopped).unwrap();
        let mut called = false;
        assert_matches!(
            store.update_position(&s.id, pos(8), &p("S"), |_| called = true),
            Err(RelayError::AlreadyEnded { .. })
        );
        assert!(!called);
        assert_eq!(store.get(&s.id).unwrap().last_position, Some(pos(7)));
    }

    #[test]
    fn update_by_non_sharer_is_unauthorized_without_mutation() {
        let (store, _) = store();
        let s = share(&store);
        let _ = store.mark_joined(&s.id, &p("P1")).unwrap();
        assert_matches!(
            store.update_position(&s.id, pos(1), &p("P1"), |_| ()),
            Err(RelayError::Unauthorized { .. })
        );
        assert!(store.get(&s.id).unwrap().last_position.is_none());
    }

    #[test]
    fn update_after_expiry_fails() {
        let (store, clock) = store();
        let s = share(&store);
        clock.advance(3_600_000);
        assert_matches!(
            store.update_position(&s.id, pos(1), &p("S"), |_| ()),
            Err(RelayError::Expired { .. })
        );
    }

    // ── end / expire / sweep ────────────────────────────────────────

    #[test]
    fn end_is_idempotent_and_reports_transition_once() {
        let (store, _) = store();
        let s = share(&store);
        let first = store.end(&s.id, &p("S"), EndReason::Stopped).unwrap();
        assert!(first.transitioned);
        let second = store.end(&s.id, &p("S"), EndReason::SharerDisconnected).unwrap();
        assert!(!second.transitioned);
        assert_eq!(second.session.end_reason(), Some(EndReason::Stopped));
    }

    #[test]
    fn end_by_non_sharer_is_unauthorized() {
        let (store, _) = store();
        let s = share(&store);
        assert_matches!(
            store.end(&s.id, &p("P1"), EndReason::Stopped),
            Err(RelayError::Unauthorized { .. })
        );
        assert!(store.get(&s.id).unwrap().is_active());
    }

    #[test]
    fn expire_only_after_deadline() {
        let (store, clock) = store();
        let s = share(&store);
        assert!(!store.expire(&s.id).unwrap().transitioned);
        clock.advance(3_600_000);
        assert!(store.expire(&s.id).unwrap().transitioned);
        assert!(!store.expire(&s.id).unwrap().transitioned);
    }

    #[test]
    fn sweep_ends_each_expired_session_once() {
        let (store, clock) = store();
        let short = store.create(&p("S"), vec![p("P1")], 1_000).unwrap();
        let long = share(&store);
        clock.advance(1_000);

        let swept = store.sweep_expired();
        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].id, short.id);
        assert_eq!(swept[0].end_reason(), Some(EndReason::Expired));
        assert!(store.sweep_expired().is_empty());
        assert!(store.get(&long.id).unwrap().is_active());
    }

    #[test]
    fn sweep_skips_stopped_sessions() {
        let (store, clock) = store();
        let s = share(&store);
        let _ = store.end(&s.id, &p("S"), EndReason::Stopped).unwrap();
        clock.advance(3_600_000);
        assert!(store.sweep_expired().is_empty());
    }

    #[tokio::test]
    async fn concurrent_sweep_and_stop_transition_once() {
        let (store, clock) = store();
        let store = Arc::new(store);
        let s = share(&store);
        clock.advance(3_600_000);

        let a = {
            let store = Arc::clone(&store);
            tokio::task::spawn_blocking(move || store.sweep_expired().len())
        };
        let b = {
            let store = Arc::clone(&store);
            let id = s.id.clone();
            tokio::task::spawn_blocking(move || usize::from(store.end(&id, &p("S"), EndReason::Stopped).unwrap().transitioned))
        };
        let total = a.await.unwrap() + b.await.unwrap();
        assert_eq!(total, 1);
    }

    #[test]
    fn reap_respects_retention() {
        let (store, clock) = store();
        let s = share(&store);
        let _active = share(&store);
        let _ = store.end(&s.id, &p("S"), EndReason::Stopped).unwrap();

        clock.advance(59_999);
        assert_eq!(store.reap_ended(), 0);
        clock.advance(1);
        assert_eq!(store.reap_ended(), 1);
        assert_matches!(store.get(&s.id), Err(RelayError::NotFound { .. }));
        assert_eq!(store.len(), 1);
    }

    // ── queries ─────────────────────────────────────────────────────

    #[test]
    fn active_for_lists_both_roles() {
        let (store, clock) = store();
        let s = share(&store);
        let other = store.create(&p("P1"), vec![p("Z")], HOUR).unwrap();
        clock.advance(1_000);

        let listed = store.active_for(&p("P1"));
        assert_eq!(listed.len(), 2);
        let as_viewer = listed.iter().find(|x| x.session_id == s.id).unwrap();
        assert!(as_viewer.is_recipient);
        assert_eq!(as_viewer.remaining_time, 3_599_000);
        let as_sharer = listed.iter().find(|x| x.session_id == other.id).unwrap();
        assert!(as_sharer.is_sharer);

        let _ = store.end(&s.id, &p("S"), EndReason::Stopped).unwrap();
        assert_eq!(store.active_for(&p("P1")).len(), 1);
        assert!(store.active_for(&p("nobody")).is_empty());
    }

    #[test]
    fn active_shared_by_and_count() {
        let (store, _) = store();
        let a = share(&store);
        let b = share(&store);
        let _ = store.create(&p("P1"), vec![p("S")], HOUR).unwrap();
        let mut expected = vec![a.id.clone(), b.id.clone()];
        expected.sort();
        assert_eq!(store.active_shared_by(&p("S")), expected);
        assert_eq!(store.active_count(), 3);
        let _ = store.end(&a.id, &p("S"), EndReason::Stopped).unwrap();
        assert_eq!(store.active_shared_by(&p("S")), vec![b.id]);
        assert_eq!(store.active_count(), 2);
    }

    #[test]
    fn resumable_requires_join() {
        let (store, _) = store();
        let s = share(&store);
        assert!(store.resumable_for(&p("P1")).is_empty());
        let _ = store.mark_joined(&s.id, &p("P1")).unwrap();
        assert_eq!(store.resumable_for(&p("P1")).len(), 1);
        assert_eq!(store.resumable_for(&p("S")).len(), 1);
        assert!(store.resumable_for(&p("P2")).is_empty());
    }
}
