//! Live-location session record.

use std::collections::BTreeSet;

use serde::Serialize;
use tether_core::events::EndReason;
use tether_core::geo::Position;
use tether_core::ids::{PrincipalId, SessionId};

/// Whether a session still accepts joins and updates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Accepting joins and position updates.
    Active,
    /// Terminal.
    Ended {
        /// When it ended, Unix ms.
        at_ms: i64,
        /// Why it ended.
        reason: EndReason,
    },
}

/// One sharer streaming position to a fixed set of invited participants.
///
/// `joined ⊆ participants` always holds; [`LiveSession::mark_joined`] is the
/// only way a principal enters `joined`.
#[derive(Clone, Debug, PartialEq)]
pub struct LiveSession {
    /// Session id.
    pub id: SessionId,
    /// Who is sharing. Never reassigned.
    pub sharer: PrincipalId,
    /// Invited principals, fixed at creation.
    pub participants: BTreeSet<PrincipalId>,
    /// Participants that have joined.
    joined: BTreeSet<PrincipalId>,
    /// Latest position, last write wins.
    pub last_position: Option<Position>,
    /// Creation time, Unix ms.
    pub started_at_ms: i64,
    /// Requested share length.
    pub duration_ms: u64,
    /// `started_at_ms + duration_ms`; the session is invalid at or after it.
    pub expires_at_ms: i64,
    /// Current state.
    pub state: SessionState,
}

impl LiveSession {
    pub(crate) fn new(
        sharer: PrincipalId,
        participants: BTreeSet<PrincipalId>,
        started_at_ms: i64,
        duration_ms: u64,
    ) -> Self {
        let duration = i64::try_from(duration_ms).unwrap_or(i64::MAX);
        Self {
            id: SessionId::new(),
            sharer,
            participants,
            joined: BTreeSet::new(),
            last_position: None,
            started_at_ms,
            duration_ms,
            expires_at_ms: started_at_ms.saturating_add(duration),
            state: SessionState::Active,
        }
    }

    /// Participants that have joined.
    pub fn joined(&self) -> &BTreeSet<PrincipalId> {
        &self.joined
    }

    /// Add a participant to `joined`. Returns `true` on first join.
    /// Non-participants are ignored so the subset invariant cannot break.
    pub(crate) fn mark_joined(&mut self, principal: &PrincipalId) -> bool {
        self.participants.contains(principal) && self.joined.insert(principal.clone())
    }

    /// Whether the session is still active.
    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }

    /// Whether `now_ms` is at or past expiry.
    pub fn is_past_expiry(&self, now_ms: i64) -> bool {
        now_ms >= self.expires_at_ms
    }

    /// Why the session ended, if it has.
    pub fn end_reason(&self) -> Option<EndReason> {
        match self.state {
            SessionState::Active => None,
            SessionState::Ended { reason, .. } => Some(reason),
        }
    }

    /// When the session ended, if it has.
    pub fn ended_at_ms(&self) -> Option<i64> {
        match self.state {
            SessionState::Active => None,
            SessionState::Ended { at_ms, .. } => Some(at_ms),
        }
    }

    pub(crate) fn end(&mut self, now_ms: i64, reason: EndReason) -> bool {
        if self.is_active() {
            self.state = SessionState::Ended { at_ms: now_ms, reason };
            true
        } else {
            false
        }
    }

    /// Whether the principal is the sharer or an invited participant.
    pub fn involves(&self, principal: &PrincipalId) -> bool {
        &self.sharer == principal || self.participants.contains(principal)
    }

    /// Principals that receive position ticks: sharer plus joined participants.
    pub fn audience(&self) -> impl Iterator<Item = &PrincipalId> {
        std::iter::once(&self.sharer).chain(self.joined.iter())
    }

    /// Milliseconds until expiry, floored at zero.
    pub fn remaining_ms(&self, now_ms: i64) -> u64 {
        u64::try_from(self.expires_at_ms.saturating_sub(now_ms)).unwrap_or(0)
    }

    /// View of this session from `viewer`'s side.
    pub fn summary_for(&self, viewer: &PrincipalId, now_ms: i64) -> SessionSummary {
        SessionSummary {
            session_id: self.id.clone(),
            sharer_id: self.sharer.clone(),
            friend_principal_ids: self.participants.iter().cloned().collect(),
            start_time: self.started_at_ms,
            duration_ms: self.duration_ms,
            remaining_time: self.remaining_ms(now_ms),
            is_sharer: &self.sharer == viewer,
            is_recipient: self.participants.contains(viewer),
        }
    }
}

/// Active-session listing entry for one principal.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    /// Session id.
    pub session_id: SessionId,
    /// Who is sharing.
    pub sharer_id: PrincipalId,
    /// Invited principals.
    pub friend_principal_ids: Vec<PrincipalId>,
    /// Creation time, Unix ms.
    pub start_time: i64,
    /// Total share length.
    pub duration_ms: u64,
    /// Milliseconds left.
    pub remaining_time: u64,
    /// Viewer is the sharer.
    pub is_sharer: bool,
    /// Viewer is an invited participant.
    pub is_recipient: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> LiveSession {
        let participants = [PrincipalId::from("+2"), PrincipalId::from("+3")].into_iter().collect();
        LiveSession::new(PrincipalId::from("+1"), participants, 1_000, 60_000)
    }

    #[test]
    fn new_session_is_active_with_expiry() {
        let s = session();
        assert!(s.is_active());
        assert_eq!(s.expires_at_ms, 61_000);
        assert!(s.joined().is_empty());
        assert!(s.last_position.is_none());
    }

    #[test]
    fn expiry_boundary_is_inclusive() {
        let s = session();
        assert!(!s.is_past_expiry(60_999));
        assert!(s.is_past_expiry(61_000));
    }

    #[test]
    fn non_participant_never_enters_joined() {
        let mut s = session();
        assert!(!s.mark_joined(&PrincipalId::from("+9")));
        assert!(!s.mark_joined(&PrincipalId::from("+1")));
        assert!(s.joined().is_empty());
    }

    #[test]
    fn rejoin_reports_false() {
        let mut s = session();
        assert!(s.mark_joined(&PrincipalId::from("+2")));
        assert!(!s.mark_joined(&PrincipalId::from("+2")));
        assert_eq!(s.joined().len(), 1);
    }

    #[test]
    fn end_transitions_once() {
        let mut s = session();
        assert!(s.end(5_000, EndReason::Stopped));
        assert!(!s.end(6_000, EndReason::Expired));
        assert_eq!(s.end_reason(), Some(EndReason::Stopped));
        assert_eq!(s.ended_at_ms(), Some(5_000));
    }

    #[test]
    fn audience_is_sharer_plus_joined() {
        let mut s = session();
        let _ = s.mark_joined(&PrincipalId::from("+3"));
        let audience: Vec<_> = s.audience().map(PrincipalId::as_str).collect();
        assert_eq!(audience, vec!["+1", "+3"]);
    }

    #[test]
    fn remaining_floors_at_zero() {
        let s = session();
        assert_eq!(s.remaining_ms(1_000), 60_000);
        assert_eq!(s.remaining_ms(100_000), 0);
    }

    #[test]
    fn summary_flags_viewer_role() {
        let s = session();
        let sharer_view = s.summary_for(&PrincipalId::from("+1"), 2_000);
        assert!(sharer_view.is_sharer);
        assert!(!sharer_view.is_recipient);
        assert_eq!(sharer_view.remaining_time, 59_000);

        let viewer = s.summary_for(&PrincipalId::from("+2"), 2_000);
        assert!(!viewer.is_sharer);
        assert!(viewer.is_recipient);

        let json = serde_json::to_value(&viewer).unwrap();
        assert_eq!(json["friendPrincipalIds"], serde_json::json!(["+2", "+3"]));
        assert_eq!(json["remainingTime"], 59_000);
    }
}
