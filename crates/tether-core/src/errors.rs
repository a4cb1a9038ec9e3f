//! Relay error taxonomy and wire codes.
//!
//! Every failure a client can observe maps to exactly one [`RelayError`]
//! variant and one stable SCREAMING_SNAKE code. Errors travel back to the
//! originating connection as an `error` event; they never terminate the
//! connection or touch other sessions.

// ── Error code constants ────────────────────────────────────────────

/// Caller is not allowed to perform the operation.
pub const UNAUTHORIZED: &str = "UNAUTHORIZED";
/// Session does not exist (or was reclaimed).
pub const NOT_FOUND: &str = "NOT_FOUND";
/// Session passed its expiry.
pub const EXPIRED: &str = "EXPIRED";
/// Session was stopped or ended by its sharer.
pub const ALREADY_ENDED: &str = "ALREADY_ENDED";
/// Participant list empty or malformed.
pub const INVALID_PARTICIPANTS: &str = "INVALID_PARTICIPANTS";
/// Requested share duration is zero or above the configured cap.
pub const INVALID_DURATION: &str = "INVALID_DURATION";
/// Same connection registered twice.
pub const DUPLICATE_CONNECTION: &str = "DUPLICATE_CONNECTION";
/// Operation requires a registered, online connection.
pub const NOT_ONLINE: &str = "NOT_ONLINE";
/// Frame or field could not be parsed.
pub const INVALID_PAYLOAD: &str = "INVALID_PAYLOAD";
/// Frame `type` is not a known client event.
pub const UNKNOWN_EVENT: &str = "UNKNOWN_EVENT";
/// Transport failed while delivering.
pub const TRANSPORT_ERROR: &str = "TRANSPORT_ERROR";
/// Push notification could not be delivered.
pub const FALLBACK_DELIVERY_FAILED: &str = "FALLBACK_DELIVERY_FAILED";

/// Errors produced by relay operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    /// Requester is neither allowed nor entitled.
    #[error("{message}")]
    Unauthorized {
        /// What was refused.
        message: String,
    },

    /// Unknown session id.
    #[error("session not found: {session_id}")]
    NotFound {
        /// The id that was looked up.
        session_id: String,
    },

    /// Session is past `expiresAt`.
    #[error("session expired: {session_id}")]
    Expired {
        /// Session that expired.
        session_id: String,
    },

    /// Session already ended by stop or disconnect.
    #[error("session already ended: {session_id}")]
    AlreadyEnded {
        /// Session that ended.
        session_id: String,
    },

    /// No usable participants.
    #[error("{message}")]
    InvalidParticipants {
        /// Description.
        message: String,
    },

    /// Duration is zero or exceeds the cap.
    #[error("invalid duration {duration_ms}ms (max {max_ms}ms)")]
    InvalidDuration {
        /// Requested duration.
        duration_ms: u64,
        /// Configured maximum.
        max_ms: u64,
    },

    /// Connection id already present in the registry.
    #[error("connection already registered: {connection_id}")]
    DuplicateConnection {
        /// Offending connection.
        connection_id: String,
    },

    /// Connection is not (or no longer) registered.
    #[error("connection is not online: {connection_id}")]
    NotOnline {
        /// Offending connection.
        connection_id: String,
    },

    /// Malformed frame or field.
    #[error("{message}")]
    InvalidPayload {
        /// Description.
        message: String,
    },

    /// Frame carried an event type the relay does not handle.
    #[error("unknown event type: {event_type}")]
    UnknownEvent {
        /// The `type` that was received.
        event_type: String,
    },

    /// Delivery channel failed.
    #[error("transport error: {message}")]
    Transport {
        /// Description.
        message: String,
    },

    /// Push provider rejected or timed out.
    #[error("fallback delivery failed: {message}")]
    FallbackDeliveryFailed {
        /// Description.
        message: String,
    },
}

impl RelayError {
    /// Machine-readable error code for this variant.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unauthorized { .. } => UNAUTHORIZED,
            Self::NotFound { .. } => NOT_FOUND,
            Self::Expired { .. } => EXPIRED,
            Self::AlreadyEnded { .. } => ALREADY_ENDED,
            Self::InvalidParticipants { .. } => INVALID_PARTICIPANTS,
            Self::InvalidDuration { .. } => INVALID_DURATION,
            Self::DuplicateConnection { .. } => DUPLICATE_CONNECTION,
            Self::NotOnline { .. } => NOT_ONLINE,
            Self::InvalidPayload { .. } => INVALID_PAYLOAD,
            Self::UnknownEvent { .. } => UNKNOWN_EVENT,
            Self::Transport { .. } => TRANSPORT_ERROR,
            Self::FallbackDeliveryFailed { .. } => FALLBACK_DELIVERY_FAILED,
        }
    }

    /// Shorthand for [`RelayError::Unauthorized`].
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized {
            message: message.into(),
        }
    }

    /// Shorthand for [`RelayError::InvalidPayload`].
    pub fn invalid_payload(message: impl Into<String>) -> Self {
        Self::InvalidPayload {
            message: message.into(),
        }
    }

    /// True for the terminal-session variants that should trigger a
    /// termination broadcast if one was not already sent.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Expired { .. } | Self::AlreadyEnded { .. })
    }
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, RelayError>;
