//! Wire events exchanged over a relay connection.
//!
//! Every WebSocket text frame carries one JSON object.
//!
//! Client → relay:
//!
//! ```json
//! {"type": "location-update", "id": "r-7", "data": {"sessionId": "...", "latitude": 1.0, "longitude": 2.0}}
//! ```
//!
//! Relay → client:
//!
//! ```json
//! {"type": "location-updated", "timestamp": "2025-01-01T00:00:00.000Z", "requestId": "r-7", "data": {...}}
//! ```
//!
//! `id` is optional and echoed back as `requestId` on every reply produced
//! while handling that frame (including `error`).

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::clock::format_rfc3339;
use crate::errors::RelayError;
use crate::geo::Position;
use crate::ids::{ConnectionId, PrincipalId, SessionId};

/// Share duration used when a client does not send one (one hour).
pub const DEFAULT_DURATION_MS: u64 = 3_600_000;

// ── Inbound ─────────────────────────────────────────────────────────

/// Client event names.
pub mod names {
    /// Start a new share.
    pub const START_LIVE_LOCATION: &str = "start-live-location";
    /// Join a session as a viewer.
    pub const JOIN_LIVE_LOCATION: &str = "join-live-location";
    /// Sharer position tick.
    pub const LOCATION_UPDATE: &str = "location-update";
    /// Stop (sharer) or leave (participant).
    pub const STOP_LIVE_LOCATION: &str = "stop-live-location";
    /// Register a push token for fallback delivery.
    pub const REGISTER_DEVICE_TOKEN: &str = "register-device-token";
}

#[derive(Debug, Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    data: Value,
}

/// `start-live-location` payload.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartSharingPayload {
    /// Principals to invite. A bare string is accepted as a single invitee.
    #[serde(alias = "friendPhoneNumbers", deserialize_with = "one_or_many")]
    pub friend_principal_ids: Vec<PrincipalId>,
    /// Share length; [`DEFAULT_DURATION_MS`] when absent.
    #[serde(default, alias = "duration")]
    pub duration_ms: Option<u64>,
}

/// Payload carrying only a session id (`join` and `stop`).
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRef {
    /// Target session.
    pub session_id: SessionId,
}

/// `location-update` payload.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationUpdatePayload {
    /// Session the tick belongs to.
    pub session_id: SessionId,
    /// Degrees.
    pub latitude: f64,
    /// Degrees.
    pub longitude: f64,
    /// Producer time; the relay clock is used when absent.
    #[serde(default)]
    pub timestamp: Option<i64>,
    /// Meters.
    #[serde(default)]
    pub accuracy: Option<f64>,
}

impl LocationUpdatePayload {
    /// Build the stored position, stamping `now_ms` if the client sent no time.
    pub fn position(&self, now_ms: i64) -> Position {
        Position {
            latitude: self.latitude,
            longitude: self.longitude,
            timestamp: self.timestamp.unwrap_or(now_ms),
            accuracy: self.accuracy,
        }
    }
}

/// `register-device-token` payload.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceTokenPayload {
    /// Opaque push token issued to the device.
    #[serde(alias = "token")]
    pub device_token: String,
}

/// A parsed client command.
#[derive(Clone, Debug, PartialEq)]
pub enum ClientCommand {
    /// `start-live-location`
    StartSharing(StartSharingPayload),
    /// `join-live-location`
    Join(SessionRef),
    /// `location-update`
    LocationUpdate(LocationUpdatePayload),
    /// `stop-live-location`
    Stop(SessionRef),
    /// `register-device-token`
    RegisterDeviceToken(DeviceTokenPayload),
}

impl ClientCommand {
    /// Wire name, for logs and metric labels.
    pub fn name(&self) -> &'static str {
        match self {
            Self::StartSharing(_) => names::START_LIVE_LOCATION,
            Self::Join(_) => names::JOIN_LIVE_LOCATION,
            Self::LocationUpdate(_) => names::LOCATION_UPDATE,
            Self::Stop(_) => names::STOP_LIVE_LOCATION,
            Self::RegisterDeviceToken(_) => names::REGISTER_DEVICE_TOKEN,
        }
    }
}

/// A client frame with its optional correlation id.
#[derive(Clone, Debug, PartialEq)]
pub struct InboundFrame {
    /// Echoed back as `requestId`.
    pub request_id: Option<String>,
    /// The command itself.
    pub command: ClientCommand,
}

/// A frame that could not be turned into a command.
#[derive(Clone, Debug, PartialEq)]
pub struct FrameError {
    /// Correlation id, if the envelope got far enough to carry one.
    pub request_id: Option<String>,
    /// What went wrong.
    pub error: RelayError,
}

impl InboundFrame {
    /// Parse one text frame.
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        let raw: RawFrame = serde_json::from_str(text).map_err(|e| FrameError {
            request_id: None,
            error: RelayError::invalid_payload(format!("invalid frame: {e}")),
        })?;
        let request_id = raw.id;
        let fail = |error: RelayError| FrameError {
            request_id: request_id.clone(),
            error,
        };

        let command = match raw.event_type.as_str() {
            names::START_LIVE_LOCATION => ClientCommand::StartSharing(payload(raw.data).map_err(fail)?),
            names::JOIN_LIVE_LOCATION => ClientCommand::Join(payload(raw.data).map_err(fail)?),
            names::LOCATION_UPDATE => ClientCommand::LocationUpdate(payload(raw.data).map_err(fail)?),
            names::STOP_LIVE_LOCATION => ClientCommand::Stop(payload(raw.data).map_err(fail)?),
            names::REGISTER_DEVICE_TOKEN => {
                ClientCommand::RegisterDeviceToken(payload(raw.data).map_err(fail)?)
            }
            other => {
                return Err(fail(RelayError::UnknownEvent {
                    event_type: other.to_owned(),
                }));
            }
        };

        Ok(Self {
            request_id,
            command,
        })
    }
}

fn payload<T: for<'de> Deserialize<'de>>(data: Value) -> Result<T, RelayError> {
    serde_json::from_value(data).map_err(|e| RelayError::invalid_payload(format!("invalid data: {e}")))
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<PrincipalId>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(PrincipalId),
        Many(Vec<PrincipalId>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(id) => vec![id],
        OneOrMany::Many(ids) => ids,
    })
}

// ── Outbound ────────────────────────────────────────────────────────

/// Why a session ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EndReason {
    /// Sharer sent `stop-live-location`.
    Stopped,
    /// `expiresAt` passed.
    Expired,
    /// Sharer's last connection closed.
    SharerDisconnected,
}

impl EndReason {
    /// Wire spelling.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Expired => "expired",
            Self::SharerDisconnected => "sharer-disconnected",
        }
    }
}

/// Events the relay sends to clients.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(
    tag = "type",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum RelayEvent {
    /// First frame on every accepted connection.
    ConnectionEstablished {
        /// Id assigned to this connection.
        connection_id: ConnectionId,
        /// Authenticated principal.
        principal_id: PrincipalId,
    },

    /// Confirmation to the sharer's originating connection.
    #[serde(rename = "live-location-session-created")]
    SessionCreated {
        /// New session.
        session_id: SessionId,
        /// Number of invited participants.
        recipients: usize,
        /// RFC 3339 expiry.
        expires_at: String,
    },

    /// Invite delivered to each participant.
    #[serde(rename = "live-location-started")]
    SharingStarted {
        /// Session being offered.
        session_id: SessionId,
        /// Who is sharing.
        sharer_id: PrincipalId,
        /// Total share length.
        duration_ms: u64,
        /// RFC 3339 expiry.
        expires_at: String,
    },

    /// Join confirmation to the joining connection.
    #[serde(rename = "joined-live-location")]
    Joined {
        /// Joined session.
        session_id: SessionId,
        /// Who is sharing.
        sharer_id: PrincipalId,
    },

    /// Tells the sharer a participant joined.
    ParticipantJoined {
        /// Session joined.
        session_id: SessionId,
        /// Who joined.
        principal_id: PrincipalId,
    },

    /// A position fix.
    LocationUpdated {
        /// Session.
        session_id: SessionId,
        /// Whose position this is.
        sharer_id: PrincipalId,
        /// Degrees.
        latitude: f64,
        /// Degrees.
        longitude: f64,
        /// Producer time, Unix ms.
        timestamp: i64,
        /// Meters.
        #[serde(skip_serializing_if = "Option::is_none")]
        accuracy: Option<f64>,
    },

    /// Session terminated.
    #[serde(rename = "live-location-ended")]
    SessionEnded {
        /// Ended session.
        session_id: SessionId,
        /// Who was sharing.
        sharer_id: PrincipalId,
        /// Why.
        reason: EndReason,
    },

    /// Failure reply to the originating connection.
    Error {
        /// Stable code from [`crate::errors`].
        code: String,
        /// Human-readable description.
        message: String,
    },
}

impl RelayEvent {
    /// Build a `location-updated` event from a stored position.
    pub fn location_updated(session_id: SessionId, sharer_id: PrincipalId, position: &Position) -> Self {
        Self::LocationUpdated {
            session_id,
            sharer_id,
            latitude: position.latitude,
            longitude: position.longitude,
            timestamp: position.timestamp,
            accuracy: position.accuracy,
        }
    }

    /// Build an `error` event.
    pub fn error(err: &RelayError) -> Self {
        Self::Error {
            code: err.code().to_owned(),
            message: err.to_string(),
        }
    }

    /// Wire name, for logs and metric labels.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::ConnectionEstablished { .. } => "connection-established",
            Self::SessionCreated { .. } => "live-location-session-created",
            Self::SharingStarted { .. } => "live-location-started",
            Self::Joined { .. } => "joined-live-location",
            Self::ParticipantJoined { .. } => "participant-joined",
            Self::LocationUpdated { .. } => "location-updated",
            Self::SessionEnded { .. } => "live-location-ended",
            Self::Error { .. } => "error",
        }
    }

    /// Session this event concerns, if any.
    pub fn session_id(&self) -> Option<&SessionId> {
        match self {
            Self::SessionCreated { session_id, .. }
            | Self::SharingStarted { session_id, .. }
            | Self::Joined { session_id, .. }
            | Self::ParticipantJoined { session_id, .. }
            | Self::LocationUpdated { session_id, .. }
            | Self::SessionEnded { session_id, .. } => Some(session_id),
            Self::ConnectionEstablished { .. } | Self::Error { .. } => None,
        }
    }

    /// Serialize into the outbound envelope.
    pub fn to_frame(&self, timestamp_ms: i64, request_id: Option<&str>) -> Result<String, serde_json::Error> {
        serde_json::to_string(&OutboundFrame {
            event: self,
            timestamp: format_rfc3339(timestamp_ms),
            request_id,
        })
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct OutboundFrame<'a> {
    #[serde(flatten)]
    event: &'a RelayEvent,
    timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    request_id: Option<&'a str>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    #[test]
    fn parse_start_with_legacy_field_names() {
        let text = r#"{"type":"start-live-location","id":"r1","data":{"friendPhoneNumbers":["+1","+2"],"duration":60000}}"#;
        let frame = InboundFrame::parse(text).unwrap();
        assert_eq!(frame.request_id.as_deref(), Some("r1"));
        assert_matches!(frame.command, ClientCommand::StartSharing(p) => {
            assert_eq!(p.friend_principal_ids, vec![PrincipalId::from("+1"), PrincipalId::from("+2")]);
            assert_eq!(p.duration_ms, Some(60_000));
        });
    }

    #[test]
    fn parse_start_single_invitee_and_default_duration() {
        let text = r#"{"type":"start-live-location","data":{"friendPrincipalIds":"+1"}}"#;
        let frame = InboundFrame::parse(text).unwrap();
        assert!(frame.request_id.is_none());
        assert_matches!(frame.command, ClientCommand::StartSharing(p) => {
            assert_eq!(p.friend_principal_ids, vec![PrincipalId::from("+1")]);
            assert_eq!(p.duration_ms, None);
        });
    }

    #[test]
    fn parse_location_update() {
        let text = r#"{"type":"location-update","data":{"sessionId":"s1","latitude":1.5,"longitude":-2.5,"timestamp":99,"accuracy":5.0}}"#;
        let frame = InboundFrame::parse(text).unwrap();
        assert_matches!(frame.command, ClientCommand::LocationUpdate(p) => {
            assert_eq!(p.session_id, SessionId::from("s1"));
            let pos = p.position(1234);
            assert_eq!(pos.timestamp, 99);
            assert_eq!(pos.accuracy, Some(5.0));
        });
    }

    #[test]
    fn missing_timestamp_uses_server_time() {
        let text = r#"{"type":"location-update","data":{"sessionId":"s1","latitude":1.0,"longitude":2.0}}"#;
        let frame = InboundFrame::parse(text).unwrap();
        assert_matches!(frame.command, ClientCommand::LocationUpdate(p) => {
            assert_eq!(p.position(1234).timestamp, 1234);
        });
    }

    #[test]
    fn parse_join_stop_and_token() {
        let join = InboundFrame::parse(r#"{"type":"join-live-location","data":{"sessionId":"s1"}}"#).unwrap();
        assert_eq!(join.command.name(), names::JOIN_LIVE_LOCATION);
        let stop = InboundFrame::parse(r#"{"type":"stop-live-location","data":{"sessionId":"s1"}}"#).unwrap();
        assert_matches!(stop.command, ClientCommand::Stop(r) if r.session_id.as_str() == "s1");
        let token = InboundFrame::parse(r#"{"type":"register-device-token","data":{"token":"abc"}}"#).unwrap();
        assert_matches!(token.command, ClientCommand::RegisterDeviceToken(t) if t.device_token == "abc");
    }

    #[test]
    fn malformed_json_has_no_request_id() {
        let err = InboundFrame::parse("not json").unwrap_err();
        assert!(err.request_id.is_none());
        assert_eq!(err.error.code(), "INVALID_PAYLOAD");
    }

    #[test]
    fn bad_data_keeps_request_id() {
        let err = InboundFrame::parse(r#"{"type":"join-live-location","id":"r9","data":{}}"#).unwrap_err();
        assert_eq!(err.request_id.as_deref(), Some("r9"));
        assert_matches!(err.error, RelayError::InvalidPayload { .. });
    }

    #[test]
    fn unknown_event_type() {
        let err = InboundFrame::parse(r#"{"type":"teleport","id":"x","data":{}}"#).unwrap_err();
        assert_matches!(err.error, RelayError::UnknownEvent { ref event_type } if event_type == "teleport");
    }

    #[test]
    fn outbound_envelope_shape() {
        let event = RelayEvent::SessionCreated {
            session_id: SessionId::from("s1"),
            recipients: 2,
            expires_at: "2025-01-01T00:00:00.000Z".into(),
        };
        let text = event.to_frame(0, Some("r1")).unwrap();
        let v: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(v["type"], "live-location-session-created");
        assert_eq!(v["timestamp"], "1970-01-01T00:00:00.000Z");
        assert_eq!(v["requestId"], "r1");
        assert_eq!(v["data"], json!({"sessionId": "s1", "recipients": 2, "expiresAt": "2025-01-01T00:00:00.000Z"}));
    }

    #[test]
    fn request_id_omitted_when_absent() {
        let event = RelayEvent::Joined {
            session_id: SessionId::from("s1"),
            sharer_id: PrincipalId::from("+1"),
        };
        let v: Value = serde_json::from_str(&event.to_frame(0, None).unwrap()).unwrap();
        assert!(v.get("requestId").is_none());
        assert_eq!(v["type"], "joined-live-location");
        assert_eq!(v["data"]["sharerId"], "+1");
    }

    #[test]
    fn location_updated_fields() {
        let pos = Position {
            latitude: 1.0,
            longitude: 2.0,
            timestamp: 5,
            accuracy: None,
        };
        let event = RelayEvent::location_updated(SessionId::from("s1"), PrincipalId::from("+1"), &pos);
        let v: Value = serde_json::from_str(&event.to_frame(0, None).unwrap()).unwrap();
        assert_eq!(v["type"], "location-updated");
        assert_eq!(v["data"]["latitude"], 1.0);
        assert_eq!(v["data"]["timestamp"], 5);
        assert!(v["data"].get("accuracy").is_none());
    }

    #[test]
    fn ended_reason_spelling() {
        let event = RelayEvent::SessionEnded {
            session_id: SessionId::from("s1"),
            sharer_id: PrincipalId::from("+1"),
            reason: EndReason::SharerDisconnected,
        };
        let v = serde_json::to_value(&event).unwrap();
        assert_eq!(v["type"], "live-location-ended");
        assert_eq!(v["data"]["reason"], "sharer-disconnected");
        assert_eq!(EndReason::SharerDisconnected.as_str(), "sharer-disconnected");
    }

    #[test]
    fn event_type_matches_serialized_tag() {
        let events = [
            RelayEvent::ConnectionEstablished {
                connection_id: ConnectionId::from("c"),
                principal_id: PrincipalId::from("p"),
            },
            RelayEvent::ParticipantJoined {
                session_id: SessionId::from("s"),
                principal_id: PrincipalId::from("p"),
            },
            RelayEvent::error(&RelayError::unauthorized("no")),
        ];
        for event in events {
            let v = serde_json::to_value(&event).unwrap();
            assert_eq!(v["type"], event.event_type());
        }
    }

    #[test]
    fn error_event_carries_code() {
        let event = RelayEvent::error(&RelayError::NotFound { session_id: "s".into() });
        let v = serde_json::to_value(&event).unwrap();
        assert_eq!(v["data"]["code"], "NOT_FOUND");
        assert_eq!(v["data"]["message"], "session not found: s");
    }
}
