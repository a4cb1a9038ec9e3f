//! Fallback push seam.
//!
//! When a principal has no live connection the router hands the event to a
//! [`FallbackNotifier`]. The relay owns the push texts and the device-token
//! map; the notifier only knows how to reach one device.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tether_core::errors::RelayError;
use tether_core::events::RelayEvent;
use tether_core::ids::PrincipalId;
use tracing::{debug, info};

/// Errors from a push attempt.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FallbackError {
    /// The principal never registered a device token.
    #[error("no device token registered for {principal}")]
    NoDeviceToken {
        /// Target principal.
        principal: String,
    },

    /// Provider refused the push.
    #[error("push rejected ({status}): {reason}")]
    Rejected {
        /// HTTP status from the provider.
        status: u16,
        /// Provider's reason string.
        reason: String,
    },

    /// Could not reach the provider.
    #[error("push transport error: {message}")]
    Transport {
        /// Description.
        message: String,
    },

    /// The attempt exceeded the configured bound.
    #[error("push timed out after {after_ms}ms")]
    TimedOut {
        /// Configured bound.
        after_ms: u64,
    },
}

impl From<FallbackError> for RelayError {
    fn from(err: FallbackError) -> Self {
        Self::FallbackDeliveryFailed {
            message: err.to_string(),
        }
    }
}

/// A user-visible push notification.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PushMessage {
    /// Alert title.
    pub title: String,
    /// Alert body.
    pub body: String,
    /// Custom payload the app uses to route the tap.
    pub data: HashMap<String, String>,
}

impl PushMessage {
    /// Push text for a relay event, or `None` for events that never push.
    pub fn for_event(event: &RelayEvent) -> Option<Self> {
        let (title, body, kind, session_id, sharer_id, extra) = match event {
            RelayEvent::SharingStarted {
                session_id,
                sharer_id,
                ..
            } => (
                "📍 Live Location Request",
                format!("{sharer_id} wants to share their live location with you"),
                "live-location-request",
                session_id,
                sharer_id,
                None,
            ),
            RelayEvent::LocationUpdated {
                session_id,
                sharer_id,
                ..
            } => (
                "📍 Location Update",
                format!("{sharer_id} location updated"),
                "live-location-update",
                session_id,
                sharer_id,
                None,
            ),
            RelayEvent::SessionEnded {
                session_id,
                sharer_id,
                reason,
            } => (
                "📍 Live Location Ended",
                format!("{sharer_id} is no longer sharing their live location"),
                "live-location-ended",
                session_id,
                sharer_id,
                Some(("reason", reason.as_str())),
            ),
            _ => return None,
        };

        let mut data = HashMap::from([
            ("type".to_string(), kind.to_string()),
            ("sessionId".to_string(), session_id.to_string()),
            ("sharerId".to_string(), sharer_id.to_string()),
        ]);
        if let Some((key, value)) = extra {
            let _ = data.insert(key.to_string(), value.to_string());
        }

        Some(Self {
            title: title.to_string(),
            body,
            data,
        })
    }
}

/// Delivers a push to a principal's registered device.
#[async_trait]
pub trait FallbackNotifier: Send + Sync {
    /// Attempt one push.
    async fn notify(&self, principal: &PrincipalId, message: &PushMessage) -> Result<(), FallbackError>;
}

/// Principal → device push token.
///
/// One token per principal; registering again replaces it.
#[derive(Default)]
pub struct DeviceTokenRegistry {
    tokens: DashMap<PrincipalId, String>,
}

impl DeviceTokenRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store (or replace) the principal's token.
    pub fn register(&self, principal: PrincipalId, token: String) {
        debug!(principal = %principal, token_len = token.len(), "device token registered");
        let _ = self.tokens.insert(principal, token);
    }

    /// Current token for the principal.
    pub fn token_for(&self, principal: &PrincipalId) -> Option<String> {
        self.tokens.get(principal).map(|t| t.value().clone())
    }

    /// Remove the principal's token if it is still `token`.
    ///
    /// Used when the provider reports a token as unregistered; a newer token
    /// registered in the meantime is kept.
    pub fn remove_if_matches(&self, principal: &PrincipalId, token: &str) -> bool {
        self.tokens.remove_if(principal, |_, current| current == token).is_some()
    }

    /// Number of registered tokens.
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Whether no tokens are registered.
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

/// Notifier used when no push credentials are configured: logs the push it
/// would have sent.
pub struct LogNotifier {
    tokens: Arc<DeviceTokenRegistry>,
}

impl LogNotifier {
    /// Create a logging notifier over the shared token registry.
    pub fn new(tokens: Arc<DeviceTokenRegistry>) -> Self {
        Self { tokens }
    }
}

#[async_trait]
impl FallbackNotifier for LogNotifier {
    async fn notify(&self, principal: &PrincipalId, message: &PushMessage) -> Result<(), FallbackError> {
        if self.tokens.token_for(principal).is_none() {
            return Err(FallbackError::NoDeviceToken {
                principal: principal.to_string(),
            });
        }
        info!(
            principal = %principal,
            title = %message.title,
            body = %message.body,
            kind = message.data.get("type").map_or("", String::as_str),
            "push notification (log only)"
        );
        Ok(())
    }
}
