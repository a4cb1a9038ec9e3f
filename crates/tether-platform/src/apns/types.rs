//! APNs request and result types.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Notification to send via APNs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApnsNotification {
    /// Alert title.
    pub title: String,
    /// Alert body.
    pub body: String,
    /// Custom data fields, placed at the payload root.
    #[serde(default)]
    pub data: HashMap<String, String>,
    /// Priority: "high" (10) or "normal" (5).
    #[serde(default = "default_priority")]
    pub priority: String,
    /// Sound name (e.g., "default").
    pub sound: Option<String>,
    /// Thread id for grouping; the relay uses the session id.
    pub thread_id: Option<String>,
}

fn default_priority() -> String {
    "high".to_string()
}

/// Result of sending a single notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApnsSendResult {
    /// Whether the send succeeded.
    pub success: bool,
    /// APNs-assigned notification id (on success).
    pub apns_id: Option<String>,
    /// HTTP status code, absent on transport failure.
    pub status_code: Option<u16>,
    /// Error reason from APNs (e.g. `Unregistered`, `BadDeviceToken`).
    pub reason: Option<String>,
    /// Error message.
    pub error: Option<String>,
}

impl ApnsSendResult {
    /// Whether APNs says the device token is no longer valid.
    pub fn token_is_dead(&self) -> bool {
        self.status_code == Some(410) || matches!(self.reason.as_deref(), Some("Unregistered" | "BadDeviceToken"))
    }
}
