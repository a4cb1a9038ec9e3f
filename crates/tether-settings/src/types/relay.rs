//! Session lifecycle, auth, and push settings.

use serde::{Deserialize, Serialize};

/// Session lifecycle tuning.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelaySettings {
    /// Share length when the client omits one.
    pub default_duration_ms: u64,
    /// Longest share a client may request.
    pub max_duration_ms: u64,
    /// How often expired sessions are swept.
    pub sweep_interval_ms: u64,
    /// How long an ended session stays queryable before it is reclaimed.
    pub ended_retention_ms: u64,
    /// Upper bound on a single fallback push.
    pub fallback_timeout_ms: u64,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            default_duration_ms: 3_600_000,
            max_duration_ms: 86_400_000,
            sweep_interval_ms: 5_000,
            ended_retention_ms: 60_000,
            fallback_timeout_ms: 10_000,
        }
    }
}

/// Credential verification settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthSettings {
    /// HS256 secret shared with the token issuer. Connections are refused
    /// when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jwt_secret: Option<String>,
    /// Claim holding the principal id.
    pub principal_claim: String,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            jwt_secret: None,
            principal_claim: "phoneNumber".to_string(),
        }
    }
}

/// Fallback push settings.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PushSettings {
    /// Send real pushes. When false (or when credentials are missing) pushes
    /// are only logged.
    pub enabled: bool,
    /// Directory holding the APNs `config.json` and `.p8` key. Defaults to
    /// `~/.tether/apns`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub apns_dir: Option<String>,
}
