//! APNs client: ES256 JWT signing and HTTP/2 delivery.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::config::ApnsConfig;
use super::types::{ApnsNotification, ApnsSendResult};

/// Provider tokens are refreshed before Apple's one-hour limit.
const TOKEN_VALIDITY: Duration = Duration::from_secs(55 * 60);

/// Request timeout for a single push.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize, Deserialize)]
struct ApnsClaims {
    /// Team id.
    iss: String,
    /// Issued at, Unix seconds.
    iat: i64,
}

struct CachedToken {
    token: String,
    created_at: Instant,
}

/// Sends alert pushes to Apple devices.
pub struct ApnsService {
    config: ApnsConfig,
    encoding_key: EncodingKey,
    client: reqwest::Client,
    cached_token: Mutex<Option<CachedToken>>,
}

impl std::fmt::Debug for ApnsService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApnsService")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ApnsService {
    /// Read the signing key and build an HTTP/2 client.
    pub fn new(config: ApnsConfig) -> Result<Self, ApnsError> {
        let key_path = config.resolved_key_path();
        let key_pem = std::fs::read(&key_path).map_err(|e| ApnsError::KeyRead {
            path: key_path.display().to_string(),
            reason: e.to_string(),
        })?;

        let encoding_key = EncodingKey::from_ec_pem(&key_pem).map_err(|e| ApnsError::KeyParse {
            reason: e.to_string(),
        })?;

        // reqwest stays on HTTP/1.1 unless told otherwise; APNs requires h2.
        let client = reqwest::Client::builder()
            .http2_prior_knowledge()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ApnsError::ClientBuild {
                reason: e.to_string(),
            })?;

        debug!(
            key_id = %config.key_id,
            team_id = %config.team_id,
            environment = %config.environment,
            "APNs service initialized"
        );

        Ok(Self {
            config,
            encoding_key,
            client,
            cached_token: Mutex::new(None),
        })
    }

    /// Configured credentials.
    pub fn config(&self) -> &ApnsConfig {
        &self.config
    }

    /// Send one notification to one device.
    pub async fn send(&self, device_token: &str, notification: &ApnsNotification) -> ApnsSendResult {
        let jwt = match self.get_or_refresh_token() {
            Ok(t) => t,
            Err(e) => return ApnsSendResult::unsent(format!("JWT generation failed: {e}")),
        };

        let url = format!("https://{}:443/3/device/{device_token}", self.config.apns_host());
        let priority = if notification.priority == "high" { "10" } else { "5" };
        let payload = build_payload(notification);

        let result = self
            .client
            .post(&url)
            .header("authorization", format!("bearer {jwt}"))
            .header("apns-topic", &self.config.bundle_id)
            .header("apns-push-type", "alert")
            .header("apns-priority", priority)
            .header("apns-expiration", "0")
            .json(&payload)
            .send()
            .await;

        match result {
            Ok(response) => {
                let status = response.status().as_u16();
                let apns_id = response
                    .headers()
                    .get("apns-id")
                    .and_then(|v| v.to_str().ok())
                    .map(String::from);

                if response.status().is_success() {
                    debug!(status, token = token_prefix(device_token), apns_id = ?apns_id, "APNs send ok");
                    return ApnsSendResult {
                        success: true,
                        apns_id,
                        status_code: Some(status),
                        reason: None,
                        error: None,
                    };
                }

                let body = response.text().await.unwrap_or_default();
                let reason = serde_json::from_str::<serde_json::Value>(&body)
                    .ok()
                    .and_then(|v| v.get("reason")?.as_str().map(String::from));
                warn!(status, reason = ?reason, token = token_prefix(device_token), "APNs send failed");
                ApnsSendResult {
                    success: false,
                    apns_id,
                    status_code: Some(status),
                    reason,
                    error: Some(body),
                }
            }
            Err(e) => {
                warn!(error = %e, token = token_prefix(device_token), "APNs transport error");
                ApnsSendResult::unsent(e.to_string())
            }
        }
    }

    fn get_or_refresh_token(&self) -> Result<String, ApnsError> {
        let mut cached = self
            .cached_token
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        if let Some(token) = cached.as_ref().filter(|t| t.created_at.elapsed() < TOKEN_VALIDITY) {
            return Ok(token.token.clone());
        }

        let jwt = self.generate_jwt()?;
        *cached = Some(CachedToken {
            token: jwt.clone(),
            created_at: Instant::now(),
        });
        Ok(jwt)
    }

    fn generate_jwt(&self) -> Result<String, ApnsError> {
        let mut header = Header::new(Algorithm::ES256);
        header.kid = Some(self.config.key_id.clone());

        let claims = ApnsClaims {
            iss: self.config.team_id.clone(),
            iat: chrono::Utc::now().timestamp(),
        };

        jsonwebtoken::encode(&header, &claims, &self.encoding_key).map_err(|e| ApnsError::JwtSign {
            reason: e.to_string(),
        })
    }
}

impl ApnsSendResult {
    /// A push that never reached APNs.
    fn unsent(error: String) -> Self {
        Self {
            success: false,
            apns_id: None,
            status_code: None,
            reason: None,
            error: Some(error),
        }
    }
}

/// APNs JSON body: `aps` alert plus custom data at the root.
fn build_payload(notification: &ApnsNotification) -> serde_json::Value {
    let mut aps = serde_json::json!({
        "alert": {
            "title": notification.title,
            "body": notification.body,
        },
    });
    if let Some(sound) = &notification.sound {
        aps["sound"] = serde_json::json!(sound);
    }
    if let Some(thread_id) = &notification.thread_id {
        aps["thread-id"] = serde_json::json!(thread_id);
    }

    let mut payload = serde_json::json!({ "aps": aps });
    if let Some(obj) = payload.as_object_mut() {
        for (key, value) in &notification.data {
            let _ = obj.insert(key.clone(), serde_json::json!(value));
        }
    }
    payload
}

/// First eight bytes of a token, for logs.
pub(crate) fn token_prefix(token: &str) -> &str {
    token.get(..8).unwrap_or(token)
}

/// APNs setup errors.
#[derive(Debug, thiserror::Error)]
pub enum ApnsError {
    /// Failed to read the private key file.
    #[error("failed to read APNs key at {path}: {reason}")]
    KeyRead {
        /// Key file path.
        path: String,
        /// Error description.
        reason: String,
    },
    /// Failed to parse the private key.
    #[error("failed to parse APNs key: {reason}")]
    KeyParse {
        /// Error description.
        reason: String,
    },
    /// Failed to build the HTTP client.
    #[error("failed to build HTTP client: {reason}")]
    ClientBuild {
        /// Error description.
        reason: String,
    },
    /// Failed to sign the provider token.
    #[error("failed to sign JWT: {reason}")]
    JwtSign {
        /// Error description.
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::path::PathBuf;

    fn config(key_path: &str) -> ApnsConfig {
        ApnsConfig {
            key_id: "ABC".to_string(),
            team_id: "XYZ".to_string(),
            bundle_id: "com.test".to_string(),
            environment: "sandbox".to_string(),
            key_path: Some(key_path.to_string()),
            base_dir: PathBuf::new(),
        }
    }

    #[test]
    fn payload_carries_alert_and_root_data() {
        let notification = ApnsNotification {
            title: "📍 Live Location Request".to_string(),
            body: "+1 wants to share their live location with you".to_string(),
            data: HashMap::from([
                ("type".to_string(), "live-location-request".to_string()),
                ("sessionId".to_string(), "s1".to_string()),
            ]),
            priority: "high".to_string(),
            sound: Some("default".to_string()),
            thread_id: Some("s1".to_string()),
        };
        let payload = build_payload(&notification);
        assert_eq!(payload["aps"]["alert"]["title"], "📍 Live Location Request");
        assert_eq!(payload["aps"]["sound"], "default");
        assert_eq!(payload["aps"]["thread-id"], "s1");
        assert_eq!(payload["type"], "live-location-request");
        assert_eq!(payload["sessionId"], "s1");
    }

    #[test]
    fn minimal_payload_omits_optional_fields() {
        let notification = ApnsNotification {
            title: "T".to_string(),
            body: "B".to_string(),
            data: HashMap::new(),
            priority: "normal".to_string(),
            sound: None,
            thread_id: None,
        };
        let payload = build_payload(&notification);
        assert!(payload["aps"]["sound"].is_null());
        assert!(payload["aps"]["thread-id"].is_null());
        assert_eq!(payload.as_object().unwrap().len(), 1);
    }

    #[test]
    fn jwt_claims_serialize() {
        let claims = ApnsClaims {
            iss: "TEAM123".to_string(),
            iat: 1_700_000_000,
        };
        let json = serde_json::to_value(&claims).unwrap();
        assert_eq!(json["iss"], "TEAM123");
        assert_eq!(json["iat"], 1_700_000_000);
    }

    #[test]
    fn token_prefix_is_char_safe() {
        assert_eq!(token_prefix("abcdefghijkl"), "abcdefgh");
        assert_eq!(token_prefix("abc"), "abc");
        assert_eq!(token_prefix("ééééé"), "éééé");
    }

    #[test]
    fn missing_key_fails() {
        let err = ApnsService::new(config("/nonexistent/key.p8")).unwrap_err();
        assert!(matches!(err, ApnsError::KeyRead { .. }));
        assert!(err.to_string().contains("/nonexistent/key.p8"));
    }

    #[test]
    fn invalid_key_fails() {
        let dir = tempfile::tempdir().unwrap();
        let key_path = dir.path().join("bad.p8");
        std::fs::write(&key_path, "not a valid PEM key").unwrap();
        let err = ApnsService::new(config(&key_path.to_string_lossy())).unwrap_err();
        assert!(matches!(err, ApnsError::KeyParse { .. }));
    }
}
