//! APNs credential loading.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// APNs credentials and target.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApnsConfig {
    /// Apple Developer Key ID (10-char alphanumeric).
    pub key_id: String,
    /// Apple Developer Team ID (10-char alphanumeric).
    pub team_id: String,
    /// App bundle identifier, sent as `apns-topic`.
    pub bundle_id: String,
    /// "sandbox" or "production".
    #[serde(default = "default_environment")]
    pub environment: String,
    /// Explicit path to the `.p8` key. Defaults to `AuthKey_{keyId}.p8`
    /// beside `config.json`.
    pub key_path: Option<String>,
    /// Directory the config was loaded from.
    #[serde(skip)]
    pub base_dir: PathBuf,
}

fn default_environment() -> String {
    "sandbox".to_string()
}

fn home_dir() -> PathBuf {
    PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string()))
}

/// `~/.tether/apns`.
pub fn default_apns_dir() -> PathBuf {
    home_dir().join(".tether").join("apns")
}

impl ApnsConfig {
    /// Resolve the private key path.
    pub fn resolved_key_path(&self) -> PathBuf {
        match self.key_path.as_deref() {
            Some(path) if path.starts_with("~/") => home_dir().join(path.trim_start_matches("~/")),
            Some(path) => PathBuf::from(path),
            None => self.base_dir.join(format!("AuthKey_{}.p8", self.key_id)),
        }
    }

    /// APNs host for the configured environment.
    pub fn apns_host(&self) -> &str {
        if self.environment == "production" {
            "api.push.apple.com"
        } else {
            "api.sandbox.push.apple.com"
        }
    }
}

/// Load `config.json` from `dir`.
///
/// Returns `None` when the config is absent, unreadable, incomplete, or its
/// key file is missing. Push is optional, so none of these are errors.
pub fn load_from_dir(dir: &Path) -> Option<ApnsConfig> {
    let config_path = dir.join("config.json");
    if !config_path.exists() {
        debug!(?config_path, "APNs config not found");
        return None;
    }

    let content = match std::fs::read_to_string(&config_path) {
        Ok(c) => c,
        Err(e) => {
            warn!(?config_path, error = %e, "failed to read APNs config");
            return None;
        }
    };

    let mut config: ApnsConfig = match serde_json::from_str(&content) {
        Ok(c) => c,
        Err(e) => {
            warn!(?config_path, error = %e, "failed to parse APNs config");
            return None;
        }
    };
    config.base_dir = dir.to_path_buf();

    if config.key_id.is_empty() || config.team_id.is_empty() || config.bundle_id.is_empty() {
        warn!("APNs config missing required fields (keyId, teamId, bundleId)");
        return None;
    }

    let key_path = config.resolved_key_path();
    if !key_path.exists() {
        warn!(?key_path, "APNs private key not found");
        return None;
    }

    debug!(
        key_id = %config.key_id,
        team_id = %config.team_id,
        bundle_id = %config.bundle_id,
        environment = %config.environment,
        "APNs config loaded"
    );
    Some(config)
}
