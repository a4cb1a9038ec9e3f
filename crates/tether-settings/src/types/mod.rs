//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase", default)]` so partial
//! JSON files work: missing fields get their compiled default.

mod relay;
mod server;

pub use relay::*;
pub use server::*;

use serde::{Deserialize, Serialize};

/// Root settings type.
///
/// ```json
/// {
///   "server": { "port": 8080 },
///   "relay": { "sweepIntervalMs": 10000 },
///   "auth": { "jwtSecret": "..." }
/// }
/// ```
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TetherSettings {
    /// HTTP / WebSocket listener.
    pub server: ServerSettings,
    /// Session lifecycle tuning.
    pub relay: RelaySettings,
    /// Credential verification.
    pub auth: AuthSettings,
    /// Fallback push delivery.
    pub push: PushSettings,
    /// Log output.
    pub logging: LoggingSettings,
}

impl TetherSettings {
    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> crate::Result<()> {
        if self.relay.default_duration_ms == 0 {
            return Err(crate::SettingsError::InvalidValue(
                "relay.defaultDurationMs must be positive".into(),
            ));
        }
        if self.relay.max_duration_ms < self.relay.default_duration_ms {
            return Err(crate::SettingsError::InvalidValue(format!(
                "relay.maxDurationMs ({}) is below relay.defaultDurationMs ({})",
                self.relay.max_duration_ms, self.relay.default_duration_ms
            )));
        }
        if self.relay.sweep_interval_ms == 0 {
            return Err(crate::SettingsError::InvalidValue(
                "relay.sweepIntervalMs must be positive".into(),
            ));
        }
        if self.server.outbound_buffer == 0 {
            return Err(crate::SettingsError::InvalidValue(
                "server.outboundBuffer must be positive".into(),
            ));
        }
        Ok(())
    }
}
