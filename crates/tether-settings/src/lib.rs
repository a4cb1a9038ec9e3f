//! # tether-settings
//!
//! Configuration for the tether relay, loaded from three layers (in priority order):
//! 1. **Compiled defaults** - [`TetherSettings::default()`]
//! 2. **User file** - `~/.tether/settings.json` (deep-merged over defaults)
//! 3. **Environment variables** - `TETHER_*` overrides (highest priority)
//!
//! The binary loads settings once at startup and hands the relevant sections
//! to each component; nothing reads settings through a global.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_are_valid() {
        let settings = TetherSettings::default();
        assert_eq!(settings.server.port, 3000);
        assert_eq!(settings.relay.default_duration_ms, 3_600_000);
        assert!(settings.relay.default_duration_ms <= settings.relay.max_duration_ms);
        assert_eq!(settings.auth.principal_claim, "phoneNumber");
        assert!(settings.auth.jwt_secret.is_none());
        assert!(!settings.push.enabled);
        assert_eq!(settings.logging.level, "info");
    }

    #[test]
    fn settings_path_is_under_dot_tether() {
        let path = settings_path();
        assert!(path.ends_with(".tether/settings.json"));
    }
}
