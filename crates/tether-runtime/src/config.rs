//! Relay tuning knobs.

use std::time::Duration;

/// Lifecycle and delivery configuration.
#[derive(Clone, Debug)]
pub struct RelayConfig {
    /// Share length when the client omits one.
    pub default_duration_ms: u64,
    /// Longest share a client may request.
    pub max_duration_ms: u64,
    /// Expiry sweep period.
    pub sweep_interval: Duration,
    /// How long ended sessions stay queryable.
    pub ended_retention: Duration,
    /// Upper bound on a single fallback push.
    pub fallback_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            default_duration_ms: tether_core::events::DEFAULT_DURATION_MS,
            max_duration_ms: 24 * 60 * 60 * 1000,
            sweep_interval: Duration::from_secs(5),
            ended_retention: Duration::from_secs(60),
            fallback_timeout: Duration::from_secs(10),
        }
    }
}

impl RelayConfig {
    /// Ended retention in milliseconds, saturating.
    pub fn ended_retention_ms(&self) -> u64 {
        u64::try_from(self.ended_retention.as_millis()).unwrap_or(u64::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = RelayConfig::default();
        assert_eq!(config.default_duration_ms, 3_600_000);
        assert_eq!(config.max_duration_ms, 86_400_000);
        assert_eq!(config.sweep_interval, Duration::from_secs(5));
        assert_eq!(config.ended_retention_ms(), 60_000);
    }
}
