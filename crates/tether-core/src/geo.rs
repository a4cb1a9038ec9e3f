//! Position samples reported by a sharer.

use serde::{Deserialize, Serialize};

use crate::errors::RelayError;

/// A single GPS fix.
///
/// `timestamp` is the producer's wall clock in Unix milliseconds. The relay
/// never reorders positions by it; last write wins in arrival order.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    /// Degrees, -90..=90.
    pub latitude: f64,
    /// Degrees, -180..=180.
    pub longitude: f64,
    /// Unix milliseconds at which the fix was taken.
    pub timestamp: i64,
    /// Horizontal accuracy in meters, when the device reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
}

impl Position {
    /// Reject coordinates no device could have produced.
    pub fn validate(&self) -> Result<(), RelayError> {
        if !self.latitude.is_finite() || !(-90.0..=90.0).contains(&self.latitude) {
            return Err(RelayError::InvalidPayload {
                message: format!("latitude out of range: {}", self.latitude),
            });
        }
        if !self.longitude.is_finite() || !(-180.0..=180.0).contains(&self.longitude) {
            return Err(RelayError::InvalidPayload {
                message: format!("longitude out of range: {}", self.longitude),
            });
        }
        match self.accuracy {
            Some(acc) if !acc.is_finite() || acc < 0.0 => Err(RelayError::InvalidPayload {
                message: format!("accuracy must be a non-negative number: {acc}"),
            }),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn pos(latitude: f64, longitude: f64) -> Position {
        Position {
            latitude,
            longitude,
            timestamp: 1_700_000_000_000,
            accuracy: None,
        }
    }

    #[test]
    fn valid_position_passes() {
        assert!(pos(37.7749, -122.4194).validate().is_ok());
        assert!(pos(90.0, 180.0).validate().is_ok());
        assert!(pos(-90.0, -180.0).validate().is_ok());
    }

    #[test]
    fn latitude_out_of_range() {
        assert_matches!(pos(90.1, 0.0).validate(), Err(RelayError::InvalidPayload { .. }));
    }

    #[test]
    fn longitude_out_of_range() {
        assert_matches!(pos(0.0, -180.5).validate(), Err(RelayError::InvalidPayload { .. }));
    }

    #[test]
    fn nan_is_rejected() {
        assert_matches!(pos(f64::NAN, 0.0).validate(), Err(RelayError::InvalidPayload { .. }));
    }

    #[test]
    fn negative_accuracy_is_rejected() {
        let mut p = pos(1.0, 1.0);
        p.accuracy = Some(-3.0);
        assert_matches!(p.validate(), Err(RelayError::InvalidPayload { .. }));
    }

    #[test]
    fn serializes_camel_case_without_missing_accuracy() {
        let json = serde_json::to_value(pos(1.5, 2.5)).unwrap();
        assert_eq!(json["latitude"], 1.5);
        assert_eq!(json["timestamp"], 1_700_000_000_000_i64);
        assert!(json.get("accuracy").is_none());
    }
}
