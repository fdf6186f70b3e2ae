//! Engine timers and thresholds

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Tunables for the tunnel engine. Defaults follow the WireGuard timer
/// constants; tests shrink them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelSettings {
    /// Start a new handshake once the current keys are this old
    #[serde(with = "secs")]
    pub rotation_interval: Duration,
    /// Refuse to use keys older than this
    #[serde(with = "secs")]
    pub reject_after: Duration,
    /// Give up on a handshake response after this long
    #[serde(with = "secs")]
    pub handshake_timeout: Duration,
    /// How long the previous keys stay decryptable after a rotation
    #[serde(with = "secs")]
    pub grace_window: Duration,
    /// Period of the background rotation check
    #[serde(with = "secs")]
    pub rotation_check_period: Duration,
    /// Consecutive authentication failures that force a rotation
    pub max_auth_failures: u32,
    /// Bound on decrypted packets waiting for the packet sink
    pub inbound_capacity: usize,
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            rotation_interval: Duration::from_secs(120),
            reject_after: Duration::from_secs(180),
            handshake_timeout: Duration::from_secs(5),
            grace_window: Duration::from_secs(10),
            rotation_check_period: Duration::from_secs(1),
            max_auth_failures: 32,
            inbound_capacity: 256,
        }
    }
}

impl TunnelSettings {
    /// Parse settings from JSON; absent fields keep their defaults
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        let settings: Self = serde_json::from_str(text)?;
        settings
            .validate()
            .map_err(<serde_json::Error as serde::de::Error>::custom)?;
        Ok(settings)
    }

    /// Timers must be positive and keys must outlive the rotation interval
    pub fn validate(&self) -> Result<(), ConfigError> {
        let timers = [
            ("rotation_interval", self.rotation_interval),
            ("reject_after", self.reject_after),
            ("handshake_timeout", self.handshake_timeout),
            ("rotation_check_period", self.rotation_check_period),
        ];
        if let Some((field, _)) = timers.iter().find(|(_, value)| value.is_zero()) {
            return Err(ConfigError::InvalidField {
                field: field.to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.reject_after < self.rotation_interval {
            return Err(ConfigError::InvalidField {
                field: "reject_after".to_string(),
                reason: "must not be shorter than rotation_interval".to_string(),
            });
        }
        Ok(())
    }
}

/// Durations as (fractional) seconds
mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = TunnelSettings::default();
        assert_eq!(settings.rotation_interval, Duration::from_secs(120));
        assert!(settings.reject_after > settings.rotation_interval);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let settings =
            TunnelSettings::from_json(r#"{"rotation_interval": 0.5, "max_auth_failures": 4}"#)
                .unwrap();
        assert_eq!(settings.rotation_interval, Duration::from_millis(500));
        assert_eq!(settings.max_auth_failures, 4);
        assert_eq!(settings.handshake_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_zero_timers_rejected() {
        let err = TunnelSettings::from_json(r#"{"rotation_check_period": 0}"#).unwrap_err();
        assert!(err.to_string().contains("rotation_check_period"));

        for field in ["rotation_interval", "handshake_timeout", "reject_after"] {
            let text = format!(r#"{{"{}": 0}}"#, field);
            assert!(TunnelSettings::from_json(&text).is_err(), "{} accepted", field);
        }
        assert!(TunnelSettings::from_json(r#"{"grace_window": 0}"#).is_ok());
    }

    #[test]
    fn test_reject_after_must_cover_rotation_interval() {
        let err =
            TunnelSettings::from_json(r#"{"rotation_interval": 200, "reject_after": 100}"#)
                .unwrap_err();
        assert!(err.to_string().contains("reject_after"));
        assert!(TunnelSettings::default().validate().is_ok());
    }

    #[test]
    fn test_negative_duration_rejected() {
        assert!(TunnelSettings::from_json(r#"{"grace_window": -1}"#).is_err());
    }
}
