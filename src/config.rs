//! Tunables for the tracking core.

use std::time::Duration;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TrackingError};

/// Shortest cadence the platform schedulers will honor reliably.
pub const MIN_CADENCE_SECS: u64 = 5;
/// Longest cadence that still gives a useful "where is the driver now".
pub const MAX_CADENCE_SECS: u64 = 30;

/// Configuration for the tracking manager and watchdog.
///
/// Parsed from JSON with defaults for every missing field, so hosts only
/// need to send what they override.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    /// Identifier of the periodic task in the background scheduler
    pub task_id: String,
    /// Seconds between position samples (clamped to 5..=30)
    pub cadence_secs: u64,
    /// Upper bound on waiting for a single position fix
    pub fix_timeout_ms: u64,
    /// Upper bound on waiting for the user to answer a permission dialog
    pub permission_request_timeout_ms: u64,
    /// Upper bound on waiting for the power-management dialog
    pub power_negotiation_timeout_ms: u64,
    /// Time in background after which a foreground return counts as a wake
    pub wake_threshold_secs: u64,
    /// Consecutive failed reconciliations before logging at error level
    pub escalation_threshold: u32,
    /// Persistent status notification shown while tracking
    pub notification_title: String,
    pub notification_body: String,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            task_id: "driver-location-tracking".to_string(),
            cadence_secs: 15,
            fix_timeout_ms: 10_000,
            permission_request_timeout_ms: 60_000,
            power_negotiation_timeout_ms: 3_000,
            wake_threshold_secs: 300,
            escalation_threshold: 3,
            notification_title: "Trip in progress".to_string(),
            notification_body: "Your location is being shared with dispatch".to_string(),
        }
    }
}

impl TrackingConfig {
    /// Parse a (possibly partial) JSON config, then validate and normalize it.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: TrackingConfig =
            serde_json::from_str(json).map_err(|e| TrackingError::Config {
                message: e.to_string(),
            })?;
        config.validate()?;
        Ok(config.normalized())
    }

    pub fn validate(&self) -> Result<()> {
        if self.task_id.trim().is_empty() {
            return Err(TrackingError::Config {
                message: "task_id must not be empty".to_string(),
            });
        }
        if self.fix_timeout_ms == 0 {
            return Err(TrackingError::Config {
                message: "fix_timeout_ms must be greater than zero".to_string(),
            });
        }
        if self.permission_request_timeout_ms == 0 {
            return Err(TrackingError::Config {
                message: "permission_request_timeout_ms must be greater than zero".to_string(),
            });
        }
        // Zero would turn every foreground into a forced restart
        if self.wake_threshold_secs == 0 {
            return Err(TrackingError::Config {
                message: "wake_threshold_secs must be greater than zero".to_string(),
            });
        }
        if self.power_negotiation_timeout_ms == 0 {
            return Err(TrackingError::Config {
                message: "power_negotiation_timeout_ms must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    /// Clamp the cadence into the range the platforms support.
    pub fn normalized(mut self) -> Self {
        let clamped = self.cadence_secs.clamp(MIN_CADENCE_SECS, MAX_CADENCE_SECS);
        if clamped != self.cadence_secs {
            warn!(
                "[Config] cadence_secs {} out of range, using {}",
                self.cadence_secs, clamped
            );
            self.cadence_secs = clamped;
        }
        if self.escalation_threshold == 0 {
            self.escalation_threshold = 1;
        }
        self
    }

    pub fn cadence(&self) -> Duration {
        Duration::from_secs(self.cadence_secs)
    }

    pub fn fix_timeout(&self) -> Duration {
        Duration::from_millis(self.fix_timeout_ms)
    }

    pub fn permission_request_timeout(&self) -> Duration {
        Duration::from_millis(self.permission_request_timeout_ms)
    }

    pub fn power_negotiation_timeout(&self) -> Duration {
        Duration::from_millis(self.power_negotiation_timeout_ms)
    }

    pub fn wake_threshold(&self) -> Duration {
        Duration::from_secs(self.wake_threshold_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_takes_defaults() {
        let config = TrackingConfig::from_json(r#"{"cadence_secs": 10}"#).unwrap();
        assert_eq!(config.cadence_secs, 10);
        assert_eq!(config.task_id, "driver-location-tracking");
        assert_eq!(config.fix_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_cadence_is_clamped() {
        let fast = TrackingConfig::from_json(r#"{"cadence_secs": 1}"#).unwrap();
        assert_eq!(fast.cadence(), Duration::from_secs(MIN_CADENCE_SECS));

        let slow = TrackingConfig::from_json(r#"{"cadence_secs": 600}"#).unwrap();
        assert_eq!(slow.cadence(), Duration::from_secs(MAX_CADENCE_SECS));
    }

    #[test]
    fn test_invalid_config_rejected() {
        assert!(matches!(
            TrackingConfig::from_json(r#"{"task_id": "  "}"#),
            Err(TrackingError::Config { .. })
        ));
        assert!(matches!(
            TrackingConfig::from_json(r#"{"fix_timeout_ms": 0}"#),
            Err(TrackingError::Config { .. })
        ));
        assert!(TrackingConfig::from_json("not json").is_err());
    }

    #[test]
    fn test_zero_wake_threshold_rejected() {
        match TrackingConfig::from_json(r#"{"wake_threshold_secs": 0}"#) {
            Err(TrackingError::Config { message }) => {
                assert!(message.contains("wake_threshold_secs"))
            }
            other => panic!("expected config error, got {:?}", other),
        }
        let config = TrackingConfig::from_json(r#"{"wake_threshold_secs": 1}"#).unwrap();
        assert_eq!(config.wake_threshold(), Duration::from_secs(1));
    }
}
