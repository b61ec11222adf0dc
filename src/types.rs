//! Data containers shared by the flag store, the pipeline and the FFI layer.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TrackingError};

// ============================================================================
// Tracking Intent
// ============================================================================

/// The driver's declared wish to be tracked, as persisted in the flag store.
///
/// `driver_id` may be `None` while `active` is true: the two keys are written
/// separately, so a reader can observe a half-cleared pair after sign-out.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TrackingIntent {
    pub driver_id: Option<String>,
    pub active: bool,
}

impl TrackingIntent {
    /// The driver to track, if the intent is active and complete.
    pub fn trackable_driver(&self) -> Option<&str> {
        if !self.active {
            return None;
        }
        self.driver_id.as_deref().filter(|id| !id.trim().is_empty())
    }
}

// ============================================================================
// Position Fix
// ============================================================================

/// One raw reading from the platform location service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ffi", derive(uniffi::Record))]
pub struct PositionFix {
    pub latitude: f64,
    pub longitude: f64,
    /// Horizontal accuracy radius in meters
    pub accuracy_meters: f64,
    /// Ground speed in m/s (platforms report negative values when unknown)
    pub speed_mps: Option<f64>,
    /// Course over ground in degrees (negative when unknown)
    pub heading_degrees: Option<f64>,
    /// Sensor timestamp, Unix milliseconds
    pub timestamp_ms: i64,
}

// ============================================================================
// Location Sample
// ============================================================================

/// One position observation attributed to a driver. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationSample {
    pub driver_id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy_meters: f64,
    pub speed_mps: Option<f64>,
    pub heading_degrees: Option<f64>,
    /// Sensor timestamp, Unix milliseconds
    pub sampled_at_ms: i64,
}

impl LocationSample {
    /// Attribute a fix to a driver. Negative speed/heading become `None`.
    pub fn from_fix(driver_id: &str, fix: &PositionFix) -> Self {
        Self {
            driver_id: driver_id.to_string(),
            latitude: fix.latitude,
            longitude: fix.longitude,
            accuracy_meters: fix.accuracy_meters,
            speed_mps: fix.speed_mps.filter(|s| *s >= 0.0),
            heading_degrees: fix.heading_degrees.filter(|h| *h >= 0.0),
            sampled_at_ms: fix.timestamp_ms,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.driver_id.trim().is_empty() {
            return Err(TrackingError::InvalidDriverId);
        }
        let coords_ok = self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude);
        if !coords_ok {
            return Err(TrackingError::Platform {
                message: format!(
                    "invalid coordinates ({}, {})",
                    self.latitude, self.longitude
                ),
            });
        }
        if DateTime::<Utc>::from_timestamp_millis(self.sampled_at_ms).is_none() {
            return Err(TrackingError::Platform {
                message: format!("sensor timestamp {} out of range", self.sampled_at_ms),
            });
        }
        if !self.accuracy_meters.is_finite() || self.accuracy_meters < 0.0 {
            return Err(TrackingError::Platform {
                message: format!("invalid accuracy {}", self.accuracy_meters),
            });
        }
        Ok(())
    }

    /// Wire shape written to both sinks.
    pub fn to_record(&self) -> LocationRecord {
        LocationRecord {
            driver_id: self.driver_id.clone(),
            latitude: self.latitude,
            longitude: self.longitude,
            accuracy: self.accuracy_meters,
            speed: self.speed_mps.filter(|v| v.is_finite()),
            heading: self.heading_degrees.filter(|v| v.is_finite()),
            timestamp: format_timestamp_ms(self.sampled_at_ms),
        }
    }
}

/// Row shape for the history sink and the current-position projection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationRecord {
    pub driver_id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy: f64,
    pub speed: Option<f64>,
    pub heading: Option<f64>,
    /// RFC 3339 sensor time, UTC
    pub timestamp: String,
}

/// Format Unix milliseconds as RFC 3339 UTC (`2026-01-28T09:15:00.000Z`).
///
/// Out-of-range input formats as the epoch; `LocationSample::validate`
/// rejects such samples before they reach a sink.
pub fn format_timestamp_ms(ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .unwrap_or_default()
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Current wall clock, Unix milliseconds.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}
