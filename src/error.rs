//! Unified error handling for the tracking core.
//!
//! Only a few of these ever reach a caller: `start()` surfaces
//! [`TrackingError::PermissionDenied`] and store failures. Everything raised
//! inside the periodic callback is logged and swallowed.

use thiserror::Error;

use crate::platform::PermissionScope;

/// Unified error type for tracking operations.
#[derive(Debug, Clone, Error)]
pub enum TrackingError {
    /// Location permission was not granted for the given scope
    #[error("Location permission denied ({scope:?})")]
    PermissionDenied { scope: PermissionScope },

    /// Driver identifier was empty or blank
    #[error("Driver id must not be empty")]
    InvalidDriverId,

    /// Persisted flag store failure
    #[error("Flag store error: {message}")]
    Store { message: String },

    /// Background scheduler registration failure
    #[error("Scheduler error: {message}")]
    Scheduler { message: String },

    /// Remote sink write failure
    #[error("{}", sink_message(message, *status_code))]
    Sink {
        message: String,
        status_code: Option<u16>,
    },

    /// Session or driver record lookup failure
    #[error("Identity lookup failed: {message}")]
    Identity { message: String },

    /// A platform capability reported an error
    #[error("Platform error: {message}")]
    Platform { message: String },

    /// A bounded platform call did not answer in time
    #[error("{operation} timed out after {after_ms} ms")]
    Timeout { operation: String, after_ms: u64 },

    /// Configuration error
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Generic internal error
    #[error("Internal error: {message}")]
    Internal { message: String },
}

fn sink_message(message: &str, status_code: Option<u16>) -> String {
    match status_code {
        Some(code) => format!("Sink error ({}): {}", code, message),
        None => format!("Sink error: {}", message),
    }
}

impl TrackingError {
    /// Transient errors are logged and skipped; they never stop tracking.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TrackingError::Sink { .. }
                | TrackingError::Timeout { .. }
                | TrackingError::Platform { .. }
                | TrackingError::Identity { .. }
        )
    }

    pub(crate) fn store(message: impl Into<String>) -> Self {
        TrackingError::Store {
            message: message.into(),
        }
    }

    pub(crate) fn internal(message: impl Into<String>) -> Self {
        TrackingError::Internal {
            message: message.into(),
        }
    }
}

#[cfg(feature = "persistence")]
impl From<rusqlite::Error> for TrackingError {
    fn from(e: rusqlite::Error) -> Self {
        TrackingError::store(e.to_string())
    }
}

#[cfg(feature = "http")]
impl From<reqwest::Error> for TrackingError {
    fn from(e: reqwest::Error) -> Self {
        TrackingError::Sink {
            message: e.to_string(),
            status_code: e.status().map(|s| s.as_u16()),
        }
    }
}

/// Result type alias for tracking operations.
pub type Result<T> = std::result::Result<T, TrackingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TrackingError::Sink {
            message: "bad gateway".to_string(),
            status_code: Some(502),
        };
        assert_eq!(err.to_string(), "Sink error (502): bad gateway");

        let err = TrackingError::Timeout {
            operation: "position fix".to_string(),
            after_ms: 10_000,
        };
        assert!(err.to_string().contains("10000 ms"));
    }

    #[test]
    fn test_transient_classification() {
        assert!(TrackingError::Sink {
            message: "offline".to_string(),
            status_code: None
        }
        .is_transient());
        assert!(!TrackingError::PermissionDenied {
            scope: PermissionScope::Background
        }
        .is_transient());
        assert!(!TrackingError::InvalidDriverId.is_transient());
    }
}
