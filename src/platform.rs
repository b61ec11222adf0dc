//! Platform capabilities consumed by the tracking core.
//!
//! Production hosts back these with the OS APIs (through the FFI layer);
//! tests back them with the fakes in [`crate::testing`].

use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TrackingError};
use crate::types::PositionFix;

/// Body of a periodic background task. May be invoked concurrently with a
/// previous invocation that has not finished yet.
pub type TaskHandler = Arc<dyn Fn() + Send + Sync>;

// ============================================================================
// Background Scheduler
// ============================================================================

/// OS scheduler for periodic background work.
///
/// Registering a `task_id` that is already registered replaces the previous
/// registration; there is never more than one handler per id.
pub trait BackgroundScheduler: Send + Sync {
    fn register(&self, task_id: &str, cadence: Duration, handler: TaskHandler) -> Result<()>;
    fn unregister(&self, task_id: &str) -> Result<()>;
    fn is_registered(&self, task_id: &str) -> bool;
}

// ============================================================================
// Permissions
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "ffi", derive(uniffi::Enum))]
pub enum PermissionScope {
    Foreground,
    Background,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ffi", derive(uniffi::Enum))]
pub enum PermissionStatus {
    Granted,
    Denied,
    Undetermined,
}

impl PermissionStatus {
    pub fn is_granted(self) -> bool {
        self == PermissionStatus::Granted
    }
}

/// Location permission query and request. `request` may show a dialog.
pub trait LocationPermissions: Send + Sync {
    fn status(&self, scope: PermissionScope) -> PermissionStatus;
    fn request(&self, scope: PermissionScope) -> PermissionStatus;
}

// ============================================================================
// Power Management
// ============================================================================

/// Answer to an "unrestricted background activity" request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ffi", derive(uniffi::Enum))]
pub enum PowerExemption {
    Granted,
    Declined,
    /// The platform has no such setting
    Unavailable,
}

/// Advisory power-management exemption negotiation.
pub trait PowerManager: Send + Sync {
    fn is_exempt(&self) -> bool;
    fn request_exemption(&self) -> PowerExemption;
}

// ============================================================================
// Position, Notification
// ============================================================================

/// One-shot position fix. `Ok(None)` means no fix was available.
pub trait PositionProvider: Send + Sync {
    fn current_position(&self) -> Result<Option<PositionFix>>;
}

/// Persistent, non-dismissible status notification while tracking runs.
pub trait StatusNotifier: Send + Sync {
    fn show(&self, title: &str, body: &str) -> Result<()>;
    fn hide(&self) -> Result<()>;
}

/// All platform capabilities the manager needs.
#[derive(Clone)]
pub struct TrackingPlatform {
    pub scheduler: Arc<dyn BackgroundScheduler>,
    pub permissions: Arc<dyn LocationPermissions>,
    pub power: Arc<dyn PowerManager>,
    pub position: Arc<dyn PositionProvider>,
    pub notifier: Arc<dyn StatusNotifier>,
}

// ============================================================================
// Bounded calls
// ============================================================================

/// Run a blocking platform call on a worker thread, giving up after `timeout`.
///
/// On timeout the worker is left to finish on its own; its result is dropped.
pub fn call_with_deadline<T, F>(operation: &str, timeout: Duration, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    thread::Builder::new()
        .name(format!("tracking-{}", operation.replace(' ', "-")))
        .spawn(move || {
            let _ = tx.send(f());
        })
        .map_err(|e| TrackingError::Platform {
            message: format!("failed to spawn {} worker: {}", operation, e),
        })?;

    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => Err(TrackingError::Timeout {
            operation: operation.to_string(),
            after_ms: timeout.as_millis() as u64,
        }),
        Err(RecvTimeoutError::Disconnected) => Err(TrackingError::Platform {
            message: format!("{} worker exited without a result", operation),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deadline_returns_value() {
        let value = call_with_deadline("quick", Duration::from_secs(1), || Ok(42)).unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn test_deadline_times_out() {
        let result: Result<()> = call_with_deadline("slow", Duration::from_millis(20), || {
            thread::sleep(Duration::from_millis(500));
            Ok(())
        });
        assert!(matches!(result, Err(TrackingError::Timeout { after_ms: 20, .. })));
    }

    #[test]
    fn test_deadline_survives_panic() {
        let result: Result<()> =
            call_with_deadline("panicky", Duration::from_secs(1), || panic!("boom"));
        assert!(matches!(result, Err(TrackingError::Platform { .. })));
    }
}
