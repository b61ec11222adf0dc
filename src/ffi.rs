//! FFI bindings for mobile platforms (iOS/Android).
//!
//! The host implements the platform callback interfaces in Kotlin/Swift and
//! hands them to [`tracking_init`]. All exported functions are prefixed with
//! `tracking_` and work on one global service slot.
//!
//! When the OS fires the periodic task, the host calls [`tracking_run_task`]
//! from its background worker. After a process kill the host calls
//! [`tracking_init`] again first; the task body reads the persisted intent
//! itself, so it runs even before the manager is started in-memory.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use log::{debug, error, info, warn};
use once_cell::sync::Lazy;

use crate::error::{Result, TrackingError};
use crate::http::{RemoteStore, RemoteStoreConfig};
use crate::init_logging;
use crate::manager::{PowerNegotiation, RuntimeStatus, TrackingManager};
use crate::persistence::SqliteFlagStore;
use crate::platform::{
    BackgroundScheduler, LocationPermissions, PermissionScope, PermissionStatus, PositionProvider,
    PowerExemption, PowerManager, StatusNotifier, TaskHandler, TrackingPlatform,
};
use crate::types::PositionFix;
use crate::watchdog::{AppLifecycleState, ReconcileOutcome, Watchdog};
use crate::TrackingConfig;

// ============================================================================
// Callback Interfaces (implemented by the host)
// ============================================================================

/// OS periodic task scheduler (WorkManager / foreground service, BGTaskScheduler).
#[uniffi::export(callback_interface)]
pub trait PlatformScheduler: Send + Sync {
    /// Schedule `task_id` every `cadence_secs`. Returns false if the OS refused.
    fn schedule(&self, task_id: String, cadence_secs: u64) -> bool;
    fn cancel(&self, task_id: String);
    /// Whether the OS still holds the registration.
    fn is_scheduled(&self, task_id: String) -> bool;
}

#[uniffi::export(callback_interface)]
pub trait PlatformPermissions: Send + Sync {
    fn status(&self, scope: PermissionScope) -> PermissionStatus;
    /// May show a dialog and block until the user answers.
    fn request(&self, scope: PermissionScope) -> PermissionStatus;
}

#[uniffi::export(callback_interface)]
pub trait PlatformPower: Send + Sync {
    fn is_exempt(&self) -> bool;
    fn request_exemption(&self) -> PowerExemption;
}

#[uniffi::export(callback_interface)]
pub trait PlatformLocation: Send + Sync {
    /// Highest-accuracy one-shot fix, or None if the platform has none.
    fn current_position(&self) -> Option<PositionFix>;
}

#[uniffi::export(callback_interface)]
pub trait PlatformNotifier: Send + Sync {
    fn show(&self, title: String, body: String);
    fn hide(&self);
}

// ============================================================================
// Adapters
// ============================================================================

/// Bridges the host scheduler to [`BackgroundScheduler`].
///
/// The host only knows task ids; handlers stay on the Rust side and run when
/// the host calls back through [`tracking_run_task`].
pub struct ForeignScheduler {
    host: Box<dyn PlatformScheduler>,
    handlers: Mutex<HashMap<String, TaskHandler>>,
}

impl ForeignScheduler {
    pub fn new(host: Box<dyn PlatformScheduler>) -> Self {
        Self {
            host,
            handlers: Mutex::new(HashMap::new()),
        }
    }

    fn lock_handlers(&self) -> MutexGuard<'_, HashMap<String, TaskHandler>> {
        self.handlers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The handler registered for `task_id` in this process, if any.
    pub fn handler(&self, task_id: &str) -> Option<TaskHandler> {
        self.lock_handlers().get(task_id).cloned()
    }
}

impl BackgroundScheduler for ForeignScheduler {
    fn register(&self, task_id: &str, cadence: Duration, handler: TaskHandler) -> Result<()> {
        self.lock_handlers().insert(task_id.to_string(), handler);
        if self.host.schedule(task_id.to_string(), cadence.as_secs()) {
            return Ok(());
        }
        self.lock_handlers().remove(task_id);
        Err(TrackingError::Scheduler {
            message: format!("host refused to schedule {}", task_id),
        })
    }

    fn unregister(&self, task_id: &str) -> Result<()> {
        self.lock_handlers().remove(task_id);
        self.host.cancel(task_id.to_string());
        Ok(())
    }

    fn is_registered(&self, task_id: &str) -> bool {
        self.host.is_scheduled(task_id.to_string())
    }
}

struct ForeignPermissions(Box<dyn PlatformPermissions>);

impl LocationPermissions for ForeignPermissions {
    fn status(&self, scope: PermissionScope) -> PermissionStatus {
        self.0.status(scope)
    }

    fn request(&self, scope: PermissionScope) -> PermissionStatus {
        self.0.request(scope)
    }
}

struct ForeignPower(Box<dyn PlatformPower>);

impl PowerManager for ForeignPower {
    fn is_exempt(&self) -> bool {
        self.0.is_exempt()
    }

    fn request_exemption(&self) -> PowerExemption {
        self.0.request_exemption()
    }
}

struct ForeignLocation(Box<dyn PlatformLocation>);

impl PositionProvider for ForeignLocation {
    fn current_position(&self) -> Result<Option<PositionFix>> {
        Ok(self.0.current_position())
    }
}

struct ForeignNotifier(Box<dyn PlatformNotifier>);

impl StatusNotifier for ForeignNotifier {
    fn show(&self, title: &str, body: &str) -> Result<()> {
        self.0.show(title.to_string(), body.to_string());
        Ok(())
    }

    fn hide(&self) -> Result<()> {
        self.0.hide();
        Ok(())
    }
}

// ============================================================================
// FFI Types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, uniffi::Enum)]
pub enum FfiStartResult {
    Started { power: PowerNegotiation },
    AlreadyActive,
    PermissionDenied { scope: PermissionScope },
    Failed { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, uniffi::Record)]
pub struct FfiTrackingStatus {
    pub status: RuntimeStatus,
    pub driver_id: Option<String>,
    pub intent_active: bool,
    pub intent_driver_id: Option<String>,
    pub registered: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, uniffi::Enum)]
pub enum FfiReconcileResult {
    NoAction,
    IntentInactive,
    Untrackable,
    Healthy,
    Restarted { driver_id: String, forced: bool },
    Failed { message: String, consecutive_failures: u32 },
}

impl From<ReconcileOutcome> for FfiReconcileResult {
    fn from(outcome: ReconcileOutcome) -> Self {
        match outcome {
            ReconcileOutcome::NoAction => Self::NoAction,
            ReconcileOutcome::IntentInactive => Self::IntentInactive,
            ReconcileOutcome::Untrackable => Self::Untrackable,
            ReconcileOutcome::Healthy => Self::Healthy,
            ReconcileOutcome::Restarted { driver_id, forced } => {
                Self::Restarted { driver_id, forced }
            }
            ReconcileOutcome::Failed {
                error,
                consecutive_failures,
            } => Self::Failed {
                message: error.to_string(),
                consecutive_failures,
            },
        }
    }
}

// ============================================================================
// Global Service
// ============================================================================

pub struct TrackingService {
    manager: Arc<TrackingManager>,
    watchdog: Watchdog,
    scheduler: Arc<ForeignScheduler>,
    remote: Arc<RemoteStore>,
}

/// Global service slot. Callers clone the `Arc` out, so a long-running task
/// invocation never holds the lock.
pub static TRACKING_SERVICE: Lazy<RwLock<Option<Arc<TrackingService>>>> =
    Lazy::new(|| RwLock::new(None));

/// Run `f` against the initialized service, if any.
pub fn with_tracking_service<F, R>(f: F) -> Option<R>
where
    F: FnOnce(&TrackingService) -> R,
{
    let service = TRACKING_SERVICE.read().ok()?.as_ref().map(Arc::clone)?;
    Some(f(&service))
}

// ============================================================================
// FFI Exports
// ============================================================================

/// Initialize the tracking service. Call once per process, before anything
/// else, including from a headless background launch.
///
/// `config_json` and `remote_config_json` may be partial; missing fields take
/// their defaults. Re-initializing replaces the previous service.
#[allow(clippy::too_many_arguments)]
#[uniffi::export]
pub fn tracking_init(
    db_path: String,
    config_json: String,
    remote_config_json: String,
    scheduler: Box<dyn PlatformScheduler>,
    permissions: Box<dyn PlatformPermissions>,
    power: Box<dyn PlatformPower>,
    location: Box<dyn PlatformLocation>,
    notifier: Box<dyn PlatformNotifier>,
) -> bool {
    init_logging();
    info!("[TrackingService] Initializing with db: {}", db_path);

    let config = match TrackingConfig::from_json(&config_json) {
        Ok(config) => config,
        Err(e) => {
            error!("[TrackingService] Invalid tracking config: {}", e);
            return false;
        }
    };
    let remote_config: RemoteStoreConfig = match serde_json::from_str(&remote_config_json) {
        Ok(config) => config,
        Err(e) => {
            error!("[TrackingService] Invalid remote config: {}", e);
            return false;
        }
    };

    let store = match SqliteFlagStore::new(&db_path) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("[TrackingService] Failed to open flag store: {}", e);
            return false;
        }
    };
    let remote = match RemoteStore::new(remote_config) {
        Ok(remote) => Arc::new(remote),
        Err(e) => {
            error!("[TrackingService] Failed to create remote store: {}", e);
            return false;
        }
    };

    let scheduler = Arc::new(ForeignScheduler::new(scheduler));
    let platform = TrackingPlatform {
        scheduler: Arc::clone(&scheduler) as Arc<dyn BackgroundScheduler>,
        permissions: Arc::new(ForeignPermissions(permissions)),
        power: Arc::new(ForeignPower(power)),
        position: Arc::new(ForeignLocation(location)),
        notifier: Arc::new(ForeignNotifier(notifier)),
    };

    let manager = Arc::new(TrackingManager::new(
        config,
        platform,
        store,
        Arc::clone(&remote) as _,
        Arc::clone(&remote) as _,
    ));
    let service = TrackingService {
        watchdog: Watchdog::new(Arc::clone(&manager)),
        manager,
        scheduler,
        remote,
    };

    let mut slot = TRACKING_SERVICE.write().unwrap_or_else(|e| e.into_inner());
    if slot.is_some() {
        warn!("[TrackingService] Replacing existing service");
    }
    *slot = Some(Arc::new(service));
    info!("[TrackingService] Initialized successfully");
    true
}

#[uniffi::export]
pub fn tracking_is_initialized() -> bool {
    TRACKING_SERVICE
        .read()
        .map(|guard| guard.is_some())
        .unwrap_or(false)
}

/// Hand over the signed-in user's session token (None on sign-out).
#[uniffi::export]
pub fn tracking_set_access_token(token: Option<String>) {
    if with_tracking_service(|s| s.remote.set_access_token(token)).is_none() {
        warn!("[TrackingService] set_access_token before init");
    }
}

#[uniffi::export]
pub fn tracking_start(driver_id: String) -> FfiStartResult {
    init_logging();
    let result = with_tracking_service(|s| s.manager.start(&driver_id));
    match result {
        None => FfiStartResult::Failed {
            message: "tracking service not initialized".to_string(),
        },
        Some(Ok(outcome)) if outcome.already_active => FfiStartResult::AlreadyActive,
        Some(Ok(outcome)) => FfiStartResult::Started {
            power: outcome.power.unwrap_or(PowerNegotiation::Unavailable),
        },
        Some(Err(TrackingError::PermissionDenied { scope })) => {
            FfiStartResult::PermissionDenied { scope }
        }
        Some(Err(e)) => FfiStartResult::Failed {
            message: e.to_string(),
        },
    }
}

/// Stop tracking. Returns false only if a teardown step failed.
#[uniffi::export]
pub fn tracking_stop() -> bool {
    match with_tracking_service(|s| s.manager.stop()) {
        Some(Ok(_)) => true,
        Some(Err(e)) => {
            warn!("[TrackingService] Stop failed: {}", e);
            false
        }
        None => false,
    }
}

/// Ground truth from the OS scheduler.
#[uniffi::export]
pub fn tracking_is_running() -> bool {
    with_tracking_service(|s| s.manager.is_running()).unwrap_or(false)
}

#[uniffi::export]
pub fn tracking_status() -> Option<FfiTrackingStatus> {
    with_tracking_service(|s| {
        let status = s.manager.status();
        FfiTrackingStatus {
            status: status.status,
            driver_id: status.driver_id,
            intent_active: status.intent.active,
            intent_driver_id: status.intent.driver_id,
            registered: status.registered,
        }
    })
}

/// Entry point for the host's background worker when the OS fires the task.
/// Blocks for at most one sample. Returns false if nothing ran.
#[uniffi::export]
pub fn tracking_run_task(task_id: String) -> bool {
    init_logging();
    let ran = with_tracking_service(|s| {
        if let Some(handler) = s.scheduler.handler(&task_id) {
            handler();
            return true;
        }
        // Fresh process after a kill: no in-memory registration yet
        if task_id == s.manager.config().task_id {
            debug!("[TrackingService] Running {} without in-process registration", task_id);
            s.manager.task().run();
            return true;
        }
        warn!("[TrackingService] Unknown task id {}", task_id);
        false
    });
    ran.unwrap_or(false)
}

/// Report an app lifecycle transition to the watchdog.
#[uniffi::export]
pub fn tracking_on_app_state(state: AppLifecycleState) -> FfiReconcileResult {
    with_tracking_service(|s| s.watchdog.on_transition(state).into())
        .unwrap_or(FfiReconcileResult::NoAction)
}

/// Release the service. The persisted intent and the OS registration are
/// kept, so background tracking continues after the UI goes away.
#[uniffi::export]
pub fn tracking_dispose() {
    let mut slot = TRACKING_SERVICE.write().unwrap_or_else(|e| e.into_inner());
    if let Some(service) = slot.take() {
        service.manager.dispose();
        info!("[TrackingService] Disposed");
    }
}
