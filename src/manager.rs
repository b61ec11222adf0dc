//! # Tracking Lifecycle Manager
//!
//! Owns start/stop of background location tracking for one driver.
//!
//! ## States
//!
//! ```text
//! Stopped --start--> Starting --> Active --stop--> Stopped
//!                                   |
//!                                   +-- OS drops the task --> Suspended
//! ```
//!
//! `Suspended` is never set here: it is what [`TrackingManager::status`]
//! reports when the manager believes it is active but the scheduler no
//! longer has the task. The watchdog repairs it.
//!
//! Callers (trip lifecycle) serialize `start`/`stop`; every operation is
//! idempotent so accidental overlaps converge.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use crate::config::TrackingConfig;
use crate::elapsed_ms;
use crate::error::{Result, TrackingError};
use crate::flags::{FlagStore, TrackingFlags};
use crate::identity::{DriverLookup, IdentityResolver};
use crate::pipeline::{LocationPipeline, LocationSink, RecordOutcome};
use crate::platform::{
    call_with_deadline, LocationPermissions, PermissionScope, PositionProvider, PowerExemption,
    TaskHandler, TrackingPlatform,
};
use crate::types::{LocationSample, TrackingIntent};

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackingState {
    Stopped,
    Starting,
    Active { driver_id: String },
}

/// Externally visible runtime status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "ffi", derive(uniffi::Enum))]
pub enum RuntimeStatus {
    Stopped,
    Starting,
    Active,
    /// Active in memory, but the scheduler no longer has the task
    Suspended,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackingStatus {
    pub status: RuntimeStatus,
    pub driver_id: Option<String>,
    pub intent: TrackingIntent,
    pub registered: bool,
}

/// How the power-management exemption negotiation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "ffi", derive(uniffi::Enum))]
pub enum PowerNegotiation {
    AlreadyExempt,
    Granted,
    Declined,
    Unavailable,
    /// The user did not answer within the configured wait
    TimedOut,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartOutcome {
    /// Already tracking this driver; nothing was re-registered
    pub already_active: bool,
    /// `None` when the start was a no-op
    pub power: Option<PowerNegotiation>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped,
    AlreadyStopped,
}

/// Why a periodic invocation did not produce a sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    TrackingInactive,
    NoDriver,
    PermissionMissing,
    NoFix,
    FixTimeout,
    /// A previous request timed out and the provider has not returned yet
    FixStalled,
    FixFailed,
    Panicked,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    Recorded(RecordOutcome),
    Skipped(SkipReason),
}

// ============================================================================
// Periodic Task
// ============================================================================

/// Body of the periodic background callback.
///
/// Holds no per-invocation state: concurrent invocations each build their
/// own sample and write through the same pipeline. The only thing shared is
/// the completion flag of a position request that outlived its deadline, so
/// a hung provider is not handed a new request (and a new thread) every tick.
pub struct TrackingTask {
    flags: TrackingFlags,
    resolver: IdentityResolver,
    pipeline: LocationPipeline,
    permissions: Arc<dyn LocationPermissions>,
    position: Arc<dyn PositionProvider>,
    fix_timeout: Duration,
    stalled_fix: Mutex<Option<Arc<AtomicBool>>>,
}

/// Marks a position request finished when the worker drops it, panics included.
struct FixFinished(Arc<AtomicBool>);

impl Drop for FixFinished {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

impl TrackingTask {
    /// Run one invocation. Never panics and never returns an error.
    pub fn run(&self) -> TickOutcome {
        let start = Instant::now();
        match panic::catch_unwind(AssertUnwindSafe(|| self.run_inner())) {
            Ok(outcome) => {
                debug!("[TrackingTask] {:?} ({} ms)", outcome, elapsed_ms(start));
                outcome
            }
            Err(_) => {
                error!("[TrackingTask] Invocation panicked, skipping this sample");
                TickOutcome::Skipped(SkipReason::Panicked)
            }
        }
    }

    fn run_inner(&self) -> TickOutcome {
        if !self.flags.is_active() {
            debug!("[TrackingTask] Tracking intent inactive, skipping");
            return TickOutcome::Skipped(SkipReason::TrackingInactive);
        }

        let Some(driver_id) = self.resolver.resolve_driver_id() else {
            info!("[TrackingTask] No driver id resolvable, skipping");
            return TickOutcome::Skipped(SkipReason::NoDriver);
        };

        if !self
            .permissions
            .status(PermissionScope::Foreground)
            .is_granted()
        {
            warn!("[TrackingTask] Location permission missing, skipping");
            return TickOutcome::Skipped(SkipReason::PermissionMissing);
        }

        if self.fix_stalled() {
            warn!("[TrackingTask] Previous position request still outstanding, skipping");
            return TickOutcome::Skipped(SkipReason::FixStalled);
        }

        let provider = Arc::clone(&self.position);
        let done = Arc::new(AtomicBool::new(false));
        let finished = FixFinished(Arc::clone(&done));
        let fix = match call_with_deadline("position fix", self.fix_timeout, move || {
            let _finished = finished;
            provider.current_position()
        }) {
            Ok(Some(fix)) => fix,
            Ok(None) => {
                info!("[TrackingTask] No position fix available, skipping");
                return TickOutcome::Skipped(SkipReason::NoFix);
            }
            Err(TrackingError::Timeout { after_ms, .. }) => {
                warn!("[TrackingTask] Position fix timed out after {} ms", after_ms);
                *self.lock_stalled() = Some(done);
                return TickOutcome::Skipped(SkipReason::FixTimeout);
            }
            Err(e) => {
                warn!("[TrackingTask] Position fix failed: {}", e);
                return TickOutcome::Skipped(SkipReason::FixFailed);
            }
        };

        let sample = LocationSample::from_fix(&driver_id, &fix);
        TickOutcome::Recorded(self.pipeline.record(&sample))
    }

    fn lock_stalled(&self) -> MutexGuard<'_, Option<Arc<AtomicBool>>> {
        self.stalled_fix.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// True while a timed-out position request is still running.
    fn fix_stalled(&self) -> bool {
        let mut stalled = self.lock_stalled();
        match stalled.as_ref() {
            Some(done) if !done.load(Ordering::SeqCst) => true,
            _ => {
                *stalled = None;
                false
            }
        }
    }
}

// ============================================================================
// Manager
// ============================================================================

pub struct TrackingManager {
    config: TrackingConfig,
    platform: TrackingPlatform,
    flags: TrackingFlags,
    task: Arc<TrackingTask>,
    state: Mutex<TrackingState>,
}

impl TrackingManager {
    pub fn new(
        config: TrackingConfig,
        platform: TrackingPlatform,
        store: Arc<dyn FlagStore>,
        lookup: Arc<dyn DriverLookup>,
        sink: Arc<dyn LocationSink>,
    ) -> Self {
        let config = config.normalized();
        let flags = TrackingFlags::new(store);
        let task = Arc::new(TrackingTask {
            flags: flags.clone(),
            resolver: IdentityResolver::new(flags.clone(), lookup),
            pipeline: LocationPipeline::new(sink),
            permissions: Arc::clone(&platform.permissions),
            position: Arc::clone(&platform.position),
            fix_timeout: config.fix_timeout(),
            stalled_fix: Mutex::new(None),
        });

        Self {
            config,
            platform,
            flags,
            task,
            state: Mutex::new(TrackingState::Stopped),
        }
    }

    pub fn config(&self) -> &TrackingConfig {
        &self.config
    }

    pub fn flags(&self) -> &TrackingFlags {
        &self.flags
    }

    /// The periodic callback body, for hosts that drive it themselves.
    pub fn task(&self) -> Arc<TrackingTask> {
        Arc::clone(&self.task)
    }

    fn lock_state(&self) -> MutexGuard<'_, TrackingState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start tracking `driver_id`.
    ///
    /// Idempotent for the driver already being tracked. Permission denial
    /// fails the start; power-management refusal does not.
    pub fn start(&self, driver_id: &str) -> Result<StartOutcome> {
        let driver_id = driver_id.trim();
        if driver_id.is_empty() {
            return Err(TrackingError::InvalidDriverId);
        }

        let start = Instant::now();
        let mut state = self.lock_state();

        if let TrackingState::Active { driver_id: current } = &*state {
            if current == driver_id && self.is_running() {
                debug!("[Tracking] Already tracking driver {}", driver_id);
                return Ok(StartOutcome {
                    already_active: true,
                    power: None,
                });
            }
            if current != driver_id {
                info!(
                    "[Tracking] Switching tracked driver {} -> {}",
                    current, driver_id
                );
            }
        }

        info!("[Tracking] Starting for driver {}", driver_id);
        *state = TrackingState::Starting;

        if let Err(e) = self.ensure_permissions() {
            *state = TrackingState::Stopped;
            return Err(e);
        }

        let power = self.negotiate_power();

        if let Err(e) = self.flags.write_intent(driver_id) {
            error!("[Tracking] Failed to persist tracking intent: {}", e);
            *state = TrackingState::Stopped;
            return Err(e);
        }

        let task = Arc::clone(&self.task);
        let handler: TaskHandler = Arc::new(move || {
            task.run();
        });
        if let Err(e) =
            self.platform
                .scheduler
                .register(&self.config.task_id, self.config.cadence(), handler)
        {
            // Intent stays persisted so the watchdog retries on next foreground
            error!("[Tracking] Failed to register background task: {}", e);
            *state = TrackingState::Stopped;
            return Err(e);
        }

        if let Err(e) = self
            .platform
            .notifier
            .show(&self.config.notification_title, &self.config.notification_body)
        {
            warn!("[Tracking] Failed to show status notification: {}", e);
        }

        *state = TrackingState::Active {
            driver_id: driver_id.to_string(),
        };
        info!(
            "[Tracking] Active for driver {} every {}s, power: {:?} ({} ms)",
            driver_id,
            self.config.cadence_secs,
            power,
            elapsed_ms(start)
        );

        Ok(StartOutcome {
            already_active: false,
            power: Some(power),
        })
    }

    /// Stop tracking and clear the persisted intent. Idempotent.
    pub fn stop(&self) -> Result<StopOutcome> {
        let mut state = self.lock_state();
        let task_id = &self.config.task_id;

        let registered = self.platform.scheduler.is_registered(task_id);
        let intent = self.flags.read_intent();
        if *state == TrackingState::Stopped
            && !registered
            && !intent.active
            && intent.driver_id.is_none()
        {
            debug!("[Tracking] Stop requested while already stopped");
            return Ok(StopOutcome::AlreadyStopped);
        }

        info!("[Tracking] Stopping (state: {:?})", *state);
        let mut first_error = self.teardown().err();

        if let Err(e) = self.flags.clear_intent() {
            error!("[Tracking] Failed to clear tracking intent: {}", e);
            first_error.get_or_insert(e);
        }

        *state = TrackingState::Stopped;

        match first_error {
            Some(e) => Err(e),
            None => Ok(StopOutcome::Stopped),
        }
    }

    /// Tear down the registration and start again for `driver_id`.
    ///
    /// Unlike `stop` followed by `start`, the persisted intent is never
    /// cleared: if the new start fails, the intent is still there for the
    /// next reconciliation to retry.
    pub fn restart(&self, driver_id: &str) -> Result<StartOutcome> {
        {
            let mut state = self.lock_state();
            info!(
                "[Tracking] Restarting for driver {} (state: {:?})",
                driver_id, *state
            );
            if let Err(e) = self.teardown() {
                warn!("[Tracking] Teardown before restart incomplete: {}", e);
            }
            *state = TrackingState::Stopped;
        }
        self.start(driver_id)
    }

    /// Unregister the task and hide the notification. The intent is untouched.
    fn teardown(&self) -> Result<()> {
        // Unregister even when the scheduler says it has nothing: some
        // platforms keep a half-alive registration only a teardown clears.
        let unregistered = self.platform.scheduler.unregister(&self.config.task_id);
        if let Err(e) = &unregistered {
            warn!("[Tracking] Failed to unregister background task: {}", e);
        }

        if let Err(e) = self.platform.notifier.hide() {
            warn!("[Tracking] Failed to hide status notification: {}", e);
        }

        unregistered
    }

    /// Ground truth from the scheduler, not the persisted flag.
    pub fn is_running(&self) -> bool {
        self.platform.scheduler.is_registered(&self.config.task_id)
    }

    pub fn status(&self) -> TrackingStatus {
        let state = self.lock_state().clone();
        let registered = self.is_running();
        let (status, driver_id) = match state {
            TrackingState::Stopped => (RuntimeStatus::Stopped, None),
            TrackingState::Starting => (RuntimeStatus::Starting, None),
            TrackingState::Active { driver_id } if registered => {
                (RuntimeStatus::Active, Some(driver_id))
            }
            TrackingState::Active { driver_id } => (RuntimeStatus::Suspended, Some(driver_id)),
        };
        TrackingStatus {
            status,
            driver_id,
            intent: self.flags.read_intent(),
            registered,
        }
    }

    /// Drop in-memory state. The persisted intent and the OS registration
    /// are left alone so tracking survives the app process.
    pub fn dispose(&self) {
        let mut state = self.lock_state();
        debug!("[Tracking] Disposing manager (state: {:?})", *state);
        *state = TrackingState::Stopped;
    }

    fn ensure_permissions(&self) -> Result<()> {
        let timeout = self.config.permission_request_timeout();
        for scope in [PermissionScope::Foreground, PermissionScope::Background] {
            if self.platform.permissions.status(scope).is_granted() {
                continue;
            }

            info!("[Tracking] Requesting {:?} location permission", scope);
            let permissions = Arc::clone(&self.platform.permissions);
            let answer = call_with_deadline("permission request", timeout, move || {
                Ok(permissions.request(scope))
            });
            match answer {
                Ok(status) if status.is_granted() => {}
                Ok(status) => {
                    warn!("[Tracking] {:?} permission not granted: {:?}", scope, status);
                    return Err(TrackingError::PermissionDenied { scope });
                }
                Err(e) => {
                    warn!("[Tracking] {:?} permission request failed: {}", scope, e);
                    return Err(TrackingError::PermissionDenied { scope });
                }
            }
        }
        Ok(())
    }

    /// Advisory only: the result is logged and reported, never enforced.
    fn negotiate_power(&self) -> PowerNegotiation {
        if self.platform.power.is_exempt() {
            return PowerNegotiation::AlreadyExempt;
        }

        let power = Arc::clone(&self.platform.power);
        let answer = call_with_deadline(
            "power negotiation",
            self.config.power_negotiation_timeout(),
            move || Ok(power.request_exemption()),
        );
        let negotiation = match answer {
            Ok(PowerExemption::Granted) => PowerNegotiation::Granted,
            Ok(PowerExemption::Declined) => PowerNegotiation::Declined,
            Ok(PowerExemption::Unavailable) => PowerNegotiation::Unavailable,
            Err(TrackingError::Timeout { .. }) => PowerNegotiation::TimedOut,
            Err(e) => {
                warn!("[Tracking] Power negotiation failed: {}", e);
                PowerNegotiation::Failed
            }
        };
        if negotiation != PowerNegotiation::Granted {
            info!(
                "[Tracking] No power-management exemption ({:?}), tracking at reduced reliability",
                negotiation
            );
        }
        negotiation
    }
}
