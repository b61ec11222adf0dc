//! # App Lifecycle Watchdog
//!
//! Repairs drift between the persisted tracking intent and the scheduler's
//! actual registration. Runs on app lifecycle transitions; keeps no state
//! across processes and re-derives everything from the flag store and
//! [`TrackingManager::is_running`].
//!
//! ## Transition table
//!
//! | previous                | next          | transition | action             |
//! |-------------------------|---------------|------------|--------------------|
//! | none (fresh process)    | Active        | Launch     | verify, restart    |
//! | Inactive / Backgrounded | Active        | Foreground | verify, restart    |
//! | same, away >= threshold | Active        | Wake       | restart always     |
//! | Active                  | Active        | Unchanged  | none               |
//! | any                     | Inactive/Bg   | Leave      | none               |
//!
//! A wake is treated as suspect even when the scheduler says the task is
//! registered: some platforms report a starved task as running.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

use crate::error::TrackingError;
use crate::flags::TrackingFlags;
use crate::manager::TrackingManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ffi", derive(uniffi::Enum))]
pub enum AppLifecycleState {
    Active,
    Inactive,
    Backgrounded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// First observed state of this process is Active
    Launch,
    /// Ordinary return to the foreground
    Foreground,
    /// Return to the foreground after a long time away
    Wake,
    /// App left the foreground
    Leave,
    Unchanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogAction {
    None,
    /// Restart only if the scheduler reports the task missing
    VerifyAndRestart,
    /// Restart regardless of what the scheduler reports
    ForceRestart,
}

/// Classify a lifecycle transition. `time_away` is how long the app has
/// been out of the Active state, if it ever left it in this process.
pub fn classify_transition(
    previous: Option<AppLifecycleState>,
    next: AppLifecycleState,
    time_away: Option<Duration>,
    wake_threshold: Duration,
) -> Transition {
    use AppLifecycleState::*;

    match (previous, next) {
        (Some(prev), next) if prev == next => Transition::Unchanged,
        (_, Inactive) | (_, Backgrounded) => Transition::Leave,
        (None, Active) => Transition::Launch,
        (Some(Inactive), Active) | (Some(Backgrounded), Active) => match time_away {
            Some(away) if away >= wake_threshold => Transition::Wake,
            _ => Transition::Foreground,
        },
        (Some(Active), Active) => Transition::Unchanged,
    }
}

pub fn reconcile_action(transition: Transition) -> WatchdogAction {
    match transition {
        Transition::Launch | Transition::Foreground => WatchdogAction::VerifyAndRestart,
        Transition::Wake => WatchdogAction::ForceRestart,
        Transition::Leave | Transition::Unchanged => WatchdogAction::None,
    }
}

/// What a lifecycle event led to.
#[derive(Debug, Clone)]
pub enum ReconcileOutcome {
    /// Transition needs no check (leaving foreground, repeated state)
    NoAction,
    /// Intent says tracking should not run
    IntentInactive,
    /// Intent active but no driver id persisted; treated as not trackable
    Untrackable,
    /// Tracking is registered as it should be
    Healthy,
    Restarted {
        driver_id: String,
        forced: bool,
    },
    Failed {
        error: TrackingError,
        consecutive_failures: u32,
    },
}

#[derive(Debug, Default)]
struct LifecycleMemory {
    previous: Option<AppLifecycleState>,
    left_active_at: Option<Instant>,
    consecutive_failures: u32,
}

pub struct Watchdog {
    manager: Arc<TrackingManager>,
    flags: TrackingFlags,
    wake_threshold: Duration,
    escalation_threshold: u32,
    memory: Mutex<LifecycleMemory>,
}

impl Watchdog {
    pub fn new(manager: Arc<TrackingManager>) -> Self {
        let flags = manager.flags().clone();
        let wake_threshold = manager.config().wake_threshold();
        let escalation_threshold = manager.config().escalation_threshold;
        Self {
            manager,
            flags,
            wake_threshold,
            escalation_threshold,
            memory: Mutex::new(LifecycleMemory::default()),
        }
    }

    fn lock_memory(&self) -> MutexGuard<'_, LifecycleMemory> {
        self.memory.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn on_transition(&self, next: AppLifecycleState) -> ReconcileOutcome {
        self.on_transition_at(next, Instant::now())
    }

    /// Feed one observed lifecycle state, at an explicit instant.
    pub fn on_transition_at(&self, next: AppLifecycleState, now: Instant) -> ReconcileOutcome {
        let transition = {
            let mut memory = self.lock_memory();
            let time_away = memory
                .left_active_at
                .map(|left| now.saturating_duration_since(left));
            let transition =
                classify_transition(memory.previous, next, time_away, self.wake_threshold);

            match next {
                AppLifecycleState::Active => memory.left_active_at = None,
                _ => {
                    // Inactive -> Backgrounded keeps the original departure time
                    if memory.left_active_at.is_none() {
                        memory.left_active_at = Some(now);
                    }
                }
            }
            memory.previous = Some(next);
            transition
        };

        debug!("[Watchdog] {:?} -> {:?}", next, transition);
        match reconcile_action(transition) {
            WatchdogAction::None => ReconcileOutcome::NoAction,
            WatchdogAction::VerifyAndRestart => self.reconcile(false),
            WatchdogAction::ForceRestart => self.reconcile(true),
        }
    }

    /// Compare intent with the scheduler and restart tracking on drift.
    ///
    /// A restart is a full teardown + `start()`: a bare re-register can leave
    /// some schedulers in a half-alive state. The intent survives a failed
    /// restart so the next foreground retries.
    pub fn reconcile(&self, force: bool) -> ReconcileOutcome {
        let intent = self.flags.read_intent();
        if !intent.active {
            return ReconcileOutcome::IntentInactive;
        }
        let Some(driver_id) = intent.trackable_driver().map(str::to_string) else {
            warn!("[Watchdog] Tracking intent active without a driver id, not trackable");
            return ReconcileOutcome::Untrackable;
        };

        let running = self.manager.is_running();
        if running && !force {
            self.lock_memory().consecutive_failures = 0;
            return ReconcileOutcome::Healthy;
        }

        if running {
            info!(
                "[Watchdog] Woken from sleep, restarting tracking for {} unconditionally",
                driver_id
            );
        } else {
            warn!(
                "[Watchdog] Drift detected: tracking for {} should run but is not registered",
                driver_id
            );
        }

        match self.manager.restart(&driver_id) {
            Ok(_) => {
                self.lock_memory().consecutive_failures = 0;
                info!("[Watchdog] Tracking restarted for {}", driver_id);
                ReconcileOutcome::Restarted {
                    driver_id,
                    forced: force,
                }
            }
            Err(e) => {
                let consecutive_failures = {
                    let mut memory = self.lock_memory();
                    memory.consecutive_failures += 1;
                    memory.consecutive_failures
                };
                if consecutive_failures >= self.escalation_threshold {
                    error!(
                        "[Watchdog] Reconciliation for {} failed {} times in a row: {}",
                        driver_id, consecutive_failures, e
                    );
                } else {
                    warn!(
                        "[Watchdog] Reconciliation for {} failed: {}",
                        driver_id, e
                    );
                }
                ReconcileOutcome::Failed {
                    error: e,
                    consecutive_failures,
                }
            }
        }
    }
}
