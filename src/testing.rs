//! In-memory fakes for every platform capability and remote collaborator.
//!
//! Compiled for unit tests and behind the `testing` feature for the
//! integration tests under `tests/`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use crate::config::TrackingConfig;
use crate::error::{Result, TrackingError};
use crate::flags::{FlagStore, MemoryFlagStore};
use crate::identity::DriverLookup;
use crate::manager::TrackingManager;
use crate::pipeline::LocationSink;
use crate::platform::{
    BackgroundScheduler, LocationPermissions, PermissionScope, PermissionStatus, PositionProvider,
    PowerExemption, PowerManager, StatusNotifier, TaskHandler, TrackingPlatform,
};
use crate::types::{LocationRecord, PositionFix};
use crate::watchdog::Watchdog;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Build a fix at the given position and sensor time.
pub fn fix_at(latitude: f64, longitude: f64, timestamp_ms: i64) -> PositionFix {
    PositionFix {
        latitude,
        longitude,
        accuracy_meters: 8.0,
        speed_mps: Some(11.0),
        heading_degrees: Some(180.0),
        timestamp_ms,
    }
}

// ============================================================================
// Scheduler
// ============================================================================

struct FakeRegistration {
    cadence: Duration,
    handler: TaskHandler,
}

/// Scheduler that only runs handlers when told to via [`FakeScheduler::fire`].
#[derive(Default)]
pub struct FakeScheduler {
    tasks: Mutex<HashMap<String, FakeRegistration>>,
    /// Killed tasks the OS still reports as registered
    stale: Mutex<HashSet<String>>,
    register_calls: AtomicU32,
    unregister_calls: AtomicU32,
    fail_register: AtomicBool,
}

impl FakeScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Invoke a registered handler once. Returns false if nothing is registered.
    pub fn fire(&self, task_id: &str) -> bool {
        let handler = lock(&self.tasks)
            .get(task_id)
            .map(|r| Arc::clone(&r.handler));
        match handler {
            Some(handler) => {
                handler();
                true
            }
            None => false,
        }
    }

    /// OS discards the task without telling the app.
    pub fn kill(&self, task_id: &str) {
        lock(&self.tasks).remove(task_id);
    }

    /// OS starves the task but keeps reporting it as registered.
    pub fn kill_but_report_running(&self, task_id: &str) {
        lock(&self.tasks).remove(task_id);
        lock(&self.stale).insert(task_id.to_string());
    }

    pub fn registration_count(&self) -> usize {
        lock(&self.tasks).len()
    }

    pub fn cadence(&self, task_id: &str) -> Option<Duration> {
        lock(&self.tasks).get(task_id).map(|r| r.cadence)
    }

    pub fn register_calls(&self) -> u32 {
        self.register_calls.load(Ordering::SeqCst)
    }

    pub fn unregister_calls(&self) -> u32 {
        self.unregister_calls.load(Ordering::SeqCst)
    }

    pub fn set_fail_register(&self, fail: bool) {
        self.fail_register.store(fail, Ordering::SeqCst);
    }
}

impl BackgroundScheduler for FakeScheduler {
    fn register(&self, task_id: &str, cadence: Duration, handler: TaskHandler) -> Result<()> {
        self.register_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_register.load(Ordering::SeqCst) {
            return Err(TrackingError::Scheduler {
                message: "registration rejected".to_string(),
            });
        }
        lock(&self.stale).remove(task_id);
        lock(&self.tasks).insert(task_id.to_string(), FakeRegistration { cadence, handler });
        Ok(())
    }

    fn unregister(&self, task_id: &str) -> Result<()> {
        self.unregister_calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.stale).remove(task_id);
        lock(&self.tasks).remove(task_id);
        Ok(())
    }

    fn is_registered(&self, task_id: &str) -> bool {
        lock(&self.tasks).contains_key(task_id) || lock(&self.stale).contains(task_id)
    }
}

// ============================================================================
// Permissions
// ============================================================================

pub struct FakePermissions {
    statuses: Mutex<HashMap<PermissionScope, PermissionStatus>>,
    grant_on_request: AtomicBool,
    requests: AtomicU32,
}

impl FakePermissions {
    pub fn granted() -> Self {
        let fake = Self::undetermined(true);
        fake.set(PermissionScope::Foreground, PermissionStatus::Granted);
        fake.set(PermissionScope::Background, PermissionStatus::Granted);
        fake
    }

    /// Nothing asked yet; `request` answers with `grant_on_request`.
    pub fn undetermined(grant_on_request: bool) -> Self {
        Self {
            statuses: Mutex::new(HashMap::new()),
            grant_on_request: AtomicBool::new(grant_on_request),
            requests: AtomicU32::new(0),
        }
    }

    pub fn set(&self, scope: PermissionScope, status: PermissionStatus) {
        lock(&self.statuses).insert(scope, status);
    }

    pub fn revoke_all(&self) {
        self.grant_on_request.store(false, Ordering::SeqCst);
        self.set(PermissionScope::Foreground, PermissionStatus::Denied);
        self.set(PermissionScope::Background, PermissionStatus::Denied);
    }

    pub fn request_count(&self) -> u32 {
        self.requests.load(Ordering::SeqCst)
    }
}

impl LocationPermissions for FakePermissions {
    fn status(&self, scope: PermissionScope) -> PermissionStatus {
        lock(&self.statuses)
            .get(&scope)
            .copied()
            .unwrap_or(PermissionStatus::Undetermined)
    }

    fn request(&self, scope: PermissionScope) -> PermissionStatus {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let answer = if self.grant_on_request.load(Ordering::SeqCst) {
            PermissionStatus::Granted
        } else {
            PermissionStatus::Denied
        };
        self.set(scope, answer);
        answer
    }
}

// ============================================================================
// Power Management
// ============================================================================

pub struct FakePowerManager {
    exempt: AtomicBool,
    answer: Mutex<PowerExemption>,
    /// Simulates a dialog the user never dismisses
    delay: Mutex<Duration>,
    requests: AtomicU32,
}

impl FakePowerManager {
    pub fn answering(answer: PowerExemption) -> Self {
        Self {
            exempt: AtomicBool::new(false),
            answer: Mutex::new(answer),
            delay: Mutex::new(Duration::ZERO),
            requests: AtomicU32::new(0),
        }
    }

    pub fn exempt() -> Self {
        let fake = Self::answering(PowerExemption::Granted);
        fake.exempt.store(true, Ordering::SeqCst);
        fake
    }

    pub fn set_delay(&self, delay: Duration) {
        *lock(&self.delay) = delay;
    }

    pub fn request_count(&self) -> u32 {
        self.requests.load(Ordering::SeqCst)
    }
}

impl PowerManager for FakePowerManager {
    fn is_exempt(&self) -> bool {
        self.exempt.load(Ordering::SeqCst)
    }

    fn request_exemption(&self) -> PowerExemption {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let delay = *lock(&self.delay);
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        let answer = *lock(&self.answer);
        if answer == PowerExemption::Granted {
            self.exempt.store(true, Ordering::SeqCst);
        }
        answer
    }
}

// ============================================================================
// Position
// ============================================================================

/// Serves queued fixes first, then the fallback fix (if any).
#[derive(Default)]
pub struct FakePositionProvider {
    queue: Mutex<VecDeque<PositionFix>>,
    fallback: Mutex<Option<PositionFix>>,
    delay: Mutex<Duration>,
    failing: AtomicBool,
    calls: AtomicU32,
}

impl FakePositionProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fix(fix: PositionFix) -> Self {
        let fake = Self::new();
        *lock(&fake.fallback) = Some(fix);
        fake
    }

    pub fn push_fix(&self, fix: PositionFix) {
        lock(&self.queue).push_back(fix);
    }

    pub fn set_delay(&self, delay: Duration) {
        *lock(&self.delay) = delay;
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl PositionProvider for FakePositionProvider {
    fn current_position(&self) -> Result<Option<PositionFix>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *lock(&self.delay);
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(TrackingError::Platform {
                message: "location services unavailable".to_string(),
            });
        }
        if let Some(fix) = lock(&self.queue).pop_front() {
            return Ok(Some(fix));
        }
        Ok(lock(&self.fallback).clone())
    }
}

// ============================================================================
// Notification
// ============================================================================

#[derive(Default)]
pub struct FakeNotifier {
    visible: AtomicBool,
    shows: AtomicU32,
}

impl FakeNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_visible(&self) -> bool {
        self.visible.load(Ordering::SeqCst)
    }

    pub fn show_count(&self) -> u32 {
        self.shows.load(Ordering::SeqCst)
    }
}

impl StatusNotifier for FakeNotifier {
    fn show(&self, _title: &str, _body: &str) -> Result<()> {
        self.shows.fetch_add(1, Ordering::SeqCst);
        self.visible.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn hide(&self) -> Result<()> {
        self.visible.store(false, Ordering::SeqCst);
        Ok(())
    }
}

// ============================================================================
// Location Sink
// ============================================================================

/// Projection row as the server would hold it.
#[derive(Debug, Clone, PartialEq)]
pub struct CurrentPosition {
    pub record: LocationRecord,
    /// Server clock at the time of the write
    pub last_update: u64,
}

/// Sink with a monotonic "server clock" and per-side failure injection.
#[derive(Default)]
pub struct MemoryLocationSink {
    history: Mutex<Vec<LocationRecord>>,
    current: Mutex<HashMap<String, CurrentPosition>>,
    clock: AtomicU64,
    fail_history: AtomicBool,
    fail_projection: AtomicBool,
}

impl MemoryLocationSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_history(&self, fail: bool) {
        self.fail_history.store(fail, Ordering::SeqCst);
    }

    pub fn fail_projection(&self, fail: bool) {
        self.fail_projection.store(fail, Ordering::SeqCst);
    }

    pub fn history(&self) -> Vec<LocationRecord> {
        lock(&self.history).clone()
    }

    pub fn history_len(&self) -> usize {
        lock(&self.history).len()
    }

    pub fn current(&self, driver_id: &str) -> Option<CurrentPosition> {
        lock(&self.current).get(driver_id).cloned()
    }

    pub fn server_clock(&self) -> u64 {
        self.clock.load(Ordering::SeqCst)
    }

    pub fn write_count(&self) -> usize {
        self.history_len() + lock(&self.current).len()
    }
}

impl LocationSink for MemoryLocationSink {
    fn append_history(&self, record: &LocationRecord) -> Result<()> {
        if self.fail_history.load(Ordering::SeqCst) {
            return Err(TrackingError::Sink {
                message: "history insert failed".to_string(),
                status_code: Some(503),
            });
        }
        lock(&self.history).push(record.clone());
        Ok(())
    }

    fn upsert_current(&self, record: &LocationRecord) -> Result<()> {
        if self.fail_projection.load(Ordering::SeqCst) {
            return Err(TrackingError::Sink {
                message: "projection upsert failed".to_string(),
                status_code: Some(503),
            });
        }
        let mut current = lock(&self.current);
        let last_update = self.clock.fetch_add(1, Ordering::SeqCst) + 1;
        current.insert(
            record.driver_id.clone(),
            CurrentPosition {
                record: record.clone(),
                last_update,
            },
        );
        Ok(())
    }
}

// ============================================================================
// Driver Lookup
// ============================================================================

#[derive(Default)]
pub struct FakeDriverLookup {
    session_user: Mutex<Option<String>>,
    drivers: Mutex<HashMap<String, String>>,
    failing: AtomicBool,
    session_calls: AtomicU32,
}

impl FakeDriverLookup {
    pub fn signed_out() -> Self {
        Self::default()
    }

    pub fn with_driver(user_id: &str, driver_id: &str) -> Self {
        let fake = Self::default();
        *lock(&fake.session_user) = Some(user_id.to_string());
        lock(&fake.drivers).insert(user_id.to_string(), driver_id.to_string());
        fake
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of session lookups (network round-trips) made so far.
    pub fn lookup_count(&self) -> u32 {
        self.session_calls.load(Ordering::SeqCst)
    }
}

impl DriverLookup for FakeDriverLookup {
    fn session_user_id(&self) -> Result<Option<String>> {
        self.session_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(TrackingError::Identity {
                message: "auth service unreachable".to_string(),
            });
        }
        Ok(lock(&self.session_user).clone())
    }

    fn driver_id_for_user(&self, user_id: &str) -> Result<Option<String>> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(TrackingError::Identity {
                message: "drivers table unreachable".to_string(),
            });
        }
        Ok(lock(&self.drivers).get(user_id).cloned())
    }
}

// ============================================================================
// Harness
// ============================================================================

/// A manager and watchdog wired to fakes, with handles to every fake.
pub struct TestHarness {
    pub config: TrackingConfig,
    pub store: Arc<dyn FlagStore>,
    pub scheduler: Arc<FakeScheduler>,
    pub permissions: Arc<FakePermissions>,
    pub power: Arc<FakePowerManager>,
    pub position: Arc<FakePositionProvider>,
    pub notifier: Arc<FakeNotifier>,
    pub sink: Arc<MemoryLocationSink>,
    pub lookup: Arc<FakeDriverLookup>,
    pub manager: Arc<TrackingManager>,
    pub watchdog: Watchdog,
}

impl TestHarness {
    /// Everything granted, a fix always available, no session.
    pub fn new() -> Self {
        Self::with_store(Arc::new(MemoryFlagStore::new()))
    }

    /// Same as [`TestHarness::new`] over an existing store, e.g. to simulate
    /// a relaunch that finds a previous process's flags.
    pub fn with_store(store: Arc<dyn FlagStore>) -> Self {
        Self::build(
            TrackingConfig::default(),
            store,
            Arc::new(FakePermissions::granted()),
            Arc::new(FakePowerManager::exempt()),
        )
    }

    pub fn build(
        config: TrackingConfig,
        store: Arc<dyn FlagStore>,
        permissions: Arc<FakePermissions>,
        power: Arc<FakePowerManager>,
    ) -> Self {
        let scheduler = Arc::new(FakeScheduler::new());
        let position = Arc::new(FakePositionProvider::with_fix(fix_at(-6.2, 106.8, 0)));
        let notifier = Arc::new(FakeNotifier::new());
        let sink = Arc::new(MemoryLocationSink::new());
        let lookup = Arc::new(FakeDriverLookup::signed_out());

        let platform = TrackingPlatform {
            scheduler: scheduler.clone(),
            permissions: permissions.clone(),
            power: power.clone(),
            position: position.clone(),
            notifier: notifier.clone(),
        };
        let manager = Arc::new(TrackingManager::new(
            config.clone(),
            platform,
            store.clone(),
            lookup.clone(),
            sink.clone(),
        ));
        let watchdog = Watchdog::new(Arc::clone(&manager));

        Self {
            config,
            store,
            scheduler,
            permissions,
            power,
            position,
            notifier,
            sink,
            lookup,
            manager,
            watchdog,
        }
    }

    pub fn task_id(&self) -> &str {
        &self.config.task_id
    }

    /// Fire the registered periodic task once, as the OS would.
    pub fn fire(&self) -> bool {
        self.scheduler.fire(&self.config.task_id)
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
