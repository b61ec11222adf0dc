//! End-to-end tracking scenarios over the in-memory fakes.
//!
//! Run with: cargo test --features testing --test tracking_scenarios

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use shuttle_tracker::flags::{FlagStore, MemoryFlagStore, KEY_ACTIVE_DRIVER_ID};
use shuttle_tracker::testing::{
    fix_at, FakeDriverLookup, FakeNotifier, FakePermissions, FakePositionProvider,
    FakePowerManager, MemoryLocationSink, TestHarness,
};
use shuttle_tracker::types::format_timestamp_ms;
use shuttle_tracker::{
    AppLifecycleState, IntervalScheduler, LocationSample, LocationSink, ReconcileOutcome,
    RuntimeStatus, SkipReason, StopOutcome, TickOutcome, TrackingConfig, TrackingManager,
    TrackingPlatform, TrackingTask, WriteStatus,
};

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

// ============================================================================
// Lifecycle
// ============================================================================

#[test]
fn test_start_twice_registers_once() {
    init_logs();
    let h = TestHarness::new();

    let first = h.manager.start("D1").unwrap();
    let second = h.manager.start("D1").unwrap();

    assert!(!first.already_active);
    assert!(second.already_active);
    assert_eq!(h.scheduler.registration_count(), 1);
    assert_eq!(h.scheduler.register_calls(), 1);
    assert!(h.manager.is_running());
}

#[test]
fn test_stop_when_stopped_leaves_state_unchanged() {
    init_logs();
    let h = TestHarness::new();

    assert_eq!(h.manager.stop().unwrap(), StopOutcome::AlreadyStopped);
    assert_eq!(h.manager.stop().unwrap(), StopOutcome::AlreadyStopped);

    let status = h.manager.status();
    assert_eq!(status.status, RuntimeStatus::Stopped);
    assert!(!status.intent.active);
    assert_eq!(h.scheduler.unregister_calls(), 0);
    assert!(!h.notifier.is_visible());
}

#[test]
fn test_start_stop_start_cycle() {
    init_logs();
    let h = TestHarness::new();

    h.manager.start("D1").unwrap();
    assert!(h.notifier.is_visible());
    h.manager.stop().unwrap();
    assert!(!h.manager.is_running());
    assert!(!h.notifier.is_visible());
    assert!(!h.manager.flags().is_active());

    h.manager.start("D1").unwrap();
    assert!(h.manager.is_running());
    assert_eq!(h.scheduler.registration_count(), 1);
}

// ============================================================================
// Trip scenario
// ============================================================================

#[test]
fn test_trip_samples_then_os_kill_and_foreground() {
    init_logs();
    let h = TestHarness::new();
    h.manager.start("D1").unwrap();

    h.position.push_fix(fix_at(-6.2000, 106.8000, 0));
    h.position.push_fix(fix_at(-6.2010, 106.8010, 10_000));
    h.position.push_fix(fix_at(-6.2020, 106.8020, 20_000));
    for _ in 0..3 {
        assert!(h.fire());
    }

    let history = h.sink.history();
    assert_eq!(history.len(), 3);
    assert!(history.iter().all(|r| r.driver_id == "D1"));

    let current = h.sink.current("D1").unwrap();
    assert_eq!(current.record.latitude, -6.2020);
    assert_eq!(current.record.longitude, 106.8020);
    assert_eq!(current.record.timestamp, format_timestamp_ms(20_000));

    // Foreground once while healthy, then leave
    assert!(matches!(
        h.watchdog.on_transition(AppLifecycleState::Active),
        ReconcileOutcome::Healthy
    ));
    h.watchdog.on_transition(AppLifecycleState::Backgrounded);

    // OS drops the callback without telling the app
    h.scheduler.kill(h.task_id());
    assert!(!h.manager.is_running());
    assert_eq!(h.manager.status().status, RuntimeStatus::Suspended);

    let registers = h.scheduler.register_calls();
    let unregisters = h.scheduler.unregister_calls();

    let outcome = h.watchdog.on_transition(AppLifecycleState::Active);
    assert!(matches!(
        outcome,
        ReconcileOutcome::Restarted { ref driver_id, forced: false } if driver_id == "D1"
    ));
    assert_eq!(h.scheduler.register_calls(), registers + 1);
    assert_eq!(h.scheduler.unregister_calls(), unregisters + 1);
    assert!(h.manager.is_running());
    assert_eq!(h.scheduler.registration_count(), 1);

    // Sampling continues after the restart
    assert!(h.fire());
    assert_eq!(h.sink.history_len(), 4);
}

#[test]
fn test_wake_after_long_sleep_restarts_even_when_reported_running() {
    init_logs();
    let h = TestHarness::new();
    h.manager.start("D1").unwrap();

    let t0 = Instant::now();
    h.watchdog.on_transition_at(AppLifecycleState::Active, t0);
    h.watchdog
        .on_transition_at(AppLifecycleState::Inactive, t0 + Duration::from_secs(1));
    h.watchdog
        .on_transition_at(AppLifecycleState::Backgrounded, t0 + Duration::from_secs(2));

    // Starved callback the OS still reports as running
    h.scheduler.kill_but_report_running(h.task_id());
    assert!(h.manager.is_running());
    assert!(!h.fire());

    let outcome = h
        .watchdog
        .on_transition_at(AppLifecycleState::Active, t0 + Duration::from_secs(3_600));
    assert!(matches!(outcome, ReconcileOutcome::Restarted { forced: true, .. }));
    assert!(h.fire());
}

// ============================================================================
// Recovery across processes
// ============================================================================

#[test]
fn test_relaunch_recovers_persisted_intent() {
    init_logs();
    let before = TestHarness::new();
    before.manager.start("D1").unwrap();

    // New process: same durable flags, empty scheduler, fresh manager
    let after = TestHarness::with_store(Arc::clone(&before.store));
    assert!(!after.manager.is_running());
    assert_eq!(after.manager.status().status, RuntimeStatus::Stopped);

    let outcome = after.watchdog.on_transition(AppLifecycleState::Active);
    assert!(matches!(outcome, ReconcileOutcome::Restarted { .. }));
    assert!(after.manager.is_running());
    assert_eq!(after.scheduler.registration_count(), 1);
    assert_eq!(after.scheduler.register_calls(), 1);

    // A second foreground check finds nothing to do
    after.watchdog.on_transition(AppLifecycleState::Backgrounded);
    assert!(matches!(
        after.watchdog.on_transition(AppLifecycleState::Active),
        ReconcileOutcome::Healthy
    ));
    assert_eq!(after.scheduler.register_calls(), 1);
}

#[test]
fn test_relaunch_after_stop_takes_no_action() {
    init_logs();
    let before = TestHarness::new();
    before.manager.start("D1").unwrap();
    before.manager.stop().unwrap();

    let after = TestHarness::with_store(Arc::clone(&before.store));
    let outcome = after.watchdog.on_transition(AppLifecycleState::Active);

    assert!(matches!(outcome, ReconcileOutcome::IntentInactive));
    assert!(!after.manager.is_running());
    assert_eq!(after.scheduler.register_calls(), 0);
    assert_eq!(after.scheduler.unregister_calls(), 0);
}

#[test]
fn test_headless_task_runs_from_persisted_intent() {
    init_logs();
    let before = TestHarness::new();
    before.manager.start("D1").unwrap();

    // OS launches the task in a fresh process before any UI exists
    let after = TestHarness::with_store(Arc::clone(&before.store));
    let outcome = after.manager.task().run();

    assert!(matches!(outcome, TickOutcome::Recorded(ref r) if r.is_complete()));
    assert_eq!(after.sink.current("D1").map(|c| c.record.driver_id), Some("D1".to_string()));
}

// ============================================================================
// Sampling
// ============================================================================

#[test]
fn test_no_identity_skip_writes_nothing() {
    init_logs();
    let h = TestHarness::new();
    h.manager.start("D1").unwrap();

    // Half-cleared pair: active stays set, driver id gone, no session
    h.store.remove(KEY_ACTIVE_DRIVER_ID).unwrap();
    let outcome = h.manager.task().run();

    assert_eq!(outcome, TickOutcome::Skipped(SkipReason::NoDriver));
    assert_eq!(h.sink.write_count(), 0);
    assert_eq!(h.position.call_count(), 0);
}

#[test]
fn test_sampling_is_fail_soft_per_side() {
    init_logs();
    let h = TestHarness::new();
    h.manager.start("D1").unwrap();

    h.sink.fail_history(true);
    let outcome = h.manager.task().run();
    let TickOutcome::Recorded(record) = outcome else {
        panic!("expected a recorded sample, got {:?}", outcome);
    };
    assert!(matches!(record.history, WriteStatus::Failed(_)));
    assert_eq!(record.projection, WriteStatus::Written);
    assert!(h.sink.current("D1").is_some());

    h.sink.fail_history(false);
    h.sink.fail_projection(true);
    h.position.push_fix(fix_at(-6.3, 106.9, 5_000));
    let outcome = h.manager.task().run();
    let TickOutcome::Recorded(record) = outcome else {
        panic!("expected a recorded sample, got {:?}", outcome);
    };
    assert_eq!(record.history, WriteStatus::Written);
    assert!(matches!(record.projection, WriteStatus::Failed(_)));
    assert_eq!(h.sink.history_len(), 1);

    // Tracking keeps running through both failures
    assert!(h.manager.is_running());
}

#[test]
fn test_position_failures_skip_without_stopping() {
    init_logs();
    let h = TestHarness::new();
    h.manager.start("D1").unwrap();

    h.position.set_failing(true);
    assert_eq!(
        h.manager.task().run(),
        TickOutcome::Skipped(SkipReason::FixFailed)
    );

    h.position.set_failing(false);
    assert!(matches!(h.manager.task().run(), TickOutcome::Recorded(_)));
    assert!(h.manager.is_running());
}

#[test]
fn test_overlapping_invocations_each_record() {
    init_logs();
    let h = TestHarness::new();
    h.manager.start("D1").unwrap();
    h.position.push_fix(fix_at(-6.1, 106.1, 1_000));
    h.position.push_fix(fix_at(-6.2, 106.2, 2_000));
    let delay = Duration::from_millis(200);
    h.position.set_delay(delay);

    // OS fires again while the previous invocation is still waiting on a fix
    let started = Instant::now();
    let workers: Vec<_> = (0..2)
        .map(|_| {
            let task = h.manager.task();
            thread::spawn(move || task.run())
        })
        .collect();
    let outcomes: Vec<TickOutcome> = workers
        .into_iter()
        .map(|worker| worker.join().expect("invocation thread panicked"))
        .collect();
    assert!(started.elapsed() < delay * 2);

    for outcome in &outcomes {
        match outcome {
            TickOutcome::Recorded(record) => assert!(record.is_complete()),
            other => panic!("expected a recorded sample, got {:?}", other),
        }
    }
    assert_eq!(h.sink.history_len(), 2);
    assert_eq!(h.sink.write_count(), 3);
    assert_eq!(h.sink.server_clock(), 2);

    let current = h.sink.current("D1").unwrap();
    assert_eq!(current.last_update, 2);
    assert!(h.sink.history().contains(&current.record));
}

#[test]
fn test_projection_follows_latest_write_not_sensor_time() {
    init_logs();
    let h = TestHarness::new();
    let task: Arc<TrackingTask> = h.manager.task();
    h.manager.start("D1").unwrap();

    // Arrive out of sensor order: newer fix first, older fix last
    h.position.push_fix(fix_at(-6.1, 106.1, 30_000));
    h.position.push_fix(fix_at(-6.2, 106.2, 10_000));
    task.run();
    let first = h.sink.current("D1").unwrap();
    task.run();
    let second = h.sink.current("D1").unwrap();

    assert!(second.last_update > first.last_update);
    assert_eq!(second.record.latitude, -6.2);

    // A failed later write never rolls the projection back
    h.sink.fail_projection(true);
    h.position.push_fix(fix_at(-6.3, 106.3, 40_000));
    task.run();
    assert_eq!(h.sink.current("D1").unwrap(), second);
}

#[test]
fn test_direct_sink_writes_are_last_write_wins() {
    let h = TestHarness::new();
    let older = LocationSample::from_fix("D1", &fix_at(-6.0, 106.0, 1_000)).to_record();
    let newer = LocationSample::from_fix("D1", &fix_at(-6.5, 106.5, 2_000)).to_record();

    h.sink.upsert_current(&newer).unwrap();
    h.sink.upsert_current(&older).unwrap();

    assert_eq!(h.sink.current("D1").unwrap().record, older);
    assert_eq!(h.sink.server_clock(), 2);
}

// ============================================================================
// In-process scheduler
// ============================================================================

#[test]
fn test_interval_scheduler_drives_sampling() {
    init_logs();
    let scheduler = Arc::new(IntervalScheduler::new());
    let sink = Arc::new(MemoryLocationSink::new());
    let platform = TrackingPlatform {
        scheduler: scheduler.clone(),
        permissions: Arc::new(FakePermissions::granted()),
        power: Arc::new(FakePowerManager::exempt()),
        position: Arc::new(FakePositionProvider::with_fix(fix_at(-6.2, 106.8, 0))),
        notifier: Arc::new(FakeNotifier::new()),
    };
    let manager = TrackingManager::new(
        TrackingConfig::default(),
        platform,
        Arc::new(MemoryFlagStore::new()),
        Arc::new(FakeDriverLookup::signed_out()),
        sink.clone(),
    );

    manager.start("D1").unwrap();
    assert!(manager.is_running());

    // The worker samples once right away, then every cadence
    let deadline = Instant::now() + Duration::from_secs(5);
    while sink.history_len() == 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(sink.history_len() >= 1);
    assert!(sink.current("D1").is_some());

    manager.stop().unwrap();
    assert!(!manager.is_running());
}
