//! In-process interval scheduler.
//!
//! For hosts where the Rust side owns the timer (an Android foreground
//! service, desktop runs). Each task gets one worker thread that runs the
//! handler immediately and then once per cadence until unregistered. A task
//! whose worker thread has died reports as not registered.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, info};

use crate::error::{Result, TrackingError};
use crate::platform::{BackgroundScheduler, TaskHandler};

struct Worker {
    /// Dropping the sender wakes the worker and ends it
    _shutdown: Sender<()>,
    handle: JoinHandle<()>,
}

#[derive(Default)]
pub struct IntervalScheduler {
    workers: Mutex<HashMap<String, Worker>>,
}

impl IntervalScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_workers(&self) -> MutexGuard<'_, HashMap<String, Worker>> {
        self.workers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl BackgroundScheduler for IntervalScheduler {
    fn register(&self, task_id: &str, cadence: Duration, handler: TaskHandler) -> Result<()> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let name = task_id.to_string();

        let handle = thread::Builder::new()
            .name(format!("tracking-task-{}", task_id))
            .spawn(move || {
                info!("[IntervalScheduler] Task {} started", name);
                loop {
                    if panic::catch_unwind(AssertUnwindSafe(|| handler())).is_err() {
                        error!("[IntervalScheduler] Task {} handler panicked", name);
                    }
                    match shutdown_rx.recv_timeout(cadence) {
                        Err(RecvTimeoutError::Timeout) => continue,
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                info!("[IntervalScheduler] Task {} stopped", name);
            })
            .map_err(|e| TrackingError::Scheduler {
                message: format!("failed to spawn worker for {}: {}", task_id, e),
            })?;

        // Replacing drops the previous sender, which ends the previous worker
        let previous = self.lock_workers().insert(
            task_id.to_string(),
            Worker {
                _shutdown: shutdown_tx,
                handle,
            },
        );
        if previous.is_some() {
            debug!("[IntervalScheduler] Replaced existing task {}", task_id);
        }
        Ok(())
    }

    fn unregister(&self, task_id: &str) -> Result<()> {
        // Not joined: the handler may be mid-sample, and the in-flight write
        // is allowed to finish.
        if self.lock_workers().remove(task_id).is_some() {
            debug!("[IntervalScheduler] Unregistered task {}", task_id);
        }
        Ok(())
    }

    fn is_registered(&self, task_id: &str) -> bool {
        self.lock_workers()
            .get(task_id)
            .map(|w| !w.handle.is_finished())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Instant;

    fn counting_handler(counter: &Arc<AtomicU32>) -> TaskHandler {
        let counter = Arc::clone(counter);
        Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn wait_until(deadline: Duration, condition: impl Fn() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    #[test]
    fn test_runs_on_cadence_until_unregistered() {
        let scheduler = IntervalScheduler::new();
        let counter = Arc::new(AtomicU32::new(0));
        scheduler
            .register("t", Duration::from_millis(10), counting_handler(&counter))
            .unwrap();
        assert!(scheduler.is_registered("t"));
        assert!(wait_until(Duration::from_secs(2), || counter.load(Ordering::SeqCst) >= 3));

        scheduler.unregister("t").unwrap();
        assert!(!scheduler.is_registered("t"));
        thread::sleep(Duration::from_millis(50));
        let settled = counter.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(counter.load(Ordering::SeqCst), settled);
    }

    #[test]
    fn test_register_replaces_existing() {
        let scheduler = IntervalScheduler::new();
        let first = Arc::new(AtomicU32::new(0));
        let second = Arc::new(AtomicU32::new(0));
        scheduler
            .register("t", Duration::from_millis(10), counting_handler(&first))
            .unwrap();
        scheduler
            .register("t", Duration::from_millis(10), counting_handler(&second))
            .unwrap();

        thread::sleep(Duration::from_millis(50));
        let first_settled = first.load(Ordering::SeqCst);
        assert!(wait_until(Duration::from_secs(2), || second.load(Ordering::SeqCst) >= 3));
        assert_eq!(first.load(Ordering::SeqCst), first_settled);
        scheduler.unregister("t").unwrap();
    }

    #[test]
    fn test_panicking_handler_keeps_running() {
        let scheduler = IntervalScheduler::new();
        let counter = Arc::new(AtomicU32::new(0));
        let inner = Arc::clone(&counter);
        let handler: TaskHandler = Arc::new(move || {
            inner.fetch_add(1, Ordering::SeqCst);
            panic!("sample failed");
        });
        scheduler
            .register("t", Duration::from_millis(10), handler)
            .unwrap();

        assert!(wait_until(Duration::from_secs(2), || counter.load(Ordering::SeqCst) >= 2));
        assert!(scheduler.is_registered("t"));
        scheduler.unregister("t").unwrap();
    }

    #[test]
    fn test_unknown_task_unregister_is_noop() {
        let scheduler = IntervalScheduler::new();
        assert!(scheduler.unregister("missing").is_ok());
        assert!(!scheduler.is_registered("missing"));
    }
}
