//! # Shuttle Tracker
//!
//! Background driver location tracking for a shuttle fleet app.
//!
//! This library provides:
//! - A periodic background task that samples the device position and writes
//!   it to an append-only history and a per-driver current-position row
//! - A durable tracking intent (the driver's wish to be tracked) that
//!   survives app kills
//! - A lifecycle watchdog that detects drift between the intent and what the
//!   OS scheduler is actually running, and restarts tracking
//!
//! Platform capabilities (scheduler, permissions, power management, position,
//! notification) are traits; the mobile hosts implement them over FFI.
//!
//! ## Features
//!
//! - **`persistence`** - Durable flag store backed by SQLite
//! - **`http`** - Remote store client for the hosted backend
//! - **`ffi`** - FFI bindings for mobile platforms (iOS/Android)
//! - **`testing`** - In-memory fakes for every platform capability
//! - **`full`** - Enable all features
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use shuttle_tracker::{TrackingConfig, TrackingManager, Watchdog, AppLifecycleState};
//!
//! let manager = Arc::new(TrackingManager::new(
//!     TrackingConfig::default(),
//!     platform,
//!     flag_store,
//!     driver_lookup,
//!     location_sink,
//! ));
//! manager.start("driver-42")?;
//!
//! let watchdog = Watchdog::new(Arc::clone(&manager));
//! watchdog.on_transition(AppLifecycleState::Active);
//! ```

use std::time::Instant;

// Unified error handling
pub mod error;
pub use error::{Result, TrackingError};

// Tunables (cadence, timeouts, wake threshold)
pub mod config;
pub use config::TrackingConfig;

// Intent, position fix, sample and wire record
pub mod types;
pub use types::{LocationRecord, LocationSample, PositionFix, TrackingIntent};

// Durable key-value flags holding the tracking intent
pub mod flags;
pub use flags::{FlagStore, MemoryFlagStore, TrackingFlags};

// Platform capability traits
pub mod platform;
pub use platform::{
    BackgroundScheduler, LocationPermissions, PermissionScope, PermissionStatus, PositionProvider,
    PowerExemption, PowerManager, StatusNotifier, TaskHandler, TrackingPlatform,
};

// Driver identity resolution for the background task
pub mod identity;
pub use identity::{DriverLookup, IdentityResolver};

// Dual-write of samples (history + current position)
pub mod pipeline;
pub use pipeline::{LocationPipeline, LocationSink, RecordOutcome, WriteStatus};

// Tracking lifecycle and the periodic task body
pub mod manager;
pub use manager::{
    PowerNegotiation, RuntimeStatus, SkipReason, StartOutcome, StopOutcome, TickOutcome,
    TrackingManager, TrackingState, TrackingStatus, TrackingTask,
};

// Drift detection and self-healing on app lifecycle transitions
pub mod watchdog;
pub use watchdog::{AppLifecycleState, ReconcileOutcome, Transition, Watchdog, WatchdogAction};

// In-process interval scheduler
pub mod scheduler;
pub use scheduler::IntervalScheduler;

// SQLite-backed flag store
#[cfg(feature = "persistence")]
pub mod persistence;
#[cfg(feature = "persistence")]
pub use persistence::SqliteFlagStore;

// Remote store client
#[cfg(feature = "http")]
pub mod http;
#[cfg(feature = "http")]
pub use http::{RemoteStore, RemoteStoreConfig};

// Mobile bindings
#[cfg(feature = "ffi")]
pub mod ffi;

// In-memory fakes
#[cfg(any(test, feature = "testing"))]
pub mod testing;

#[cfg(feature = "ffi")]
uniffi::setup_scaffolding!();

/// Initialize logging for Android (only used in FFI)
#[cfg(all(feature = "ffi", target_os = "android"))]
pub(crate) fn init_logging() {
    use android_logger::Config;
    use log::LevelFilter;

    android_logger::init_once(
        Config::default()
            .with_max_level(LevelFilter::Debug)
            .with_tag("ShuttleTrackerRust"),
    );
}

/// Initialize unified logging for iOS (only used in FFI)
#[cfg(all(feature = "ffi", target_os = "ios"))]
pub(crate) fn init_logging() {
    use log::LevelFilter;
    use std::sync::Once;

    static INIT: Once = Once::new();
    INIT.call_once(|| {
        // Fails only if another logger is already installed
        let _ = oslog::OsLogger::new("com.shuttle.tracker")
            .level_filter(LevelFilter::Debug)
            .init();
    });
}

#[cfg(all(feature = "ffi", not(any(target_os = "android", target_os = "ios"))))]
pub(crate) fn init_logging() {
    // No-op on desktop
}

/// Milliseconds since `start`, for timing logs.
pub(crate) fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}
