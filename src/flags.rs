//! Persisted flag store.
//!
//! A tiny durable key/value store holding the tracking intent. Writes are
//! atomic per key only; readers must tolerate half-written pairs (for
//! example `trackingActive=true` with no driver right after sign-out) and
//! treat them as "not trackable".

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::warn;

use crate::error::Result;
use crate::types::TrackingIntent;

/// Key holding `"true"` / `"false"`.
pub const KEY_TRACKING_ACTIVE: &str = "trackingActive";
/// Key holding the driver id being tracked.
pub const KEY_ACTIVE_DRIVER_ID: &str = "activeDriverId";

/// Durable, process-independent key/value storage.
pub trait FlagStore: Send + Sync {
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn remove(&self, key: &str) -> Result<()>;
}

/// Non-durable store for tests and hosts without a writable disk.
#[derive(Debug, Default)]
pub struct MemoryFlagStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryFlagStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FlagStore for MemoryFlagStore {
    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        let values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        Ok(values.get(key).cloned())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        values.remove(key);
        Ok(())
    }
}

/// Typed view of the tracking keys on top of any [`FlagStore`].
#[derive(Clone)]
pub struct TrackingFlags {
    store: Arc<dyn FlagStore>,
}

impl TrackingFlags {
    pub fn new(store: Arc<dyn FlagStore>) -> Self {
        Self { store }
    }

    /// Read the persisted intent. A store failure reads as inactive.
    pub fn read_intent(&self) -> TrackingIntent {
        let active = match self.store.get(KEY_TRACKING_ACTIVE) {
            Ok(Some(value)) => parse_bool(&value),
            Ok(None) => false,
            Err(e) => {
                warn!("[Flags] Failed to read {}: {}", KEY_TRACKING_ACTIVE, e);
                false
            }
        };
        TrackingIntent {
            driver_id: self.active_driver_id(),
            active,
        }
    }

    /// Persist an active intent. The driver id goes first so a reader never
    /// sees `active=true` paired with a previous driver.
    pub fn write_intent(&self, driver_id: &str) -> Result<()> {
        self.store.set(KEY_ACTIVE_DRIVER_ID, driver_id)?;
        self.store.set(KEY_TRACKING_ACTIVE, "true")
    }

    /// Mark the intent inactive, then forget the driver.
    pub fn clear_intent(&self) -> Result<()> {
        self.store.set(KEY_TRACKING_ACTIVE, "false")?;
        self.store.remove(KEY_ACTIVE_DRIVER_ID)
    }

    pub fn is_active(&self) -> bool {
        self.read_intent().active
    }

    /// The cached driver id, ignoring blank values.
    pub fn active_driver_id(&self) -> Option<String> {
        match self.store.get(KEY_ACTIVE_DRIVER_ID) {
            Ok(value) => value.filter(|id| !id.trim().is_empty()),
            Err(e) => {
                warn!("[Flags] Failed to read {}: {}", KEY_ACTIVE_DRIVER_ID, e);
                None
            }
        }
    }

    /// Cache a resolved driver id without touching the active flag.
    pub fn cache_driver_id(&self, driver_id: &str) -> Result<()> {
        self.store.set(KEY_ACTIVE_DRIVER_ID, driver_id)
    }
}

fn parse_bool(value: &str) -> bool {
    match value.trim() {
        "true" | "1" => true,
        "false" | "0" | "" => false,
        other => {
            warn!(
                "[Flags] Unexpected {} value {:?}, treating as false",
                KEY_TRACKING_ACTIVE, other
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flags() -> (Arc<MemoryFlagStore>, TrackingFlags) {
        let store = Arc::new(MemoryFlagStore::new());
        let flags = TrackingFlags::new(store.clone());
        (store, flags)
    }

    #[test]
    fn test_empty_store_is_inactive() {
        let (_, flags) = flags();
        assert_eq!(flags.read_intent(), TrackingIntent::default());
    }

    #[test]
    fn test_write_and_clear_intent() {
        let (store, flags) = flags();
        flags.write_intent("D1").unwrap();
        let intent = flags.read_intent();
        assert!(intent.active);
        assert_eq!(intent.trackable_driver(), Some("D1"));

        flags.clear_intent().unwrap();
        assert!(!flags.is_active());
        assert_eq!(store.get(KEY_ACTIVE_DRIVER_ID).unwrap(), None);
        assert_eq!(
            store.get(KEY_TRACKING_ACTIVE).unwrap().as_deref(),
            Some("false")
        );
    }

    #[test]
    fn test_stale_combination_not_trackable() {
        let (store, flags) = flags();
        store.set(KEY_TRACKING_ACTIVE, "true").unwrap();
        let intent = flags.read_intent();
        assert!(intent.active);
        assert_eq!(intent.trackable_driver(), None);
    }

    #[test]
    fn test_garbage_flag_reads_false() {
        let (store, flags) = flags();
        store.set(KEY_TRACKING_ACTIVE, "yes please").unwrap();
        store.set(KEY_ACTIVE_DRIVER_ID, "   ").unwrap();
        assert!(!flags.is_active());
        assert_eq!(flags.active_driver_id(), None);
    }
}
