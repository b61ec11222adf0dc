//! Driver identity resolution for the background callback.
//!
//! The callback can run before the app has opened a session in this process,
//! so the resolver prefers the cached id in the flag store and only falls
//! back to the session and driver record when nothing is cached.

use std::sync::Arc;

use log::{debug, info, warn};

use crate::error::Result;
use crate::flags::TrackingFlags;

/// Authenticated session and driver directory (external collaborator).
pub trait DriverLookup: Send + Sync {
    /// Identity of the signed-in user, if a session exists.
    fn session_user_id(&self) -> Result<Option<String>>;
    /// Driver record id for a user, if one exists.
    fn driver_id_for_user(&self, user_id: &str) -> Result<Option<String>>;
}

pub struct IdentityResolver {
    flags: TrackingFlags,
    lookup: Arc<dyn DriverLookup>,
}

impl IdentityResolver {
    pub fn new(flags: TrackingFlags, lookup: Arc<dyn DriverLookup>) -> Self {
        Self { flags, lookup }
    }

    /// Resolve the current driver id, or `None` when no source has one.
    ///
    /// `None` is a normal outcome (fresh install, signed out) and callers
    /// skip silently on it.
    pub fn resolve_driver_id(&self) -> Option<String> {
        if let Some(driver_id) = self.flags.active_driver_id() {
            return Some(driver_id);
        }

        let user_id = match self.lookup.session_user_id() {
            Ok(Some(user_id)) if !user_id.trim().is_empty() => user_id,
            Ok(_) => {
                debug!("[Identity] No session, driver id unresolved");
                return None;
            }
            Err(e) => {
                warn!("[Identity] Session lookup failed: {}", e);
                return None;
            }
        };

        let driver_id = match self.lookup.driver_id_for_user(&user_id) {
            Ok(Some(driver_id)) if !driver_id.trim().is_empty() => driver_id,
            Ok(_) => {
                info!("[Identity] No driver record for user {}", user_id);
                return None;
            }
            Err(e) => {
                warn!("[Identity] Driver lookup for user {} failed: {}", user_id, e);
                return None;
            }
        };

        // A stop may have landed during the lookup; caching now would leave a
        // stale id behind the cleared intent.
        if !self.flags.is_active() {
            debug!("[Identity] Intent cleared during lookup, not caching {}", driver_id);
        } else if let Err(e) = self.flags.cache_driver_id(&driver_id) {
            warn!("[Identity] Failed to cache driver id {}: {}", driver_id, e);
        }
        info!("[Identity] Resolved driver {} from session", driver_id);
        Some(driver_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::{FlagStore, MemoryFlagStore, KEY_ACTIVE_DRIVER_ID, KEY_TRACKING_ACTIVE};
    use crate::testing::FakeDriverLookup;

    fn resolver(lookup: Arc<FakeDriverLookup>) -> (Arc<MemoryFlagStore>, IdentityResolver) {
        let store = Arc::new(MemoryFlagStore::new());
        let resolver = IdentityResolver::new(TrackingFlags::new(store.clone()), lookup);
        (store, resolver)
    }

    #[test]
    fn test_cached_id_skips_lookup() {
        let lookup = Arc::new(FakeDriverLookup::with_driver("user-1", "D9"));
        let (store, resolver) = resolver(lookup.clone());
        store.set(KEY_ACTIVE_DRIVER_ID, "D1").unwrap();

        assert_eq!(resolver.resolve_driver_id().as_deref(), Some("D1"));
        assert_eq!(lookup.lookup_count(), 0);
    }

    #[test]
    fn test_session_fallback_caches_result() {
        let lookup = Arc::new(FakeDriverLookup::with_driver("user-1", "D9"));
        let (store, resolver) = resolver(lookup.clone());
        store.set(KEY_TRACKING_ACTIVE, "true").unwrap();

        assert_eq!(resolver.resolve_driver_id().as_deref(), Some("D9"));
        assert_eq!(store.get(KEY_ACTIVE_DRIVER_ID).unwrap().as_deref(), Some("D9"));

        // Second call is served from the store
        assert_eq!(resolver.resolve_driver_id().as_deref(), Some("D9"));
        assert_eq!(lookup.lookup_count(), 1);
    }

    #[test]
    fn test_inactive_intent_is_not_repopulated() {
        let lookup = Arc::new(FakeDriverLookup::with_driver("user-1", "D9"));
        let (store, resolver) = resolver(lookup.clone());
        store.set(KEY_TRACKING_ACTIVE, "false").unwrap();

        assert_eq!(resolver.resolve_driver_id().as_deref(), Some("D9"));
        assert_eq!(store.get(KEY_ACTIVE_DRIVER_ID).unwrap(), None);
        assert_eq!(resolver.resolve_driver_id().as_deref(), Some("D9"));
        assert_eq!(lookup.lookup_count(), 2);
    }

    #[test]
    fn test_no_session_yields_none() {
        let (_, resolver) = resolver(Arc::new(FakeDriverLookup::signed_out()));
        assert_eq!(resolver.resolve_driver_id(), None);
    }

    #[test]
    fn test_lookup_failure_yields_none() {
        let lookup = Arc::new(FakeDriverLookup::with_driver("user-1", "D9"));
        lookup.set_failing(true);
        let (store, resolver) = resolver(lookup);
        assert_eq!(resolver.resolve_driver_id(), None);
        assert_eq!(store.get(KEY_ACTIVE_DRIVER_ID).unwrap(), None);
    }
}
