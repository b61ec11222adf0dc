//! # SQLite Flag Store
//!
//! Durable [`FlagStore`] that survives app kills and reboots. One row per
//! key; every write is a single-statement upsert, so each key is atomic and
//! nothing spans keys.
//!
//! The periodic callback and the UI thread share one connection behind a
//! mutex. WAL mode keeps a reader in another process (e.g. a headless task
//! on Android) from blocking on our writes.

use std::sync::{Mutex, MutexGuard};

use log::info;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::Result;
use crate::flags::FlagStore;
use crate::types::now_ms;

pub struct SqliteFlagStore {
    db: Mutex<Connection>,
    db_path: String,
}

impl SqliteFlagStore {
    /// Open (or create) the store at `db_path`.
    pub fn new(db_path: &str) -> Result<Self> {
        let db = Connection::open(db_path)?;
        Self::init_schema(&db)?;
        info!("[SqliteFlagStore] Opened {}", db_path);

        Ok(Self {
            db: Mutex::new(db),
            db_path: db_path.to_string(),
        })
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        Self::new(":memory:")
    }

    pub fn db_path(&self) -> &str {
        &self.db_path
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        // journal_mode returns a row, so it cannot go through execute_batch
        let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        conn.execute_batch(
            r#"
            PRAGMA synchronous = NORMAL;

            CREATE TABLE IF NOT EXISTS tracking_flags (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    fn lock_db(&self) -> MutexGuard<'_, Connection> {
        self.db.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl FlagStore for SqliteFlagStore {
    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.lock_db().execute(
            "INSERT INTO tracking_flags (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, now_ms()],
        )?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        let value = self
            .lock_db()
            .query_row(
                "SELECT value FROM tracking_flags WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.lock_db()
            .execute("DELETE FROM tracking_flags WHERE key = ?1", params![key])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::{TrackingFlags, KEY_ACTIVE_DRIVER_ID};
    use std::sync::Arc;

    #[test]
    fn test_set_get_remove() {
        let store = SqliteFlagStore::in_memory().unwrap();
        assert_eq!(store.get("missing").unwrap(), None);

        store.set("k", "v1").unwrap();
        store.set("k", "v2").unwrap();
        assert_eq!(store.get("k").unwrap().as_deref(), Some("v2"));

        store.remove("k").unwrap();
        assert_eq!(store.get("k").unwrap(), None);
        // Removing again is fine
        store.remove("k").unwrap();
    }

    #[test]
    fn test_tracking_flags_over_sqlite() {
        let store = Arc::new(SqliteFlagStore::in_memory().unwrap());
        let flags = TrackingFlags::new(store.clone());

        flags.write_intent("D1").unwrap();
        assert_eq!(flags.read_intent().trackable_driver(), Some("D1"));

        flags.clear_intent().unwrap();
        assert!(!flags.is_active());
        assert_eq!(store.get(KEY_ACTIVE_DRIVER_ID).unwrap(), None);
    }
}
