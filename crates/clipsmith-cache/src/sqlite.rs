//! SQLite-persisted result store.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{info, warn};

use clipsmith_core::{Error, Result};

use crate::fingerprint::Fingerprint;
use crate::store::ResultStore;

/// Bumped when the on-disk layout changes; older files are emptied on open.
pub const LAYOUT_VERSION: i64 = 1;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS cache_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS cache_entries (
    fingerprint TEXT PRIMARY KEY,
    stage TEXT NOT NULL,
    value_json TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    expires_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_stage ON cache_entries(stage);
"#;

pub struct SqliteStore {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

impl SqliteStore {
    /// Open or create the store at `db_path`.
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&db_path).map_err(|e| Error::Database(e.to_string()))?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )
        .map_err(|e| Error::Database(e.to_string()))?;
        conn.execute_batch(SCHEMA_SQL)
            .map_err(|e| Error::Database(format!("Schema init failed: {}", e)))?;
        Self::check_layout(&conn)?;

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM cache_entries", [], |row| row.get(0))
            .map_err(|e| Error::Database(e.to_string()))?;
        info!(
            "SqliteStore opened: {} entries, path={}",
            count,
            db_path.display()
        );
        Ok(Self {
            conn: Mutex::new(conn),
            db_path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn check_layout(conn: &Connection) -> Result<()> {
        let stored: Option<String> = conn
            .query_row(
                "SELECT value FROM cache_meta WHERE key = 'layout_version'",
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| Error::Database(e.to_string()))?;
        let current = LAYOUT_VERSION.to_string();
        if stored.as_deref() == Some(current.as_str()) {
            return Ok(());
        }
        if let Some(old) = stored {
            warn!(
                "Cache layout version {} differs from {}; dropping entries",
                old, current
            );
            conn.execute("DELETE FROM cache_entries", [])
                .map_err(|e| Error::Database(e.to_string()))?;
        }
        conn.execute(
            "INSERT OR REPLACE INTO cache_meta (key, value) VALUES ('layout_version', ?1)",
            params![current],
        )
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    /// Delete expired rows. Returns how many were removed.
    pub fn purge_expired(&self) -> Result<u64> {
        let now = Utc::now().timestamp_millis();
        let removed = self
            .conn
            .lock()
            .execute("DELETE FROM cache_entries WHERE expires_at <= ?1", params![now])
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(removed as u64)
    }

    fn delete(&self, conn: &Connection, key: &Fingerprint) {
        if let Err(e) = conn.execute(
            "DELETE FROM cache_entries WHERE fingerprint = ?1",
            params![key.as_str()],
        ) {
            warn!("Failed to delete cache entry {}: {}", key, e);
        }
    }
}

impl ResultStore for SqliteStore {
    fn get(&self, key: &Fingerprint) -> Option<serde_json::Value> {
        let conn = self.conn.lock();
        let row: Option<(String, i64)> = match conn
            .query_row(
                "SELECT value_json, expires_at FROM cache_entries WHERE fingerprint = ?1",
                params![key.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
        {
            Ok(row) => row,
            Err(e) => {
                warn!("Cache read failed for {}, treating as miss: {}", key, e);
                return None;
            }
        };
        let (value_json, expires_at) = row?;
        if expires_at <= Utc::now().timestamp_millis() {
            return None;
        }
        match serde_json::from_str(&value_json) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Corrupt cache entry {}, discarding: {}", key, e);
                self.delete(&conn, key);
                None
            }
        }
    }

    fn put(
        &self,
        key: &Fingerprint,
        stage: &str,
        value: &serde_json::Value,
        ttl: Duration,
    ) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let expires_at = now.saturating_add(ttl.as_millis().min(i64::MAX as u128) as i64);
        let value_json = serde_json::to_string(value)?;
        self.conn
            .lock()
            .execute(
                "INSERT INTO cache_entries (fingerprint, stage, value_json, created_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(fingerprint) DO UPDATE SET
                    stage = excluded.stage,
                    value_json = excluded.value_json,
                    created_at = excluded.created_at,
                    expires_at = excluded.expires_at
                 WHERE cache_entries.expires_at <= excluded.created_at",
                params![key.as_str(), stage, value_json, now, expires_at],
            )
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    fn entries_by_stage(&self) -> Result<BTreeMap<String, u64>> {
        let now = Utc::now().timestamp_millis();
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT stage, COUNT(*) FROM cache_entries WHERE expires_at > ?1 GROUP BY stage",
            )
            .map_err(|e| Error::Database(e.to_string()))?;
        let rows = stmt
            .query_map(params![now], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })
            .map_err(|e| Error::Database(e.to_string()))?;
        let mut counts = BTreeMap::new();
        for row in rows {
            let (stage, count) = row.map_err(|e| Error::Database(e.to_string()))?;
            counts.insert(stage, count as u64);
        }
        Ok(counts)
    }

    fn clear(&self) -> Result<u64> {
        let removed = self
            .conn
            .lock()
            .execute("DELETE FROM cache_entries", [])
            .map_err(|e| Error::Database(e.to_string()))?;
        info!("Cleared {} cache entries", removed);
        Ok(removed as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key(s: &str) -> Fingerprint {
        Fingerprint::compute("stage", 1, "model", &json!(s))
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache").join("results.db");
        let value = json!({"boundaries": {"start": 12.5, "end": 48.0}});
        {
            let store = SqliteStore::open(&path).unwrap();
            store
                .put(&key("a"), "refine_boundaries", &value, Duration::from_secs(3600))
                .unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.get(&key("a")), Some(value));
        assert!(store.get(&key("b")).is_none());
    }

    #[test]
    fn test_live_entry_not_overwritten_but_expired_is() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("c.db")).unwrap();
        store
            .put(&key("a"), "s", &json!(1), Duration::from_secs(3600))
            .unwrap();
        store
            .put(&key("a"), "s", &json!(2), Duration::from_secs(3600))
            .unwrap();
        assert_eq!(store.get(&key("a")), Some(json!(1)));

        store
            .put(&key("b"), "s", &json!(1), Duration::from_millis(0))
            .unwrap();
        assert!(store.get(&key("b")).is_none());
        std::thread::sleep(Duration::from_millis(2));
        store
            .put(&key("b"), "s", &json!(2), Duration::from_secs(3600))
            .unwrap();
        assert_eq!(store.get(&key("b")), Some(json!(2)));
    }

    #[test]
    fn test_corrupt_row_is_a_miss_and_removed() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("c.db")).unwrap();
        let far = Utc::now().timestamp_millis() + 3_600_000;
        store
            .conn
            .lock()
            .execute(
                "INSERT INTO cache_entries VALUES (?1, 's', '{not json', 0, ?2)",
                params![key("a").as_str(), far],
            )
            .unwrap();
        assert!(store.get(&key("a")).is_none());
        let remaining: i64 = store
            .conn
            .lock()
            .query_row("SELECT COUNT(*) FROM cache_entries", [], |r| r.get(0))
            .unwrap();
        assert_eq!(remaining, 0);
    }

    #[test]
    fn test_layout_bump_empties_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store
                .put(&key("a"), "s", &json!(1), Duration::from_secs(3600))
                .unwrap();
            store
                .conn
                .lock()
                .execute(
                    "UPDATE cache_meta SET value = '0' WHERE key = 'layout_version'",
                    [],
                )
                .unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        assert!(store.get(&key("a")).is_none());
    }

    #[test]
    fn test_stats_and_purge() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("c.db")).unwrap();
        store
            .put(&key("a"), "gate", &json!(1), Duration::from_secs(3600))
            .unwrap();
        store
            .put(&key("b"), "gate", &json!(1), Duration::from_millis(0))
            .unwrap();
        assert_eq!(store.entries_by_stage().unwrap().get("gate"), Some(&1));
        assert_eq!(store.purge_expired().unwrap(), 1);
        assert_eq!(store.clear().unwrap(), 1);
    }
}
