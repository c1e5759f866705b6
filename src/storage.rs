use anyhow::{anyhow, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

pub const KEY_LAST_UPLOAD_TIME: &str = "last_upload_time";
pub const KEY_SUCCESS_COUNT: &str = "success_count";
pub const KEY_FAIL_COUNT: &str = "fail_count";
pub const KEY_LAST_ERROR: &str = "last_error";

/// Persisted key/value map backing both the heartbeat settings and the stats.
///
/// Every setter is an independent upsert. Cycles are serialized by the
/// scheduler, so no multi-field transaction is needed except for
/// [`SettingsStore::reset_stats`].
pub struct SettingsStore {
    conn: Mutex<Connection>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Stats {
    pub success_count: u64,
    pub fail_count: u64,
    pub last_error: String,
    /// Epoch millis, 0 when nothing was uploaded yet.
    pub last_upload_time: i64,
}

impl SettingsStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        info!(path = %path.display(), "Opening heartbeat settings store");
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )",
            [],
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("settings store lock poisoned"))
    }

    pub fn get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn()?;
        let value = conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        debug!(key, "Writing setting");
        self.conn()?.execute(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn get_string(&self, key: &str) -> Result<String> {
        Ok(self.get(key)?.unwrap_or_default())
    }

    pub fn get_bool(&self, key: &str, default: bool) -> Result<bool> {
        Ok(match self.get(key)?.as_deref() {
            Some("true") | Some("1") => true,
            Some("false") | Some("0") => false,
            _ => default,
        })
    }

    pub fn set_bool(&self, key: &str, value: bool) -> Result<()> {
        self.set(key, if value { "true" } else { "false" })
    }

    pub fn get_i64(&self, key: &str, default: i64) -> Result<i64> {
        Ok(self
            .get(key)?
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default))
    }

    pub fn set_i64(&self, key: &str, value: i64) -> Result<()> {
        self.set(key, &value.to_string())
    }

    /// Atomically bumps an integer setting, treating a missing key as 0.
    fn increment(&self, key: &str) -> Result<()> {
        self.conn()?.execute(
            "INSERT INTO settings (key, value) VALUES (?1, '1')
             ON CONFLICT(key) DO UPDATE SET value = CAST(CAST(value AS INTEGER) + 1 AS TEXT)",
            params![key],
        )?;
        Ok(())
    }

    pub fn stats(&self) -> Result<Stats> {
        Ok(Stats {
            success_count: self.get_i64(KEY_SUCCESS_COUNT, 0)?.max(0) as u64,
            fail_count: self.get_i64(KEY_FAIL_COUNT, 0)?.max(0) as u64,
            last_error: self.get_string(KEY_LAST_ERROR)?,
            last_upload_time: self.get_i64(KEY_LAST_UPLOAD_TIME, 0)?,
        })
    }

    pub fn record_success(&self, uploaded_at: i64) -> Result<()> {
        self.increment(KEY_SUCCESS_COUNT)?;
        self.set_i64(KEY_LAST_UPLOAD_TIME, uploaded_at)
    }

    pub fn record_failure(&self, message: &str) -> Result<()> {
        self.increment(KEY_FAIL_COUNT)?;
        self.set(KEY_LAST_ERROR, message)
    }

    pub fn reset_stats(&self) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO settings (key, value) VALUES (?1, '0'), (?2, '0'), (?3, '0')
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![KEY_LAST_UPLOAD_TIME, KEY_SUCCESS_COUNT, KEY_FAIL_COUNT],
        )?;
        tx.execute("DELETE FROM settings WHERE key = ?1", params![KEY_LAST_ERROR])?;
        tx.commit()?;
        info!("Heartbeat statistics reset");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_keys_fall_back_to_defaults() {
        let store = SettingsStore::open_in_memory().unwrap();
        assert_eq!(store.get("nope").unwrap(), None);
        assert!(store.get_bool("nope", true).unwrap());
        assert_eq!(store.get_i64("nope", 42).unwrap(), 42);
        assert_eq!(store.stats().unwrap(), Stats::default());
    }

    #[test]
    fn set_overwrites_previous_value() {
        let store = SettingsStore::open_in_memory().unwrap();
        store.set("server_url", "http://a").unwrap();
        store.set("server_url", "http://b").unwrap();
        assert_eq!(store.get_string("server_url").unwrap(), "http://b");
        assert_eq!(store.get("secret_key").unwrap(), None);
    }

    #[test]
    fn counters_accumulate_and_reset_together() {
        let store = SettingsStore::open_in_memory().unwrap();
        store.record_success(1_700_000_000_000).unwrap();
        store.record_success(1_700_000_060_000).unwrap();
        store.record_failure("HTTP 500: boom").unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.success_count, 2);
        assert_eq!(stats.fail_count, 1);
        assert_eq!(stats.last_error, "HTTP 500: boom");
        assert_eq!(stats.last_upload_time, 1_700_000_060_000);

        store.reset_stats().unwrap();
        assert_eq!(store.stats().unwrap(), Stats::default());
    }

    #[test]
    fn file_backed_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("heartbeat.db");
        {
            let store = SettingsStore::open(&path).unwrap();
            store.set_bool("enabled", true).unwrap();
            store.record_failure("network error: refused").unwrap();
        }
        let store = SettingsStore::open(&path).unwrap();
        assert!(store.get_bool("enabled", false).unwrap());
        assert_eq!(store.stats().unwrap().fail_count, 1);
    }
}
