//! Disk-backed lookup cache.
//!
//! Expensive server lookups (vote details in particular) are memoized in a
//! small `SQLite` key-value table with a per-record TTL. The store survives
//! across runs and tolerates concurrent openers by retrying the open with a
//! short backoff.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use thiserror::Error;
use tracing::debug;

const OPEN_ATTEMPTS: u32 = 10;
const OPEN_BACKOFF: Duration = Duration::from_millis(500);

/// Errors from the lookup cache.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// The database directory could not be created.
    #[error("create cache dir {path}: {source}")]
    CreateDir {
        /// Directory that failed.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The database could not be opened after all retries.
    #[error("open cache {path}: {source}")]
    Open {
        /// Database path.
        path: PathBuf,
        /// Last open error.
        #[source]
        source: rusqlite::Error,
    },

    /// A query failed.
    #[error("cache query: {0}")]
    Query(#[from] rusqlite::Error),
}

/// Time-bounded key-value store backed by `SQLite`.
#[derive(Debug, Clone)]
pub struct Store {
    path: PathBuf,
    timeout: Duration,
}

impl Store {
    /// Creates a store rooted at `path` with the given record TTL. The
    /// database itself is opened lazily per operation.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::CreateDir`] when the parent directory cannot be
    /// created.
    pub fn open(path: &Path, timeout: Duration) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|source| StoreError::CreateDir {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }
        Ok(Self {
            path: path.to_path_buf(),
            timeout,
        })
    }

    // Another process may hold the database; retry the open with a short
    // backoff before giving up.
    fn connect(&self) -> Result<Connection, StoreError> {
        let mut last = None;
        for attempt in 0..OPEN_ATTEMPTS {
            match Connection::open(&self.path) {
                Ok(conn) => {
                    conn.execute(
                        "CREATE TABLE IF NOT EXISTS records (
                            key TEXT PRIMARY KEY,
                            data BLOB NOT NULL,
                            stored_at INTEGER NOT NULL
                        )",
                        [],
                    )?;
                    return Ok(conn);
                }
                Err(err) => {
                    debug!(attempt, error = %err, "cache open failed");
                    last = Some(err);
                    std::thread::sleep(OPEN_BACKOFF);
                }
            }
        }
        Err(StoreError::Open {
            path: self.path.clone(),
            source: last.expect("at least one open attempt"),
        })
    }

    /// Looks a key up. Returns `None` when the key is missing or its record
    /// has outlived the TTL.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on database failures.
    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let conn = self.connect()?;
        let row: Option<(Vec<u8>, i64)> = conn
            .query_row(
                "SELECT data, stored_at FROM records WHERE key = ?1",
                params![key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let Some((data, stored_at)) = row else {
            return Ok(None);
        };
        let expires = stored_at + i64::try_from(self.timeout.as_secs()).unwrap_or(i64::MAX);
        if expires > Utc::now().timestamp() {
            Ok(Some(data))
        } else {
            Ok(None)
        }
    }

    /// Stores a record under `key`, replacing any previous record and
    /// resetting its TTL.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on database failures.
    pub fn put(&self, key: &str, data: &[u8]) -> Result<(), StoreError> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT OR REPLACE INTO records (key, data, stored_at) VALUES (?1, ?2, ?3)",
            params![key, data, Utc::now().timestamp()],
        )?;
        Ok(())
    }

    /// Removes every record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on database failures.
    pub fn clear(&self) -> Result<(), StoreError> {
        let conn = self.connect()?;
        conn.execute("DELETE FROM records", [])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store(timeout: Duration) -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("cache.db"), timeout).unwrap();
        (dir, store)
    }

    #[test]
    fn put_get_round_trip() {
        let (_dir, store) = temp_store(Duration::from_secs(3600));
        assert!(store.get("missing").unwrap().is_none());

        store.put("k", b"value").unwrap();
        assert_eq!(store.get("k").unwrap().as_deref(), Some(&b"value"[..]));

        store.put("k", b"newer").unwrap();
        assert_eq!(store.get("k").unwrap().as_deref(), Some(&b"newer"[..]));
    }

    #[test]
    fn expired_records_read_as_missing() {
        let (_dir, store) = temp_store(Duration::ZERO);
        store.put("k", b"value").unwrap();
        assert!(store.get("k").unwrap().is_none());
    }

    #[test]
    fn clear_removes_records() {
        let (_dir, store) = temp_store(Duration::from_secs(3600));
        store.put("a", b"1").unwrap();
        store.put("b", b"2").unwrap();
        store.clear().unwrap();
        assert!(store.get("a").unwrap().is_none());
        assert!(store.get("b").unwrap().is_none());
    }
}
