//! Lookout persistence: the storage contract the registry saves through, and
//! a small SQLite implementation of it. Keep code tiny and predictable.

#![forbid(unsafe_code)]

use std::collections::HashMap;

use async_trait::async_trait;
use metrics::{counter, histogram};
use tracing::warn;

use lookout_core::{AppStatus, Snapshot};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("encode: {0}")]
    Encode(#[from] serde_json::Error),
    /// Non-SQLite backends report through here.
    #[error("backend: {0}")]
    Backend(String),
}

/// Storage consumed by the registry manager. One row per tracked apply; the
/// snapshot payload is opaque to the backend.
#[async_trait]
pub trait Storage: Send + Sync {
    /// First-time persistence. Returns the positive storage id.
    async fn create_apply(
        &self,
        snapshot: &Snapshot,
        status: AppStatus,
    ) -> Result<i64, StorageError>;

    /// Subsequent snapshot writes for an already-created row.
    async fn update_apply(
        &self,
        id: i64,
        snapshot: &Snapshot,
        status: AppStatus,
    ) -> Result<(), StorageError>;

    /// Recovery query: all applies currently in `status`, keyed by id.
    async fn get_applies_by_status(
        &self,
        status: AppStatus,
    ) -> Result<HashMap<i64, Snapshot>, StorageError>;

    /// Auxiliary version tracking, keyed by `Identity::history_key()`.
    async fn update_applies_version_history(&self, key: &str, hash: u64) -> bool;

    async fn delete_applied_version(&self, key: &str) -> bool;
}

/// SQLite-backed store. Simple, synchronous behind a mutex; none of the
/// registry paths are latency sensitive here.
pub struct SqliteStore {
    db: std::sync::Mutex<rusqlite::Connection>,
}

impl SqliteStore {
    /// Open the store at its configured location: `LOOKOUT_DB_PATH` when set,
    /// else `~/.lookout/lookout.db` (directory created on demand).
    pub fn open_default() -> Result<Self, StorageError> {
        Self::open(default_db_path())
    }

    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self, StorageError> {
        let started = std::time::Instant::now();
        let db = rusqlite::Connection::open(path)?;
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        db.execute(
            "CREATE TABLE IF NOT EXISTS applies (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                name        TEXT NOT NULL,
                namespace   TEXT NOT NULL,
                cluster     TEXT NOT NULL,
                status      TEXT NOT NULL,
                deploy_time INTEGER NOT NULL,
                details     TEXT NOT NULL
            )",
            [],
        )?;
        db.execute("CREATE INDEX IF NOT EXISTS idx_applies_status ON applies(status)", []).ok();
        db.execute(
            "CREATE TABLE IF NOT EXISTS applied_versions (
                key  TEXT PRIMARY KEY,
                hash INTEGER NOT NULL
            )",
            [],
        )?;
        let me = Self { db: std::sync::Mutex::new(db) };
        histogram!("storage_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(me)
    }
}

#[async_trait]
impl Storage for SqliteStore {
    async fn create_apply(
        &self,
        snapshot: &Snapshot,
        status: AppStatus,
    ) -> Result<i64, StorageError> {
        let started = std::time::Instant::now();
        let details = serde_json::to_string(snapshot)?;
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO applies(name, namespace, cluster, status, deploy_time, details)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            (
                &snapshot.application,
                &snapshot.namespace,
                &snapshot.cluster,
                status.as_str(),
                snapshot.creation_ts,
                &details,
            ),
        )?;
        let id = db.last_insert_rowid();
        histogram!("storage_create_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("storage_create_total", 1u64);
        Ok(id)
    }

    async fn update_apply(
        &self,
        id: i64,
        snapshot: &Snapshot,
        status: AppStatus,
    ) -> Result<(), StorageError> {
        let started = std::time::Instant::now();
        let details = serde_json::to_string(snapshot)?;
        let db = self.db.lock().unwrap();
        db.execute(
            "UPDATE applies SET status = ?2, details = ?3 WHERE id = ?1",
            (id, status.as_str(), &details),
        )?;
        histogram!("storage_update_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("storage_update_total", 1u64);
        Ok(())
    }

    async fn get_applies_by_status(
        &self,
        status: AppStatus,
    ) -> Result<HashMap<i64, Snapshot>, StorageError> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare("SELECT id, details FROM applies WHERE status = ?1")?;
        let mut rows = stmt.query([status.as_str()])?;
        let mut out = HashMap::new();
        while let Some(row) = rows.next()? {
            let id: i64 = row.get(0)?;
            let details: String = row.get(1)?;
            match serde_json::from_str::<Snapshot>(&details) {
                Ok(snapshot) => {
                    out.insert(id, snapshot);
                }
                Err(e) => {
                    warn!(id, error = %e, "skipping apply row with undecodable details");
                }
            }
        }
        Ok(out)
    }

    async fn update_applies_version_history(&self, key: &str, hash: u64) -> bool {
        let db = self.db.lock().unwrap();
        let res = db.execute(
            "INSERT INTO applied_versions(key, hash) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET hash = excluded.hash",
            (key, hash as i64),
        );
        match res {
            Ok(_) => true,
            Err(e) => {
                warn!(key, error = %e, "failed to update applies version history");
                false
            }
        }
    }

    async fn delete_applied_version(&self, key: &str) -> bool {
        let db = self.db.lock().unwrap();
        match db.execute("DELETE FROM applied_versions WHERE key = ?1", [key]) {
            Ok(_) => true,
            Err(e) => {
                warn!(key, error = %e, "failed to delete applied version");
                false
            }
        }
    }
}

fn default_db_path() -> std::path::PathBuf {
    if let Ok(path) = std::env::var("LOOKOUT_DB_PATH") {
        return std::path::PathBuf::from(path);
    }
    let base = std::env::var_os("HOME")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|| std::path::PathBuf::from("."));
    let dir = base.join(".lookout");
    let _ = std::fs::create_dir_all(&dir);
    dir.join("lookout.db")
}
