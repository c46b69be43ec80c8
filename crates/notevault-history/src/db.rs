//! Embedded SQLite database shared by the edit history and timeline cache.
//!
//! The connection sits behind a `parking_lot::Mutex` and every call runs on
//! the blocking pool, so async callers never stall the runtime on disk I/O.

use notevault_core::{Error, Result};
use parking_lot::Mutex;
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const SCHEMA: &str = r#"
PRAGMA journal_mode=WAL;
PRAGMA synchronous=NORMAL;

CREATE TABLE IF NOT EXISTS edits (
  note_id TEXT NOT NULL,
  branch_name TEXT NOT NULL,
  edit_id TEXT NOT NULL,
  version_number INTEGER NOT NULL,
  storage_type TEXT NOT NULL,
  previous_edit_id TEXT,
  content_hash TEXT NOT NULL,
  payload BLOB NOT NULL,
  compressed_size INTEGER NOT NULL,
  uncompressed_size INTEGER NOT NULL,
  timestamp TEXT NOT NULL,
  PRIMARY KEY (note_id, branch_name, edit_id)
);
CREATE INDEX IF NOT EXISTS idx_edits_note_branch ON edits(note_id, branch_name);

CREATE TABLE IF NOT EXISTS manifests (
  note_id TEXT PRIMARY KEY,
  manifest TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS timeline_events (
  note_id TEXT NOT NULL,
  branch_name TEXT NOT NULL,
  source TEXT NOT NULL,
  to_version_id TEXT NOT NULL,
  event TEXT NOT NULL,
  PRIMARY KEY (note_id, branch_name, source, to_version_id)
);
"#;

/// Map `rusqlite` failures into the engine's error type
pub(crate) trait SqlResultExt<T> {
    fn sql(self) -> Result<T>;
}

impl<T> SqlResultExt<T> for rusqlite::Result<T> {
    fn sql(self) -> Result<T> {
        self.map_err(|e| Error::database(e.to_string()))
    }
}

/// Handle to the edit-history database; clones share one connection
#[derive(Clone)]
pub struct HistoryDb {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl HistoryDb {
    /// Open (or create) the database file and apply the schema
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::io_at(parent, e))?;
        }
        let conn = Connection::open(&path).sql()?;
        Self::with_connection(conn, Some(path))
    }

    /// Private in-memory database
    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory().sql()?, None)
    }

    fn with_connection(conn: Connection, path: Option<PathBuf>) -> Result<Self> {
        conn.execute_batch(SCHEMA).sql()?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
        })
    }

    /// Backing file, `None` for in-memory databases
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Run `work` against the connection on the blocking pool
    pub async fn call<T, F>(&self, work: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            work(&mut guard)
        })
        .await
        .map_err(|e| Error::database(format!("Database task failed: {}", e)))?
    }
}
