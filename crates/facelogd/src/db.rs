//! SQLite records of stored captures and expression detections.

use chrono::Utc;
use facelog_core::{CaptureLog, Identity};
use rusqlite::{params, Connection};
use std::path::{Path, PathBuf};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS captures (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    label       INTEGER NOT NULL,
    src         TEXT NOT NULL,
    created_at  TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS detections (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    label       TEXT NOT NULL,
    expression  TEXT NOT NULL,
    category    TEXT NOT NULL,
    created_at  TEXT NOT NULL
);
";

/// Handle to the database file. Connections are opened per use and closed
/// on drop.
#[derive(Debug, Clone)]
pub struct Database {
    path: PathBuf,
}

impl Database {
    /// Create the file and schema if missing.
    pub fn init(path: impl Into<PathBuf>) -> rusqlite::Result<Self> {
        let db = Self { path: path.into() };
        if let Some(parent) = db.path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                tracing::warn!(path = %parent.display(), error = %e, "cannot create database directory");
            }
        }
        db.connect()?.execute_batch(SCHEMA)?;
        tracing::info!(path = %db.path.display(), "database ready");
        Ok(db)
    }

    pub fn connect(&self) -> rusqlite::Result<Connection> {
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Ok(conn)
    }

    pub fn record_capture(&self, identity: Identity, src: &Path) -> rusqlite::Result<i64> {
        let label = i64::try_from(identity.get())
            .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO captures (label, src, created_at) VALUES (?1, ?2, ?3)",
            params![
                label,
                src.to_string_lossy(),
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// `label` is the caller-supplied user id, or "unknown".
    pub fn record_detection(
        &self,
        label: &str,
        expression: &str,
        category: &str,
    ) -> rusqlite::Result<i64> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO detections (label, expression, category, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![label, expression, category, Utc::now().to_rfc3339()],
        )?;
        Ok(conn.last_insert_rowid())
    }
}

impl CaptureLog for Database {
    fn append(&self, identity: Identity, path: &Path) -> Result<(), String> {
        self.record_capture(identity, path)
            .map(|_| ())
            .map_err(|e| e.to_string())
    }
}
