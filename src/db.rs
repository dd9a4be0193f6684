//! Embedded relational database
//!
//! One SQLite file holds the append-heavy data: revenue snapshots, trust
//! summaries, reminders, session-learner rows, and the conversation
//! archive. Write-ahead logging is enabled on open; tables are created
//! lazily by the tracker that owns them.

use std::path::Path;
use std::sync::{Arc, Mutex};

use eyre::{Context, Result};
use rusqlite::Connection;
use tracing::debug;

/// Shared handle over the embedded database
///
/// rusqlite connections are not Sync, so access is serialized through a
/// mutex. Every tracker query is short; contention is negligible at scan
/// cadence.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) the database file with WAL enabled
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create database directory")?;
        }

        let conn = Connection::open(path).context("Failed to open database")?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("Failed to enable WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .context("Failed to set synchronous mode")?;

        debug!(path = %path.display(), "Database opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory database for tests
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a closure against the connection
    pub fn with_conn<R>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<R>) -> rusqlite::Result<R> {
        let conn = self.conn.lock().unwrap();
        f(&conn)
    }

    /// Run a closure inside a transaction; rolls back on error
    pub fn with_tx<R>(&self, f: impl FnOnce(&rusqlite::Transaction<'_>) -> rusqlite::Result<R>) -> rusqlite::Result<R> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }
}
