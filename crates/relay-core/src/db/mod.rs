//! SQLite persistence for runs, steps, stories and events.
//!
//! Uses rusqlite with WAL mode so several poller processes can share one
//! database file. All database operations are executed via
//! `tokio::task::spawn_blocking` to avoid blocking the async runtime.
//!
//! State-changing work goes through [`Database::with_tx`], which opens a
//! `BEGIN IMMEDIATE` transaction: writers from other processes wait on the
//! busy timeout instead of failing a read-to-write upgrade halfway through.

use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::RelayError;

const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// Thread-safe handle to the SQLite database.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) a SQLite database at the given path.
    pub fn open(db_path: &str) -> Result<Self, RelayError> {
        let path = Path::new(db_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let conn = Connection::open(db_path)
            .map_err(|e| RelayError::Database(format!("Failed to open database: {}", e)))?;

        conn.busy_timeout(BUSY_TIMEOUT)
            .map_err(|e| RelayError::Database(format!("Failed to set busy timeout: {}", e)))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(|e| RelayError::Database(format!("Failed to set pragmas: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.initialize_tables()?;

        tracing::info!("SQLite database opened at: {}", db_path);
        Ok(db)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self, RelayError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| RelayError::Database(format!("Failed to open in-memory db: {}", e)))?;

        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .map_err(|e| RelayError::Database(format!("Failed to set pragmas: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.initialize_tables()?;
        Ok(db)
    }

    /// Execute a closure with access to the database connection.
    /// Automatically handles locking and error conversion.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, RelayError>
    where
        F: FnOnce(&Connection) -> Result<T, rusqlite::Error>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| RelayError::Database(format!("Lock poisoned: {}", e)))?;
        f(&conn).map_err(RelayError::from)
    }

    /// Execute a closure with access to the database connection (async-friendly).
    pub async fn with_conn_async<F, T>(&self, f: F) -> Result<T, RelayError>
    where
        F: FnOnce(&Connection) -> Result<T, rusqlite::Error> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || db.with_conn(f))
            .await
            .map_err(|e| RelayError::Database(format!("Task join error: {}", e)))?
    }

    /// Run a read-only closure without opening a transaction. In WAL mode
    /// each statement reads a committed snapshot and never waits on writers.
    pub fn with_read<F, T>(&self, f: F) -> Result<T, RelayError>
    where
        F: FnOnce(&Connection) -> Result<T, RelayError>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| RelayError::Database(format!("Lock poisoned: {}", e)))?;
        f(&conn)
    }

    /// Async wrapper around [`Database::with_read`].
    pub async fn with_read_async<F, T>(&self, f: F) -> Result<T, RelayError>
    where
        F: FnOnce(&Connection) -> Result<T, RelayError> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || db.with_read(f))
            .await
            .map_err(|e| RelayError::Database(format!("Task join error: {}", e)))?
    }

    /// Run a closure inside one immediate transaction.
    /// Commits when the closure returns `Ok`, rolls back otherwise.
    pub fn with_tx<F, T>(&self, f: F) -> Result<T, RelayError>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, RelayError>,
    {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| RelayError::Database(format!("Lock poisoned: {}", e)))?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    /// Async wrapper around [`Database::with_tx`].
    pub async fn with_tx_async<F, T>(&self, f: F) -> Result<T, RelayError>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, RelayError> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || db.with_tx(f))
            .await
            .map_err(|e| RelayError::Database(format!("Task join error: {}", e)))?
    }

    /// Create all tables if they don't exist.
    fn initialize_tables(&self) -> Result<(), RelayError> {
        self.with_conn(|conn| {
            conn.execute_batch(
                "
                CREATE TABLE IF NOT EXISTS runs (
                    id              TEXT PRIMARY KEY,
                    run_number      INTEGER NOT NULL,
                    workflow_id     TEXT NOT NULL,
                    task            TEXT NOT NULL,
                    status          TEXT NOT NULL DEFAULT 'running',
                    context         TEXT NOT NULL DEFAULT '{}',
                    notify_url      TEXT,
                    created_at      INTEGER NOT NULL,
                    updated_at      INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status);

                CREATE TABLE IF NOT EXISTS steps (
                    id              TEXT PRIMARY KEY,
                    run_id          TEXT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
                    step_id         TEXT NOT NULL,
                    agent_id        TEXT NOT NULL,
                    step_index      INTEGER NOT NULL,
                    input_template  TEXT NOT NULL,
                    expects         TEXT NOT NULL DEFAULT '[]',
                    status          TEXT NOT NULL DEFAULT 'waiting',
                    output          TEXT,
                    last_error      TEXT,
                    retry_count     INTEGER NOT NULL DEFAULT 0,
                    max_retries     INTEGER NOT NULL DEFAULT 0,
                    step_type       TEXT NOT NULL DEFAULT 'single',
                    loop_config     TEXT,
                    created_at      INTEGER NOT NULL,
                    updated_at      INTEGER NOT NULL,
                    UNIQUE (run_id, step_index)
                );
                CREATE INDEX IF NOT EXISTS idx_steps_agent_status ON steps(agent_id, status);
                CREATE INDEX IF NOT EXISTS idx_steps_run ON steps(run_id);

                CREATE TABLE IF NOT EXISTS stories (
                    id                  TEXT PRIMARY KEY,
                    run_id              TEXT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
                    story_index         INTEGER NOT NULL,
                    story_id            TEXT NOT NULL,
                    title               TEXT NOT NULL,
                    description         TEXT NOT NULL DEFAULT '',
                    acceptance_criteria TEXT NOT NULL DEFAULT '[]',
                    status              TEXT NOT NULL DEFAULT 'pending',
                    output              TEXT,
                    last_error          TEXT,
                    retry_count         INTEGER NOT NULL DEFAULT 0,
                    max_retries         INTEGER NOT NULL DEFAULT 0,
                    created_at          INTEGER NOT NULL,
                    updated_at          INTEGER NOT NULL,
                    UNIQUE (run_id, story_id)
                );
                CREATE INDEX IF NOT EXISTS idx_stories_run_status ON stories(run_id, status);

                CREATE TABLE IF NOT EXISTS events (
                    id              INTEGER PRIMARY KEY AUTOINCREMENT,
                    run_id          TEXT NOT NULL,
                    step_id         TEXT,
                    story_id        TEXT,
                    kind            TEXT NOT NULL,
                    detail          TEXT NOT NULL DEFAULT '{}',
                    created_at      INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_events_run ON events(run_id);
                ",
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_in_memory_creates_tables() {
        let db = Database::open_in_memory().unwrap();
        let tables: Vec<String> = db
            .with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
                )?;
                let rows = stmt
                    .query_map([], |row| row.get(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .unwrap();
        assert_eq!(tables, vec!["events", "runs", "steps", "stories"]);
    }

    #[test]
    fn test_with_tx_rolls_back_on_error() {
        let db = Database::open_in_memory().unwrap();
        let result: Result<(), RelayError> = db.with_tx(|tx| {
            tx.execute(
                "INSERT INTO events (run_id, kind, created_at) VALUES ('r1', 'run.created', 0)",
                [],
            )?;
            Err(RelayError::Internal("boom".to_string()))
        });
        assert!(result.is_err());

        let count: i64 = db
            .with_conn(|conn| conn.query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0)))
            .unwrap();
        assert_eq!(count, 0);
    }
}
