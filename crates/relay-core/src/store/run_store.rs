use rusqlite::{Connection, OptionalExtension};

use crate::db::Database;
use crate::error::RelayError;
use crate::models::run::{Run, RunContext, RunStatus};
use crate::store::{enum_column, ts_column};

pub(crate) const RUN_COLUMNS: &str =
    "id, run_number, workflow_id, task, status, context, notify_url, created_at, updated_at";

#[derive(Clone)]
pub struct RunStore {
    db: Database,
}

impl RunStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn get(&self, id: &str) -> Result<Option<Run>, RelayError> {
        let id = id.to_string();
        self.db.with_conn_async(move |conn| fetch_run(conn, &id)).await
    }

    pub async fn get_by_number(&self, run_number: i64) -> Result<Option<Run>, RelayError> {
        self.db
            .with_conn_async(move |conn| {
                conn.query_row(
                    &format!("SELECT {} FROM runs WHERE run_number = ?1", RUN_COLUMNS),
                    rusqlite::params![run_number],
                    row_to_run,
                )
                .optional()
            })
            .await
    }

    /// Look a run up by id, or by display number (`12` or `#12`).
    pub async fn find(&self, reference: &str) -> Result<Run, RelayError> {
        let trimmed = reference.trim();
        let by_number = trimmed
            .strip_prefix('#')
            .unwrap_or(trimmed)
            .parse::<i64>()
            .ok();
        let found = match by_number {
            Some(n) => self.get_by_number(n).await?,
            None => self.get(trimmed).await?,
        };
        found.ok_or_else(|| RelayError::NotFound(format!("run '{}'", reference)))
    }

    pub async fn list(&self) -> Result<Vec<Run>, RelayError> {
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM runs ORDER BY run_number DESC",
                    RUN_COLUMNS
                ))?;
                let rows = stmt
                    .query_map([], row_to_run)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    pub async fn list_by_status(&self, status: RunStatus) -> Result<Vec<Run>, RelayError> {
        let status_str = status.as_str();
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM runs WHERE status = ?1 ORDER BY run_number DESC",
                    RUN_COLUMNS
                ))?;
                let rows = stmt
                    .query_map(rusqlite::params![status_str], row_to_run)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }
}

pub(crate) fn fetch_run(conn: &Connection, id: &str) -> rusqlite::Result<Option<Run>> {
    conn.query_row(
        &format!("SELECT {} FROM runs WHERE id = ?1", RUN_COLUMNS),
        rusqlite::params![id],
        row_to_run,
    )
    .optional()
}

pub(crate) fn row_to_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<Run> {
    let context_raw: String = row.get(5)?;
    let context = RunContext::from_json(&context_raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(Run {
        id: row.get(0)?,
        run_number: row.get(1)?,
        workflow_id: row.get(2)?,
        task: row.get(3)?,
        status: enum_column(row, 4, RunStatus::from_str)?,
        context,
        notify_url: row.get(6)?,
        created_at: ts_column(row, 7)?,
        updated_at: ts_column(row, 8)?,
    })
}
