use chrono::Utc;
use rusqlite::Connection;

use crate::db::Database;
use crate::error::RelayError;
use crate::models::event::{EventKind, RunEvent};
use crate::store::{enum_column, json_column, ts_column};

const EVENT_COLUMNS: &str = "id, run_id, step_id, story_id, kind, detail, created_at";

#[derive(Clone)]
pub struct EventStore {
    db: Database,
}

impl EventStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Events of a run, oldest first.
    pub async fn list_by_run(&self, run_id: &str) -> Result<Vec<RunEvent>, RelayError> {
        let run_id = run_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM events WHERE run_id = ?1 ORDER BY id ASC",
                    EVENT_COLUMNS
                ))?;
                let rows = stmt
                    .query_map(rusqlite::params![run_id], row_to_event)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    /// Events with an id greater than `after_id`, oldest first.
    /// Lets a sync collaborator catch up after downtime.
    pub async fn list_after(&self, after_id: i64, limit: u32) -> Result<Vec<RunEvent>, RelayError> {
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM events WHERE id > ?1 ORDER BY id ASC LIMIT ?2",
                    EVENT_COLUMNS
                ))?;
                let rows = stmt
                    .query_map(rusqlite::params![after_id, limit], row_to_event)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }
}

/// Append one event row and return it with its assigned id.
pub(crate) fn insert_event(
    conn: &Connection,
    run_id: &str,
    step_id: Option<&str>,
    story_id: Option<&str>,
    kind: EventKind,
    detail: serde_json::Value,
) -> rusqlite::Result<RunEvent> {
    let now = Utc::now();
    conn.execute(
        "INSERT INTO events (run_id, step_id, story_id, kind, detail, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        rusqlite::params![
            run_id,
            step_id,
            story_id,
            kind.as_str(),
            detail.to_string(),
            now.timestamp_millis(),
        ],
    )?;
    Ok(RunEvent {
        id: conn.last_insert_rowid(),
        run_id: run_id.to_string(),
        step_id: step_id.map(str::to_string),
        story_id: story_id.map(str::to_string),
        kind,
        detail,
        created_at: now,
    })
}

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<RunEvent> {
    Ok(RunEvent {
        id: row.get(0)?,
        run_id: row.get(1)?,
        step_id: row.get(2)?,
        story_id: row.get(3)?,
        kind: enum_column(row, 4, EventKind::from_str)?,
        detail: json_column(row, 5)?,
        created_at: ts_column(row, 6)?,
    })
}
