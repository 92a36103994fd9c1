use chrono::{Duration, Utc};
use rusqlite::{Connection, OptionalExtension};

use crate::db::Database;
use crate::error::RelayError;
use crate::models::step::{LoopConfig, Step, StepStatus, StepType};
use crate::store::{enum_column, json_column, ts_column};

pub(crate) const STEP_COLUMNS: &str = "id, run_id, step_id, agent_id, step_index, input_template, \
     expects, status, output, last_error, retry_count, max_retries, step_type, loop_config, \
     created_at, updated_at";

#[derive(Clone)]
pub struct StepStore {
    db: Database,
}

impl StepStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn get(&self, id: &str) -> Result<Option<Step>, RelayError> {
        let id = id.to_string();
        self.db.with_conn_async(move |conn| fetch_step(conn, &id)).await
    }

    /// All steps of a run in position order.
    pub async fn list_by_run(&self, run_id: &str) -> Result<Vec<Step>, RelayError> {
        let run_id = run_id.to_string();
        self.db
            .with_conn_async(move |conn| steps_for_run(conn, &run_id))
            .await
    }

    /// Steps of running runs that have sat in `claimed` longer than `older_than`.
    /// Meant for an external watchdog that decides whether to call fail.
    pub async fn list_stale_claims(&self, older_than: Duration) -> Result<Vec<Step>, RelayError> {
        let cutoff = (Utc::now() - older_than).timestamp_millis();
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM steps
                     WHERE status = 'claimed' AND updated_at <= ?1
                       AND run_id IN (SELECT id FROM runs WHERE status = 'running')
                     ORDER BY updated_at ASC",
                    STEP_COLUMNS
                ))?;
                let rows = stmt
                    .query_map(rusqlite::params![cutoff], row_to_step)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }
}

pub(crate) fn fetch_step(conn: &Connection, id: &str) -> rusqlite::Result<Option<Step>> {
    conn.query_row(
        &format!("SELECT {} FROM steps WHERE id = ?1", STEP_COLUMNS),
        rusqlite::params![id],
        row_to_step,
    )
    .optional()
}

pub(crate) fn steps_for_run(conn: &Connection, run_id: &str) -> rusqlite::Result<Vec<Step>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM steps WHERE run_id = ?1 ORDER BY step_index ASC",
        STEP_COLUMNS
    ))?;
    let rows = stmt
        .query_map(rusqlite::params![run_id], row_to_step)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub(crate) fn step_at(
    conn: &Connection,
    run_id: &str,
    step_index: u32,
) -> rusqlite::Result<Option<Step>> {
    conn.query_row(
        &format!(
            "SELECT {} FROM steps WHERE run_id = ?1 AND step_index = ?2",
            STEP_COLUMNS
        ),
        rusqlite::params![run_id, step_index],
        row_to_step,
    )
    .optional()
}

pub(crate) fn row_to_step(row: &rusqlite::Row<'_>) -> rusqlite::Result<Step> {
    let loop_raw: Option<String> = row.get(13)?;
    let loop_config = match loop_raw {
        Some(raw) => Some(serde_json::from_str::<LoopConfig>(&raw).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(13, rusqlite::types::Type::Text, Box::new(e))
        })?),
        None => None,
    };
    Ok(Step {
        id: row.get(0)?,
        run_id: row.get(1)?,
        step_id: row.get(2)?,
        agent_id: row.get(3)?,
        step_index: row.get(4)?,
        input_template: row.get(5)?,
        expects: json_column(row, 6)?,
        status: enum_column(row, 7, StepStatus::from_str)?,
        output: row.get(8)?,
        last_error: row.get(9)?,
        retry_count: row.get(10)?,
        max_retries: row.get(11)?,
        step_type: enum_column(row, 12, StepType::from_str)?,
        loop_config,
        created_at: ts_column(row, 14)?,
        updated_at: ts_column(row, 15)?,
    })
}
