use rusqlite::{Connection, OptionalExtension};

use crate::db::Database;
use crate::error::RelayError;
use crate::models::story::{Story, StoryStatus};
use crate::store::{enum_column, json_column, ts_column};

pub(crate) const STORY_COLUMNS: &str = "id, run_id, story_index, story_id, title, description, \
     acceptance_criteria, status, output, last_error, retry_count, max_retries, created_at, updated_at";

#[derive(Clone)]
pub struct StoryStore {
    db: Database,
}

impl StoryStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn get(&self, id: &str) -> Result<Option<Story>, RelayError> {
        let id = id.to_string();
        self.db.with_conn_async(move |conn| fetch_story(conn, &id)).await
    }

    /// Look a story up by its backlog id within a run.
    pub async fn get_by_story_id(
        &self,
        run_id: &str,
        story_id: &str,
    ) -> Result<Option<Story>, RelayError> {
        let run_id = run_id.to_string();
        let story_id = story_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                conn.query_row(
                    &format!(
                        "SELECT {} FROM stories WHERE run_id = ?1 AND story_id = ?2",
                        STORY_COLUMNS
                    ),
                    rusqlite::params![run_id, story_id],
                    row_to_story,
                )
                .optional()
            })
            .await
    }

    /// All stories of a run in backlog order.
    pub async fn list_by_run(&self, run_id: &str) -> Result<Vec<Story>, RelayError> {
        let run_id = run_id.to_string();
        self.db
            .with_conn_async(move |conn| stories_for_run(conn, &run_id))
            .await
    }
}

pub(crate) fn fetch_story(conn: &Connection, id: &str) -> rusqlite::Result<Option<Story>> {
    conn.query_row(
        &format!("SELECT {} FROM stories WHERE id = ?1", STORY_COLUMNS),
        rusqlite::params![id],
        row_to_story,
    )
    .optional()
}

pub(crate) fn stories_for_run(conn: &Connection, run_id: &str) -> rusqlite::Result<Vec<Story>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM stories WHERE run_id = ?1 ORDER BY story_index ASC",
        STORY_COLUMNS
    ))?;
    let rows = stmt
        .query_map(rusqlite::params![run_id], row_to_story)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub(crate) fn row_to_story(row: &rusqlite::Row<'_>) -> rusqlite::Result<Story> {
    Ok(Story {
        id: row.get(0)?,
        run_id: row.get(1)?,
        story_index: row.get(2)?,
        story_id: row.get(3)?,
        title: row.get(4)?,
        description: row.get(5)?,
        acceptance_criteria: json_column(row, 6)?,
        status: enum_column(row, 7, StoryStatus::from_str)?,
        output: row.get(8)?,
        last_error: row.get(9)?,
        retry_count: row.get(10)?,
        max_retries: row.get(11)?,
        created_at: ts_column(row, 12)?,
        updated_at: ts_column(row, 13)?,
    })
}
