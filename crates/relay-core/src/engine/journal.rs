//! Transaction-scoped helpers shared by every engine operation.
//!
//! A [`Journal`] wraps the open transaction and collects the events it
//! appends, so the engine can publish them once the commit succeeded.
//! Every status change here is a compare-and-set: the `UPDATE` names the
//! statuses it may move from and reports whether a row actually changed.

use chrono::Utc;
use rusqlite::Connection;
use serde::Serialize;

use crate::error::RelayError;
use crate::models::event::{EventKind, RunEvent};
use crate::models::run::{Run, RunContext, RunStatus};
use crate::models::step::{Step, StepStatus};
use crate::models::story::StoryStatus;
use crate::store::event_store::insert_event;
use crate::store::step_store::step_at;

pub(crate) struct Journal<'a> {
    conn: &'a Connection,
    events: Vec<RunEvent>,
}

impl<'a> Journal<'a> {
    pub(crate) fn new(conn: &'a Connection) -> Self {
        Self {
            conn,
            events: Vec::new(),
        }
    }

    pub(crate) fn conn(&self) -> &'a Connection {
        self.conn
    }

    pub(crate) fn record(
        &mut self,
        run_id: &str,
        step_id: Option<&str>,
        story_id: Option<&str>,
        kind: EventKind,
        detail: serde_json::Value,
    ) -> Result<(), RelayError> {
        let event = insert_event(self.conn, run_id, step_id, story_id, kind, detail)?;
        self.events.push(event);
        Ok(())
    }

    pub(crate) fn into_events(self) -> Vec<RunEvent> {
        self.events
    }
}

/// Where the pipeline stands after a step finished.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Advance {
    /// The next step is claimable now.
    NextStep { step_id: String },
    /// No steps left; the run is done.
    RunDone,
}

pub(crate) fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn status_list<'s>(statuses: impl Iterator<Item = &'s str>) -> String {
    statuses
        .map(|s| format!("'{}'", s))
        .collect::<Vec<_>>()
        .join(", ")
}

pub(crate) fn set_run_status(
    conn: &Connection,
    run_id: &str,
    from: &[RunStatus],
    to: RunStatus,
) -> Result<bool, RelayError> {
    let sql = format!(
        "UPDATE runs SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status IN ({})",
        status_list(from.iter().map(RunStatus::as_str))
    );
    let changed = conn.execute(&sql, rusqlite::params![to.as_str(), now_ms(), run_id])?;
    Ok(changed == 1)
}

pub(crate) fn set_step_status(
    conn: &Connection,
    step_id: &str,
    from: &[StepStatus],
    to: StepStatus,
) -> Result<bool, RelayError> {
    let sql = format!(
        "UPDATE steps SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status IN ({})",
        status_list(from.iter().map(StepStatus::as_str))
    );
    let changed = conn.execute(&sql, rusqlite::params![to.as_str(), now_ms(), step_id])?;
    Ok(changed == 1)
}

pub(crate) fn write_context(
    conn: &Connection,
    run_id: &str,
    context: &RunContext,
) -> Result<(), RelayError> {
    conn.execute(
        "UPDATE runs SET context = ?1, updated_at = ?2 WHERE id = ?3",
        rusqlite::params![context.to_json(), now_ms(), run_id],
    )?;
    Ok(())
}

pub(crate) fn count_stories(
    conn: &Connection,
    run_id: &str,
    status: Option<StoryStatus>,
) -> Result<u32, RelayError> {
    let count: u32 = match status {
        Some(status) => conn.query_row(
            "SELECT COUNT(*) FROM stories WHERE run_id = ?1 AND status = ?2",
            rusqlite::params![run_id, status.as_str()],
            |row| row.get(0),
        )?,
        None => conn.query_row(
            "SELECT COUNT(*) FROM stories WHERE run_id = ?1",
            rusqlite::params![run_id],
            |row| row.get(0),
        )?,
    };
    Ok(count)
}

/// Move a `waiting` step to `pending`. A loop step with an empty backlog
/// has nothing to do and finishes on the spot.
pub(crate) fn activate_step(
    journal: &mut Journal<'_>,
    run: &Run,
    step: &Step,
) -> Result<Advance, RelayError> {
    let conn = journal.conn();
    if !set_step_status(conn, &step.id, &[StepStatus::Waiting], StepStatus::Pending)? {
        return Ok(Advance::NextStep {
            step_id: step.step_id.clone(),
        });
    }
    journal.record(
        &run.id,
        Some(&step.id),
        None,
        EventKind::StepPending,
        serde_json::json!({ "stepId": step.step_id, "agentId": step.agent_id }),
    )?;

    if step.is_loop() && count_stories(conn, &run.id, None)? == 0 {
        set_step_status(conn, &step.id, &[StepStatus::Pending], StepStatus::Done)?;
        journal.record(
            &run.id,
            Some(&step.id),
            None,
            EventKind::StepDone,
            serde_json::json!({ "stepId": step.step_id, "stories": 0 }),
        )?;
        tracing::info!(
            "[Engine] loop step {} of run {} has no stories; skipping ahead",
            step.step_id,
            run.id
        );
        return advance_from(journal, run, step);
    }

    Ok(Advance::NextStep {
        step_id: step.step_id.clone(),
    })
}

/// After `done_step` finished: open the next step, or finish the run.
///
/// Callers hold a running run: reports and skips on other runs are turned
/// away before anything finishes, and approve/resume/create only activate
/// steps once the run is running.
pub(crate) fn advance_from(
    journal: &mut Journal<'_>,
    run: &Run,
    done_step: &Step,
) -> Result<Advance, RelayError> {
    let conn = journal.conn();
    match step_at(conn, &run.id, done_step.step_index + 1)? {
        None => {
            if set_run_status(conn, &run.id, &[RunStatus::Running], RunStatus::Done)? {
                journal.record(
                    &run.id,
                    None,
                    None,
                    EventKind::RunDone,
                    serde_json::json!({ "workflowId": run.workflow_id }),
                )?;
                tracing::info!("[Engine] run {} (#{}) done", run.id, run.run_number);
            }
            Ok(Advance::RunDone)
        }
        Some(next) => activate_step(journal, run, &next),
    }
}

/// Mark a run failed together with the event, if it is still running.
pub(crate) fn fail_run(
    journal: &mut Journal<'_>,
    run: &Run,
    reason: &str,
) -> Result<bool, RelayError> {
    let changed = set_run_status(
        journal.conn(),
        &run.id,
        &[RunStatus::Running, RunStatus::Paused],
        RunStatus::Failed,
    )?;
    if changed {
        journal.record(
            &run.id,
            None,
            None,
            EventKind::RunFailed,
            serde_json::json!({ "reason": reason }),
        )?;
        tracing::error!("[Engine] run {} (#{}) failed: {}", run.id, run.run_number, reason);
    }
    Ok(changed)
}
