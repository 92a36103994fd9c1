//! Operator transitions: approve, resume, cancel, skip a story.

use super::journal::{activate_step, now_ms, set_run_status, Journal};
use super::stories::skip_story as skip_pending_story;
use super::LoopState;
use crate::error::RelayError;
use crate::models::event::EventKind;
use crate::models::run::{Run, RunStatus};
use crate::models::step::StepStatus;
use crate::store::run_store::fetch_run;
use crate::store::step_store::{step_at, steps_for_run};
use crate::store::story_store::fetch_story;

fn load_run(journal: &Journal<'_>, run_id: &str) -> Result<Run, RelayError> {
    fetch_run(journal.conn(), run_id)?.ok_or_else(|| RelayError::NotFound(format!("run {}", run_id)))
}

pub(crate) fn approve(journal: &mut Journal<'_>, run_id: &str) -> Result<Run, RelayError> {
    let mut run = load_run(journal, run_id)?;
    if run.status != RunStatus::Paused
        || !set_run_status(journal.conn(), &run.id, &[RunStatus::Paused], RunStatus::Running)?
    {
        return Err(RelayError::NotPaused {
            run_id: run.id,
            status: run.status.to_string(),
        });
    }
    run.status = RunStatus::Running;
    journal.record(&run.id, None, None, EventKind::RunApproved, serde_json::json!({}))?;
    tracing::info!("[Engine] run {} (#{}) approved", run.id, run.run_number);

    if let Some(first) = step_at(journal.conn(), &run.id, 0)? {
        activate_step(journal, &run, &first)?;
    }
    load_run(journal, run_id)
}

/// Put a failed run back to work from its failed step.
///
/// The failed step gets a fresh retry budget. For a loop step, failed
/// stories (and any left in progress) go back to `pending` with theirs
/// reset too. If no step failed (polling could not be set up at creation),
/// the lowest waiting step is opened instead.
pub(crate) fn resume(journal: &mut Journal<'_>, run_id: &str) -> Result<Run, RelayError> {
    let mut run = load_run(journal, run_id)?;
    if run.status != RunStatus::Failed {
        return Err(RelayError::NotResumable {
            run_id: run.id,
            status: run.status.to_string(),
        });
    }
    let conn = journal.conn();
    if !set_run_status(conn, &run.id, &[RunStatus::Failed], RunStatus::Running)? {
        return Err(RelayError::NotResumable {
            run_id: run.id,
            status: run.status.to_string(),
        });
    }
    run.status = RunStatus::Running;

    let steps = steps_for_run(conn, &run.id)?;
    let failed = steps.iter().find(|s| s.status == StepStatus::Failed);
    let now = now_ms();

    journal.record(
        &run.id,
        failed.map(|s| s.id.as_str()),
        None,
        EventKind::RunResumed,
        serde_json::json!({ "fromStep": failed.map(|s| s.step_id.as_str()) }),
    )?;

    match failed {
        Some(step) => {
            conn.execute(
                "UPDATE steps SET status = 'pending', retry_count = 0, last_error = NULL, updated_at = ?1
                 WHERE id = ?2 AND status = 'failed'",
                rusqlite::params![now, step.id],
            )?;
            if step.is_loop() {
                let reset = conn.execute(
                    "UPDATE stories SET status = 'pending', retry_count = 0, updated_at = ?1
                     WHERE run_id = ?2 AND status IN ('failed', 'in_progress')",
                    rusqlite::params![now, run.id],
                )?;
                tracing::info!("[Engine] resume of run {} reset {} stories", run.id, reset);
            }
            journal.record(
                &run.id,
                Some(&step.id),
                None,
                EventKind::StepPending,
                serde_json::json!({ "stepId": step.step_id, "agentId": step.agent_id }),
            )?;
        }
        None => {
            let active = steps
                .iter()
                .any(|s| matches!(s.status, StepStatus::Pending | StepStatus::Claimed));
            if !active {
                if let Some(next) = steps.iter().find(|s| s.status == StepStatus::Waiting) {
                    activate_step(journal, &run, next)?;
                }
            }
        }
    }

    tracing::info!("[Engine] run {} (#{}) resumed", run.id, run.run_number);
    load_run(journal, run_id)
}

pub(crate) fn cancel(journal: &mut Journal<'_>, run_id: &str) -> Result<Run, RelayError> {
    let run = load_run(journal, run_id)?;
    let cancellable = [RunStatus::Running, RunStatus::Paused, RunStatus::Failed];
    if !cancellable.contains(&run.status)
        || !set_run_status(journal.conn(), &run.id, &cancellable, RunStatus::Cancelled)?
    {
        return Err(RelayError::NotCancellable {
            run_id: run.id,
            status: run.status.to_string(),
        });
    }
    journal.record(
        &run.id,
        None,
        None,
        EventKind::RunCancelled,
        serde_json::json!({ "from": run.status.as_str() }),
    )?;
    tracing::info!("[Engine] run {} (#{}) cancelled", run.id, run.run_number);
    load_run(journal, run_id)
}

pub(crate) fn skip_story(
    journal: &mut Journal<'_>,
    story_id: &str,
) -> Result<Option<LoopState>, RelayError> {
    let story = fetch_story(journal.conn(), story_id)?
        .ok_or_else(|| RelayError::NotFound(format!("story {}", story_id)))?;
    let run = load_run(journal, &story.run_id)?;
    if matches!(run.status, RunStatus::Done | RunStatus::Cancelled) {
        return Err(RelayError::Validation(format!(
            "run {} is {}; its stories can no longer change",
            run.id, run.status
        )));
    }
    skip_pending_story(journal, &run, &story)
}
