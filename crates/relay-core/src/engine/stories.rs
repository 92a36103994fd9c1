//! Loop controller: drives a loop step through the run's story backlog.
//!
//! A loop step stays `pending` while stories wait and no slot is taken,
//! `claimed` while at least one story is in progress, and becomes `done`
//! once every story is terminal. Each story carries its own retry budget.

use rusqlite::{Connection, OptionalExtension};
use uuid::Uuid;

use super::journal::{
    advance_from, count_stories, fail_run, now_ms, set_step_status, write_context, Journal,
};
use super::{CompleteOutcome, FailOutcome, LoopState};
use crate::error::RelayError;
use crate::models::event::EventKind;
use crate::models::run::{Run, RunContext};
use crate::models::step::{Step, StepStatus, StoryFailurePolicy};
use crate::models::story::{Story, StorySeed, StoryStatus};
use crate::store::story_store::{row_to_story, stories_for_run, STORY_COLUMNS};
use crate::workflow::output::{missing_keys, parse_output};

pub(crate) fn insert_stories(
    journal: &mut Journal<'_>,
    run_id: &str,
    seeds: &[StorySeed],
    default_max_retries: u32,
) -> Result<(), RelayError> {
    let conn = journal.conn();
    let now = now_ms();
    for (index, seed) in seeds.iter().enumerate() {
        conn.execute(
            "INSERT INTO stories (id, run_id, story_index, story_id, title, description,
                                  acceptance_criteria, status, retry_count, max_retries, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'pending', 0, ?8, ?9, ?10)",
            rusqlite::params![
                Uuid::new_v4().to_string(),
                run_id,
                index as u32,
                seed.id,
                seed.title,
                seed.description,
                serde_json::to_string(&seed.acceptance_criteria)?,
                seed.max_retries.unwrap_or(default_max_retries),
                now,
                now,
            ],
        )?;
    }
    journal.record(
        run_id,
        None,
        None,
        EventKind::StorySeeded,
        serde_json::json!({
            "count": seeds.len(),
            "storyIds": seeds.iter().map(|s| s.id.as_str()).collect::<Vec<_>>(),
        }),
    )?;
    tracing::info!("[Loop] seeded {} stories for run {}", seeds.len(), run_id);
    Ok(())
}

pub(crate) fn next_pending_story(
    conn: &Connection,
    run_id: &str,
) -> Result<Option<Story>, RelayError> {
    let story = conn
        .query_row(
            &format!(
                "SELECT {} FROM stories WHERE run_id = ?1 AND status = 'pending'
                 ORDER BY story_index ASC LIMIT 1",
                STORY_COLUMNS
            ),
            rusqlite::params![run_id],
            row_to_story,
        )
        .optional()?;
    Ok(story)
}

pub(crate) fn loop_step_of(conn: &Connection, run_id: &str) -> Result<Option<Step>, RelayError> {
    let step = conn
        .query_row(
            &format!(
                "SELECT {} FROM steps WHERE run_id = ?1 AND step_type = 'loop'
                 ORDER BY step_index ASC LIMIT 1",
                crate::store::step_store::STEP_COLUMNS
            ),
            rusqlite::params![run_id],
            crate::store::step_store::row_to_step,
        )
        .optional()?;
    Ok(step)
}

/// Run context plus the story variables a loop step's input may reference.
pub(crate) fn story_context(
    conn: &Connection,
    run: &Run,
    story: &Story,
) -> Result<RunContext, RelayError> {
    let stories = stories_for_run(conn, &run.id)?;
    let completed: Vec<String> = stories
        .iter()
        .filter(|s| s.status == StoryStatus::Done)
        .map(|s| format!("{}: {}", s.story_id, s.title))
        .collect();
    let remaining = stories
        .iter()
        .filter(|s| !s.status.is_terminal() && s.id != story.id)
        .count();

    let mut context = run.context.clone();
    context.insert("current_story", story.render());
    context.insert("current_story_id", story.story_id.as_str());
    context.insert("current_story_title", story.title.as_str());
    context.insert(
        "completed_stories",
        if completed.is_empty() {
            "(none)".to_string()
        } else {
            completed.join("\n")
        },
    );
    context.insert("stories_remaining", remaining.to_string());
    Ok(context)
}

/// Start one story. Returns false when another poller got to it first.
pub(crate) fn start_story(
    journal: &mut Journal<'_>,
    step: &Step,
    story: &Story,
) -> Result<bool, RelayError> {
    let conn = journal.conn();
    let changed = conn.execute(
        "UPDATE stories SET status = 'in_progress', updated_at = ?1
         WHERE id = ?2 AND status = 'pending'",
        rusqlite::params![now_ms(), story.id],
    )?;
    if changed == 0 {
        return Ok(false);
    }
    let was_pending = step.status == StepStatus::Pending;
    set_step_status(
        conn,
        &step.id,
        &[StepStatus::Pending, StepStatus::Claimed],
        StepStatus::Claimed,
    )?;
    if was_pending {
        journal.record(
            &step.run_id,
            Some(&step.id),
            None,
            EventKind::StepClaimed,
            serde_json::json!({ "stepId": step.step_id, "agentId": step.agent_id }),
        )?;
    }
    journal.record(
        &step.run_id,
        Some(&step.id),
        Some(&story.id),
        EventKind::StoryStarted,
        serde_json::json!({
            "storyId": story.story_id,
            "attempt": story.retry_count + 1,
        }),
    )?;
    Ok(true)
}

/// The single in-progress story a step-level report refers to.
pub(crate) fn sole_story_in_progress(
    conn: &Connection,
    step: &Step,
) -> Result<Option<Story>, RelayError> {
    let mut in_progress: Vec<Story> = stories_for_run(conn, &step.run_id)?
        .into_iter()
        .filter(|s| s.status == StoryStatus::InProgress)
        .collect();
    match in_progress.len() {
        0 => Ok(None),
        1 => Ok(in_progress.pop()),
        n => Err(RelayError::Validation(format!(
            "loop step {} has {} stories in progress; report by story id",
            step.step_id, n
        ))),
    }
}

pub(crate) fn complete_story(
    journal: &mut Journal<'_>,
    run: &Run,
    step: &Step,
    story: &Story,
    output: &str,
) -> Result<CompleteOutcome, RelayError> {
    let parsed = parse_output(output);
    let missing = missing_keys(&parsed, &step.expects);
    if !missing.is_empty() {
        let reason = format!("missing required output keys: {}", missing.join(", "));
        let failure = fail_story(journal, run, step, story, StoryStatus::InProgress, &reason)?;
        return Ok(CompleteOutcome::Rejected { reason, failure });
    }

    let conn = journal.conn();
    let changed = conn.execute(
        "UPDATE stories SET status = 'done', output = ?1, updated_at = ?2
         WHERE id = ?3 AND status = 'in_progress'",
        rusqlite::params![output, now_ms(), story.id],
    )?;
    if changed == 0 {
        return Ok(CompleteOutcome::AlreadyHandled);
    }

    let mut context = run.context.clone();
    for (key, value) in parsed.iter() {
        context.insert(format!("{}.{}", story.story_id, key), value);
    }
    write_context(conn, &run.id, &context)?;

    journal.record(
        &run.id,
        Some(&step.id),
        Some(&story.id),
        EventKind::StoryDone,
        serde_json::json!({
            "storyId": story.story_id,
            "keys": parsed.keys().collect::<Vec<_>>(),
        }),
    )?;
    tracing::info!("[Loop] story {} of run {} done", story.story_id, run.id);

    let loop_state = settle_loop(journal, run, step)?;
    Ok(CompleteOutcome::StoryDone {
        story_id: story.story_id.clone(),
        loop_state,
    })
}

/// Charge one failure to a story that is currently in `from`.
pub(crate) fn fail_story(
    journal: &mut Journal<'_>,
    run: &Run,
    step: &Step,
    story: &Story,
    from: StoryStatus,
    error: &str,
) -> Result<FailOutcome, RelayError> {
    let conn = journal.conn();
    let retry_count = story.retry_count + 1;

    if retry_count <= story.max_retries {
        let changed = conn.execute(
            "UPDATE stories SET status = 'pending', retry_count = ?1, last_error = ?2, updated_at = ?3
             WHERE id = ?4 AND status = ?5",
            rusqlite::params![retry_count, error, now_ms(), story.id, from.as_str()],
        )?;
        if changed == 0 {
            return Ok(FailOutcome::AlreadyHandled);
        }
        journal.record(
            &run.id,
            Some(&step.id),
            Some(&story.id),
            EventKind::StoryRetry,
            serde_json::json!({
                "storyId": story.story_id,
                "retryCount": retry_count,
                "maxRetries": story.max_retries,
                "error": error,
            }),
        )?;
        tracing::warn!(
            "[Loop] story {} of run {} failed (attempt {}/{}), retrying: {}",
            story.story_id,
            run.id,
            retry_count,
            story.max_retries + 1,
            error
        );
        release_step(conn, step)?;
        return Ok(FailOutcome::StoryRetrying {
            story_id: story.story_id.clone(),
            retry_count,
            max_retries: story.max_retries,
        });
    }

    let changed = conn.execute(
        "UPDATE stories SET status = 'failed', retry_count = ?1, last_error = ?2, updated_at = ?3
         WHERE id = ?4 AND status = ?5",
        rusqlite::params![retry_count, error, now_ms(), story.id, from.as_str()],
    )?;
    if changed == 0 {
        return Ok(FailOutcome::AlreadyHandled);
    }
    journal.record(
        &run.id,
        Some(&step.id),
        Some(&story.id),
        EventKind::StoryFailed,
        serde_json::json!({
            "storyId": story.story_id,
            "retryCount": retry_count,
            "error": error,
        }),
    )?;
    tracing::warn!(
        "[Loop] story {} of run {} exhausted its retries: {}",
        story.story_id,
        run.id,
        error
    );

    let loop_state = match step.loop_settings().on_story_failure {
        StoryFailurePolicy::Abort => {
            let reason = format!("story {} failed: {}", story.story_id, error);
            conn.execute(
                "UPDATE steps SET status = 'failed', last_error = ?1, updated_at = ?2
                 WHERE id = ?3 AND status IN ('pending', 'claimed')",
                rusqlite::params![reason, now_ms(), step.id],
            )?;
            journal.record(
                &run.id,
                Some(&step.id),
                None,
                EventKind::StepFailed,
                serde_json::json!({ "stepId": step.step_id, "error": reason }),
            )?;
            fail_run(journal, run, &reason)?;
            LoopState::Aborted
        }
        StoryFailurePolicy::Tolerate => settle_loop(journal, run, step)?,
    };

    Ok(FailOutcome::StoryFailed {
        story_id: story.story_id.clone(),
        loop_state,
    })
}

/// Operator decision to drop a pending story from the backlog.
pub(crate) fn skip_story(
    journal: &mut Journal<'_>,
    run: &Run,
    story: &Story,
) -> Result<Option<LoopState>, RelayError> {
    let conn = journal.conn();
    let changed = conn.execute(
        "UPDATE stories SET status = 'skipped', updated_at = ?1 WHERE id = ?2 AND status = 'pending'",
        rusqlite::params![now_ms(), story.id],
    )?;
    if changed == 0 {
        return Err(RelayError::Validation(format!(
            "story {} is {}; only pending stories can be skipped",
            story.story_id, story.status
        )));
    }

    let step = loop_step_of(conn, &run.id)?;
    journal.record(
        &run.id,
        step.as_ref().map(|s| s.id.as_str()),
        Some(&story.id),
        EventKind::StorySkipped,
        serde_json::json!({ "storyId": story.story_id }),
    )?;
    tracing::info!("[Loop] story {} of run {} skipped", story.story_id, run.id);

    match step {
        Some(step)
            if matches!(step.status, StepStatus::Pending | StepStatus::Claimed)
                && run.status == crate::models::run::RunStatus::Running =>
        {
            Ok(Some(settle_loop(journal, run, &step)?))
        }
        _ => Ok(None),
    }
}

/// Finish the loop step when the backlog is exhausted, otherwise hand the
/// step back to `pending` if no story is being worked on.
pub(crate) fn settle_loop(
    journal: &mut Journal<'_>,
    run: &Run,
    step: &Step,
) -> Result<LoopState, RelayError> {
    let conn = journal.conn();
    let pending = count_stories(conn, &run.id, Some(StoryStatus::Pending))?;
    let in_progress = count_stories(conn, &run.id, Some(StoryStatus::InProgress))?;

    if pending > 0 || in_progress > 0 {
        release_step(conn, step)?;
        return Ok(LoopState::Continuing);
    }

    let done = count_stories(conn, &run.id, Some(StoryStatus::Done))?;
    let failed = count_stories(conn, &run.id, Some(StoryStatus::Failed))?;
    let skipped = count_stories(conn, &run.id, Some(StoryStatus::Skipped))?;
    if !set_step_status(
        conn,
        &step.id,
        &[StepStatus::Pending, StepStatus::Claimed],
        StepStatus::Done,
    )? {
        return Ok(LoopState::Continuing);
    }
    journal.record(
        &run.id,
        Some(&step.id),
        None,
        EventKind::StepDone,
        serde_json::json!({
            "stepId": step.step_id,
            "storiesDone": done,
            "storiesFailed": failed,
            "storiesSkipped": skipped,
        }),
    )?;
    tracing::info!(
        "[Loop] loop step {} of run {} finished: {} done, {} failed, {} skipped",
        step.step_id,
        run.id,
        done,
        failed,
        skipped
    );
    Ok(LoopState::Finished(advance_from(journal, run, step)?))
}

fn release_step(conn: &Connection, step: &Step) -> Result<(), RelayError> {
    if count_stories(conn, &step.run_id, Some(StoryStatus::InProgress))? == 0 {
        set_step_status(conn, &step.id, &[StepStatus::Claimed], StepStatus::Pending)?;
    }
    Ok(())
}
