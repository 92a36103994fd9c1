//! Worker-facing transitions: peek, claim, complete, fail.

use rusqlite::Connection;

use super::journal::{
    advance_from, count_stories, fail_run, now_ms, set_step_status, write_context, Journal,
};
use super::stories::{
    complete_story, fail_story, insert_stories, loop_step_of, next_pending_story,
    sole_story_in_progress, start_story, story_context,
};
use super::{ClaimOutcome, ClaimedWork, CompleteOutcome, FailOutcome};
use crate::error::RelayError;
use crate::models::event::EventKind;
use crate::models::run::{Run, RunStatus};
use crate::models::step::{Step, StepStatus};
use crate::models::story::{Story, StoryStatus};
use crate::store::run_store::fetch_run;
use crate::store::step_store::{fetch_step, row_to_step, STEP_COLUMNS};
use crate::store::story_store::fetch_story;
use crate::workflow::output::{missing_keys, parse_output, parse_story_seeds, STORIES_KEY};
use crate::workflow::template::interpolate;

/// Retry ceiling for stories seeded by a run without a loop step.
const FALLBACK_STORY_MAX_RETRIES: u32 = 2;

/// Claim result before the engine turns unresolved input into an error;
/// the failure it charged to the step must be committed first.
pub(crate) enum ClaimAttempt {
    Done(ClaimOutcome),
    Unresolved(Vec<String>),
}

pub(crate) struct Candidate {
    pub step: Step,
    pub story: Option<Story>,
}

/// Claimable work for `agent_id` across running runs, lowest position first.
/// A loop step contributes its next pending story while it has a free slot.
pub(crate) fn claimable_candidates(
    conn: &Connection,
    agent_id: &str,
) -> Result<Vec<Candidate>, RelayError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM steps
         WHERE agent_id = ?1
           AND ((step_type = 'single' AND status = 'pending')
             OR (step_type = 'loop' AND status IN ('pending', 'claimed')))
           AND run_id IN (SELECT id FROM runs WHERE status = 'running')
         ORDER BY step_index ASC, created_at ASC, rowid ASC",
        STEP_COLUMNS
    ))?;
    let steps = stmt
        .query_map(rusqlite::params![agent_id], row_to_step)?
        .collect::<Result<Vec<_>, _>>()?;

    let mut candidates = Vec::new();
    for step in steps {
        if !step.is_loop() {
            candidates.push(Candidate { step, story: None });
            continue;
        }
        let busy = count_stories(conn, &step.run_id, Some(StoryStatus::InProgress))?;
        if busy >= step.loop_settings().concurrency.max(1) {
            continue;
        }
        if let Some(story) = next_pending_story(conn, &step.run_id)? {
            candidates.push(Candidate {
                step,
                story: Some(story),
            });
        }
    }
    Ok(candidates)
}

/// Claim the first candidate whose input resolves.
///
/// A candidate whose input references unknown context keys is charged a
/// failure through the regular fail path (retry or terminal) and the next
/// candidate is tried, so one broken run never holds back the agent's
/// work in other runs.
pub(crate) fn claim(journal: &mut Journal<'_>, agent_id: &str) -> Result<ClaimAttempt, RelayError> {
    let conn = journal.conn();
    let mut unresolved: Option<Vec<String>> = None;

    for Candidate { mut step, story } in claimable_candidates(conn, agent_id)? {
        let run = fetch_run(conn, &step.run_id)?
            .ok_or_else(|| RelayError::Internal(format!("step {} has no run", step.id)))?;

        let context = match &story {
            Some(story) => story_context(conn, &run, story)?,
            None => run.context.clone(),
        };
        let input = match interpolate(&step.input_template, &context) {
            Ok(input) => input,
            Err(RelayError::MissingContextKeys(keys)) => {
                reject_unresolved(journal, &run, &step, story.as_ref(), &keys)?;
                unresolved.get_or_insert(keys);
                continue;
            }
            Err(other) => return Err(other),
        };

        let mut story = story;
        match story.as_mut() {
            None => {
                if !set_step_status(conn, &step.id, &[StepStatus::Pending], StepStatus::Claimed)? {
                    continue;
                }
                journal.record(
                    &run.id,
                    Some(&step.id),
                    None,
                    EventKind::StepClaimed,
                    serde_json::json!({ "stepId": step.step_id, "agentId": agent_id }),
                )?;
            }
            Some(story) => {
                if !start_story(journal, &step, story)? {
                    continue;
                }
                story.status = StoryStatus::InProgress;
            }
        }
        step.status = StepStatus::Claimed;

        tracing::info!(
            "[Engine] {} claimed step {} of run #{}{}",
            agent_id,
            step.step_id,
            run.run_number,
            story
                .as_ref()
                .map(|s| format!(" (story {})", s.story_id))
                .unwrap_or_default()
        );

        return Ok(ClaimAttempt::Done(ClaimOutcome::Claimed(Box::new(ClaimedWork {
            run_id: run.id,
            run_number: run.run_number,
            workflow_id: run.workflow_id,
            step,
            story,
            input,
        }))));
    }

    Ok(match unresolved {
        Some(keys) => ClaimAttempt::Unresolved(keys),
        None => ClaimAttempt::Done(ClaimOutcome::NoWork),
    })
}

/// Journal the unresolved input and charge it to the step (or story) as a
/// failure, without it ever having been claimed.
fn reject_unresolved(
    journal: &mut Journal<'_>,
    run: &Run,
    step: &Step,
    story: Option<&Story>,
    keys: &[String],
) -> Result<(), RelayError> {
    journal.record(
        &run.id,
        Some(&step.id),
        story.map(|s| s.id.as_str()),
        EventKind::StepInputUnresolved,
        serde_json::json!({ "stepId": step.step_id, "missing": keys }),
    )?;
    tracing::warn!(
        "[Engine] step {} of run {} references unknown context keys: {}",
        step.step_id,
        run.id,
        keys.join(", ")
    );

    let reason = format!("unresolved placeholders in step input: {}", keys.join(", "));
    match story {
        Some(story) => fail_story(journal, run, step, story, StoryStatus::Pending, &reason)?,
        None => fail_single(journal, run, step, StepStatus::Pending, &reason)?,
    };
    Ok(())
}

/// Load a step with its run, or explain why it can no longer be reported on.
enum Target {
    Live(Run, Step),
    AlreadyHandled,
    RunInactive(RunStatus),
}

fn load_target(conn: &Connection, step_id: &str) -> Result<Target, RelayError> {
    let step = fetch_step(conn, step_id)?
        .ok_or_else(|| RelayError::NotFound(format!("step {}", step_id)))?;
    let run = fetch_run(conn, &step.run_id)?
        .ok_or_else(|| RelayError::Internal(format!("step {} has no run", step.id)))?;
    if step.status != StepStatus::Claimed {
        return Ok(Target::AlreadyHandled);
    }
    if run.status != RunStatus::Running {
        return Ok(Target::RunInactive(run.status));
    }
    Ok(Target::Live(run, step))
}

fn load_story_target(
    conn: &Connection,
    story_id: &str,
) -> Result<Result<(Run, Step, Story), Target>, RelayError> {
    let story = fetch_story(conn, story_id)?
        .ok_or_else(|| RelayError::NotFound(format!("story {}", story_id)))?;
    let run = fetch_run(conn, &story.run_id)?
        .ok_or_else(|| RelayError::Internal(format!("story {} has no run", story.id)))?;
    if story.status != StoryStatus::InProgress {
        return Ok(Err(Target::AlreadyHandled));
    }
    if run.status != RunStatus::Running {
        return Ok(Err(Target::RunInactive(run.status)));
    }
    let step = loop_step_of(conn, &run.id)?
        .ok_or_else(|| RelayError::Internal(format!("run {} has stories but no loop step", run.id)))?;
    Ok(Ok((run, step, story)))
}

pub(crate) fn complete(
    journal: &mut Journal<'_>,
    step_id: &str,
    output: &str,
) -> Result<CompleteOutcome, RelayError> {
    let conn = journal.conn();
    let (run, step) = match load_target(conn, step_id)? {
        Target::Live(run, step) => (run, step),
        Target::AlreadyHandled => return Ok(CompleteOutcome::AlreadyHandled),
        Target::RunInactive(status) => return Ok(CompleteOutcome::RunInactive { status }),
    };

    if step.is_loop() {
        return match sole_story_in_progress(conn, &step)? {
            Some(story) => complete_story(journal, &run, &step, &story, output),
            None => Ok(CompleteOutcome::AlreadyHandled),
        };
    }
    complete_single(journal, &run, &step, output)
}

pub(crate) fn complete_by_story(
    journal: &mut Journal<'_>,
    story_id: &str,
    output: &str,
) -> Result<CompleteOutcome, RelayError> {
    match load_story_target(journal.conn(), story_id)? {
        Ok((run, step, story)) => complete_story(journal, &run, &step, &story, output),
        Err(Target::RunInactive(status)) => Ok(CompleteOutcome::RunInactive { status }),
        Err(_) => Ok(CompleteOutcome::AlreadyHandled),
    }
}

fn complete_single(
    journal: &mut Journal<'_>,
    run: &Run,
    step: &Step,
    output: &str,
) -> Result<CompleteOutcome, RelayError> {
    let conn = journal.conn();
    let parsed = parse_output(output);

    let missing = missing_keys(&parsed, &step.expects);
    if !missing.is_empty() {
        let reason = format!("missing required output keys: {}", missing.join(", "));
        let failure = fail_single(journal, run, step, StepStatus::Claimed, &reason)?;
        return Ok(CompleteOutcome::Rejected { reason, failure });
    }

    let seeds = match parsed.get(STORIES_KEY) {
        Some(raw) if count_stories(conn, &run.id, None)? == 0 => match parse_story_seeds(raw) {
            Ok(seeds) => Some(seeds),
            Err(reason) => {
                let failure = fail_single(journal, run, step, StepStatus::Claimed, &reason)?;
                return Ok(CompleteOutcome::Rejected { reason, failure });
            }
        },
        Some(_) => {
            tracing::debug!(
                "[Engine] run {} already has stories; ignoring {} from step {}",
                run.id,
                STORIES_KEY,
                step.step_id
            );
            None
        }
        None => None,
    };

    let changed = conn.execute(
        "UPDATE steps SET status = 'done', output = ?1, updated_at = ?2
         WHERE id = ?3 AND status = 'claimed'",
        rusqlite::params![output, now_ms(), step.id],
    )?;
    if changed == 0 {
        return Ok(CompleteOutcome::AlreadyHandled);
    }

    if let Some(seeds) = seeds {
        let ceiling = loop_step_of(conn, &run.id)?
            .map(|loop_step| {
                loop_step
                    .loop_settings()
                    .story_max_retries
                    .unwrap_or(loop_step.max_retries)
            })
            .unwrap_or(FALLBACK_STORY_MAX_RETRIES);
        insert_stories(journal, &run.id, &seeds, ceiling)?;
    }

    let mut context = run.context.clone();
    context.merge(&parsed);
    write_context(conn, &run.id, &context)?;

    journal.record(
        &run.id,
        Some(&step.id),
        None,
        EventKind::StepDone,
        serde_json::json!({
            "stepId": step.step_id,
            "keys": parsed.keys().collect::<Vec<_>>(),
        }),
    )?;
    tracing::info!("[Engine] step {} of run #{} done", step.step_id, run.run_number);

    let advance = advance_from(journal, run, step)?;
    Ok(CompleteOutcome::StepDone { advance })
}

pub(crate) fn fail(
    journal: &mut Journal<'_>,
    step_id: &str,
    error: &str,
) -> Result<FailOutcome, RelayError> {
    let conn = journal.conn();
    let (run, step) = match load_target(conn, step_id)? {
        Target::Live(run, step) => (run, step),
        Target::AlreadyHandled => return Ok(FailOutcome::AlreadyHandled),
        Target::RunInactive(status) => return Ok(FailOutcome::RunInactive { status }),
    };

    if step.is_loop() {
        return match sole_story_in_progress(conn, &step)? {
            Some(story) => {
                fail_story(journal, &run, &step, &story, StoryStatus::InProgress, error)
            }
            None => Ok(FailOutcome::AlreadyHandled),
        };
    }
    fail_single(journal, &run, &step, StepStatus::Claimed, error)
}

pub(crate) fn fail_by_story(
    journal: &mut Journal<'_>,
    story_id: &str,
    error: &str,
) -> Result<FailOutcome, RelayError> {
    match load_story_target(journal.conn(), story_id)? {
        Ok((run, step, story)) => {
            fail_story(journal, &run, &step, &story, StoryStatus::InProgress, error)
        }
        Err(Target::RunInactive(status)) => Ok(FailOutcome::RunInactive { status }),
        Err(_) => Ok(FailOutcome::AlreadyHandled),
    }
}

/// Charge one failure to a single step that is currently in `from`.
fn fail_single(
    journal: &mut Journal<'_>,
    run: &Run,
    step: &Step,
    from: StepStatus,
    error: &str,
) -> Result<FailOutcome, RelayError> {
    let conn = journal.conn();
    let retry_count = step.retry_count + 1;

    if retry_count <= step.max_retries {
        let changed = conn.execute(
            "UPDATE steps SET status = 'pending', retry_count = ?1, last_error = ?2, updated_at = ?3
             WHERE id = ?4 AND status = ?5",
            rusqlite::params![retry_count, error, now_ms(), step.id, from.as_str()],
        )?;
        if changed == 0 {
            return Ok(FailOutcome::AlreadyHandled);
        }
        journal.record(
            &run.id,
            Some(&step.id),
            None,
            EventKind::StepRetry,
            serde_json::json!({
                "stepId": step.step_id,
                "retryCount": retry_count,
                "maxRetries": step.max_retries,
                "error": error,
            }),
        )?;
        tracing::warn!(
            "[Engine] step {} of run #{} failed (attempt {}/{}), retrying: {}",
            step.step_id,
            run.run_number,
            retry_count,
            step.max_retries + 1,
            error
        );
        return Ok(FailOutcome::Retrying {
            retry_count,
            max_retries: step.max_retries,
        });
    }

    let changed = conn.execute(
        "UPDATE steps SET status = 'failed', retry_count = ?1, last_error = ?2, updated_at = ?3
         WHERE id = ?4 AND status = ?5",
        rusqlite::params![retry_count, error, now_ms(), step.id, from.as_str()],
    )?;
    if changed == 0 {
        return Ok(FailOutcome::AlreadyHandled);
    }
    journal.record(
        &run.id,
        Some(&step.id),
        None,
        EventKind::StepFailed,
        serde_json::json!({
            "stepId": step.step_id,
            "retryCount": retry_count,
            "error": error,
        }),
    )?;
    fail_run(
        journal,
        run,
        &format!("step {} failed: {}", step.step_id, error),
    )?;
    Ok(FailOutcome::StepFailed)
}
