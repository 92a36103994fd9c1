//! Run creation: materialize a workflow into rows.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::journal::{activate_step, fail_run, now_ms, Journal};
use super::stories::insert_stories;
use crate::error::RelayError;
use crate::models::event::EventKind;
use crate::models::run::{Run, RunContext, RunStatus};
use crate::models::step::StepType;
use crate::models::story::{validate_backlog, StorySeed};
use crate::store::run_store::fetch_run;
use crate::store::step_store::step_at;
use crate::workflow::schema::{StepDefinition, WorkflowDefinition};

/// Everything needed to start a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRunInput {
    pub workflow_id: String,
    pub task: String,
    /// Extra context entries; they override the workflow defaults.
    #[serde(default)]
    pub context: RunContext,
    #[serde(default)]
    pub repo: Option<String>,
    /// Backlog supplied up front. Steps marked `skip_when_stories_supplied`
    /// are dropped when this is present.
    #[serde(default)]
    pub stories: Option<Vec<StorySeed>>,
    /// Hold a run with a supplied backlog in `paused` until approved.
    #[serde(default)]
    pub require_approval: bool,
    #[serde(default)]
    pub notify_url: Option<String>,
}

impl CreateRunInput {
    pub fn new(workflow_id: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            task: task.into(),
            ..Default::default()
        }
    }

    pub fn with_context(mut self, key: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.context.insert(key, value);
        self
    }

    pub fn with_repo(mut self, repo: impl Into<String>) -> Self {
        self.repo = Some(repo.into());
        self
    }

    pub fn with_stories(mut self, stories: Vec<StorySeed>) -> Self {
        self.stories = Some(stories);
        self
    }

    pub fn with_approval(mut self) -> Self {
        self.require_approval = true;
        self
    }

    pub fn with_notify_url(mut self, url: impl Into<String>) -> Self {
        self.notify_url = Some(url.into());
        self
    }
}

pub(crate) fn create_run(
    journal: &mut Journal<'_>,
    workflow: &WorkflowDefinition,
    input: CreateRunInput,
) -> Result<Run, RelayError> {
    if input.task.trim().is_empty() {
        return Err(RelayError::Validation("task description is empty".to_string()));
    }
    if let Some(seeds) = &input.stories {
        validate_backlog(seeds).map_err(RelayError::Validation)?;
    }
    let stories_supplied = input.stories.is_some();

    let steps: Vec<&StepDefinition> = workflow
        .steps
        .iter()
        .filter(|step| !(stories_supplied && step.skip_when_stories_supplied))
        .collect();
    if steps.is_empty() {
        return Err(RelayError::Validation(format!(
            "workflow '{}' has no steps left once supplied stories skip the planners",
            workflow.id
        )));
    }

    let status = if input.require_approval && stories_supplied {
        RunStatus::Paused
    } else {
        RunStatus::Running
    };

    let conn = journal.conn();
    let run_id = Uuid::new_v4().to_string();
    let now = now_ms();

    let mut context = workflow.default_context();
    context.merge(&input.context);
    if let Some(repo) = &input.repo {
        context.insert("repo", repo.as_str());
    }
    context.insert("task", input.task.as_str());
    context.insert("run_id", run_id.as_str());

    let run_number: i64 = conn.query_row(
        "SELECT COALESCE(MAX(run_number), 0) + 1 FROM runs",
        [],
        |row| row.get(0),
    )?;

    conn.execute(
        "INSERT INTO runs (id, run_number, workflow_id, task, status, context, notify_url, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        rusqlite::params![
            run_id,
            run_number,
            workflow.id,
            input.task,
            status.as_str(),
            context.to_json(),
            input.notify_url,
            now,
            now,
        ],
    )?;

    for (index, def) in steps.iter().enumerate() {
        let loop_config = match def.step_type {
            StepType::Loop => Some(serde_json::to_string(
                &def.loop_config.clone().unwrap_or_default(),
            )?),
            StepType::Single => None,
        };
        conn.execute(
            "INSERT INTO steps (id, run_id, step_id, agent_id, step_index, input_template, expects,
                                status, retry_count, max_retries, step_type, loop_config, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'waiting', 0, ?8, ?9, ?10, ?11, ?12)",
            rusqlite::params![
                Uuid::new_v4().to_string(),
                run_id,
                def.id,
                def.agent,
                index as u32,
                def.input,
                serde_json::to_string(&def.expects)?,
                def.max_retries,
                def.step_type.as_str(),
                loop_config,
                now,
                now,
            ],
        )?;
    }

    journal.record(
        &run_id,
        None,
        None,
        EventKind::RunCreated,
        serde_json::json!({
            "workflowId": workflow.id,
            "runNumber": run_number,
            "steps": steps.len(),
            "skipped": workflow.steps.len() - steps.len(),
        }),
    )?;

    if let Some(seeds) = &input.stories {
        insert_stories(journal, &run_id, seeds, workflow.story_max_retries())?;
    }

    let run = fetch_run(conn, &run_id)?
        .ok_or_else(|| RelayError::Internal(format!("run {} vanished during creation", run_id)))?;

    if status == RunStatus::Paused {
        journal.record(
            &run_id,
            None,
            None,
            EventKind::RunPaused,
            serde_json::json!({ "reason": "awaiting approval" }),
        )?;
        tracing::info!(
            "[Engine] run {} (#{}) of {} created, awaiting approval",
            run.id,
            run.run_number,
            workflow.id
        );
    } else {
        journal.record(&run_id, None, None, EventKind::RunStarted, serde_json::json!({}))?;
        if let Some(first) = step_at(conn, &run_id, 0)? {
            activate_step(journal, &run, &first)?;
        }
        tracing::info!(
            "[Engine] run {} (#{}) of {} started",
            run.id,
            run.run_number,
            workflow.id
        );
    }

    // Activation may already have finished an empty loop; report what is stored.
    fetch_run(conn, &run_id)?
        .ok_or_else(|| RelayError::Internal(format!("run {} vanished during creation", run_id)))
}

/// A run whose polling could not be ensured never gets worked on.
pub(crate) fn mark_unpolled(
    journal: &mut Journal<'_>,
    run_id: &str,
    reason: &str,
) -> Result<(), RelayError> {
    let run = fetch_run(journal.conn(), run_id)?
        .ok_or_else(|| RelayError::NotFound(format!("run {}", run_id)))?;
    fail_run(journal, &run, reason)?;
    Ok(())
}
