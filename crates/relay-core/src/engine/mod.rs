//! Run Engine — the state machine behind every run.
//!
//! ```text
//! create_run ─► run: running|paused ─► step[0] pending
//!                                           │ claim (agent)
//!                                           ▼
//!                                        claimed ── fail ──► pending (retry) / failed ─► run failed
//!                                           │ complete
//!                                           ▼
//!                                         done ─► step[n+1] pending ... ─► run done
//! ```
//!
//! Every operation runs inside one `BEGIN IMMEDIATE` transaction and guards
//! each status change with the status it expects to move from. A poller that
//! loses a race gets a benign outcome (`NoWork`, `AlreadyHandled`) instead of
//! an error. Events written by a transaction are published on the
//! [`EventBus`] only after it committed.

mod control;
mod create;
mod journal;
mod lifecycle;
mod stories;

use std::sync::Arc;

use serde::Serialize;

pub use create::CreateRunInput;
pub use journal::Advance;

use crate::db::Database;
use crate::error::RelayError;
use crate::events::EventBus;
use crate::models::run::{Run, RunStatus};
use crate::models::step::Step;
use crate::models::story::Story;
use crate::trigger::PollingTrigger;
use crate::workflow::registry::WorkflowRegistry;
use crate::workflow::schema::WorkflowDefinition;
use journal::Journal;
use lifecycle::ClaimAttempt;

/// Work handed to a worker by [`Engine::claim`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimedWork {
    pub run_id: String,
    pub run_number: i64,
    pub workflow_id: String,
    /// The claimed step; report back with `step.id`.
    pub step: Step,
    /// The story being worked on when `step` is a loop step.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub story: Option<Story>,
    /// Fully resolved input text.
    pub input: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ClaimOutcome {
    Claimed(Box<ClaimedWork>),
    NoWork,
}

/// State of a loop step after one of its stories settled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LoopState {
    /// Stories remain pending or in progress.
    Continuing,
    /// Every story is terminal; the loop step is done.
    Finished(Advance),
    /// A story failed under the `abort` policy; the run failed.
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CompleteOutcome {
    StepDone { advance: Advance },
    StoryDone { story_id: String, loop_state: LoopState },
    /// The output was unusable and was treated as a failure.
    Rejected { reason: String, failure: FailOutcome },
    /// The step (or story) was not claimed; nothing changed.
    AlreadyHandled,
    /// The run is no longer running; nothing changed.
    RunInactive { status: RunStatus },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FailOutcome {
    Retrying { retry_count: u32, max_retries: u32 },
    /// Retries exhausted; the step and its run failed.
    StepFailed,
    StoryRetrying {
        story_id: String,
        retry_count: u32,
        max_retries: u32,
    },
    StoryFailed { story_id: String, loop_state: LoopState },
    AlreadyHandled,
    RunInactive { status: RunStatus },
}

/// Drives runs through their workflow.
#[derive(Clone)]
pub struct Engine {
    db: Database,
    registry: Arc<WorkflowRegistry>,
    trigger: Arc<dyn PollingTrigger>,
    events: EventBus,
}

impl Engine {
    pub fn new(
        db: Database,
        registry: Arc<WorkflowRegistry>,
        trigger: Arc<dyn PollingTrigger>,
        events: EventBus,
    ) -> Self {
        Self {
            db,
            registry,
            trigger,
            events,
        }
    }

    pub fn registry(&self) -> &WorkflowRegistry {
        &self.registry
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Run `f` in one immediate transaction and publish its events after commit.
    async fn transact<F, T>(&self, f: F) -> Result<T, RelayError>
    where
        F: FnOnce(&mut Journal<'_>) -> Result<T, RelayError> + Send + 'static,
        T: Send + 'static,
    {
        let (value, events) = self
            .db
            .with_tx_async(move |tx| {
                let mut journal = Journal::new(tx);
                let value = f(&mut journal)?;
                Ok((value, journal.into_events()))
            })
            .await?;
        self.events.publish(&events).await;
        Ok(value)
    }

    /// Create a run of a registered workflow and make sure its agents get polled.
    ///
    /// If polling cannot be ensured for some agent the run is marked failed
    /// before the error is returned, so it never sits unworked.
    pub async fn create_run(&self, input: CreateRunInput) -> Result<Run, RelayError> {
        let workflow = self.registry.get(&input.workflow_id)?.clone();
        let definition = workflow.clone();
        let run = self
            .transact(move |journal| create::create_run(journal, &definition, input))
            .await?;

        if let Err(reason) = self.ensure_polling(&workflow).await {
            let run_id = run.id.clone();
            let detail = reason.clone();
            self.transact(move |journal| create::mark_unpolled(journal, &run_id, &detail))
                .await?;
            return Err(RelayError::Trigger(reason));
        }
        Ok(run)
    }

    async fn ensure_polling(&self, workflow: &WorkflowDefinition) -> Result<(), String> {
        for agent in workflow.agents() {
            self.trigger.ensure_polling(&agent, workflow).await.map_err(|e| {
                tracing::error!("[Engine] could not ensure polling for {}: {}", agent, e);
                format!("polling for agent {}: {}", agent, e)
            })?;
        }
        Ok(())
    }

    /// Whether `agent_id` has claimable work right now. A plain read that
    /// never takes the write lock and never changes state.
    ///
    /// A candidate with unresolved input counts: a claim acts on it by
    /// charging it a failure.
    pub async fn peek(&self, agent_id: &str) -> Result<bool, RelayError> {
        let agent_id = agent_id.to_string();
        self.db
            .with_read_async(move |conn| {
                Ok(!lifecycle::claimable_candidates(conn, &agent_id)?.is_empty())
            })
            .await
    }

    /// Claim the lowest-position claimable work for `agent_id`.
    ///
    /// Candidates whose input references context keys their run does not
    /// have are charged a failure (retry, or terminal for their own run)
    /// and skipped. If nothing could be handed out and some candidate was
    /// unresolved, `MissingContextKeys` is returned after those failures
    /// are committed.
    pub async fn claim(&self, agent_id: &str) -> Result<ClaimOutcome, RelayError> {
        let agent_id = agent_id.to_string();
        match self
            .transact(move |journal| lifecycle::claim(journal, &agent_id))
            .await?
        {
            ClaimAttempt::Done(outcome) => Ok(outcome),
            ClaimAttempt::Unresolved(keys) => Err(RelayError::MissingContextKeys(keys)),
        }
    }

    /// Report a claimed step's output. For a loop step this completes its
    /// only in-progress story.
    pub async fn complete(&self, step_id: &str, output: &str) -> Result<CompleteOutcome, RelayError> {
        let step_id = step_id.to_string();
        let output = output.to_string();
        self.transact(move |journal| lifecycle::complete(journal, &step_id, &output))
            .await
    }

    /// Report the output of one in-progress story.
    pub async fn complete_story(
        &self,
        story_id: &str,
        output: &str,
    ) -> Result<CompleteOutcome, RelayError> {
        let story_id = story_id.to_string();
        let output = output.to_string();
        self.transact(move |journal| lifecycle::complete_by_story(journal, &story_id, &output))
            .await
    }

    pub async fn fail(&self, step_id: &str, error: &str) -> Result<FailOutcome, RelayError> {
        let step_id = step_id.to_string();
        let error = error.to_string();
        self.transact(move |journal| lifecycle::fail(journal, &step_id, &error))
            .await
    }

    pub async fn fail_story(&self, story_id: &str, error: &str) -> Result<FailOutcome, RelayError> {
        let story_id = story_id.to_string();
        let error = error.to_string();
        self.transact(move |journal| lifecycle::fail_by_story(journal, &story_id, &error))
            .await
    }

    /// Resume a failed run from its failed step, then re-ensure polling.
    pub async fn resume(&self, run_id: &str) -> Result<Run, RelayError> {
        let id = run_id.to_string();
        let run = self
            .transact(move |journal| control::resume(journal, &id))
            .await?;

        match self.registry.get(&run.workflow_id) {
            Ok(workflow) => {
                let workflow = workflow.clone();
                if let Err(reason) = self.ensure_polling(&workflow).await {
                    let run_id = run.id.clone();
                    let detail = reason.clone();
                    self.transact(move |journal| create::mark_unpolled(journal, &run_id, &detail))
                        .await?;
                    return Err(RelayError::Trigger(reason));
                }
            }
            Err(_) => tracing::warn!(
                "[Engine] workflow {} is not loaded; resuming run {} without ensuring polling",
                run.workflow_id,
                run.id
            ),
        }
        Ok(run)
    }

    pub async fn approve(&self, run_id: &str) -> Result<Run, RelayError> {
        let run_id = run_id.to_string();
        self.transact(move |journal| control::approve(journal, &run_id))
            .await
    }

    pub async fn cancel(&self, run_id: &str) -> Result<Run, RelayError> {
        let run_id = run_id.to_string();
        self.transact(move |journal| control::cancel(journal, &run_id))
            .await
    }

    /// Drop a pending story. Returns the loop state when the skip settled
    /// an active loop step.
    pub async fn skip_story(&self, story_id: &str) -> Result<Option<LoopState>, RelayError> {
        let story_id = story_id.to_string();
        self.transact(move |journal| control::skip_story(journal, &story_id))
            .await
    }
}
