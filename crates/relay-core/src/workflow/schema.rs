//! YAML schema types for workflow definitions.
//!
//! A workflow YAML defines an ordered pipeline of agent steps:
//!
//! ```yaml
//! id: feature-dev
//! name: "Feature development"
//!
//! context:
//!   branch_prefix: "feat/"
//!
//! polling:
//!   interval_minutes: 5
//!
//! steps:
//!   - id: plan
//!     agent: planner
//!     input: "Break {{task}} for {{repo}} into stories"
//!     expects: [STATUS, STORIES_JSON]
//!     skip_when_stories_supplied: true
//!
//!   - id: implement
//!     agent: developer
//!     type: loop
//!     input: "Implement {{current_story}}"
//!     expects: [STATUS]
//!     loop:
//!       over: stories
//!       on_story_failure: tolerate
//!       story_max_retries: 2
//!
//!   - id: review
//!     agent: reviewer
//!     input: "Review the branch for {{task}}"
//!     expects: [STATUS, VERDICT]
//! ```

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::RelayError;
use crate::models::run::RunContext;
use crate::models::step::{LoopConfig, StepType};

/// Top-level workflow definition loaded from a YAML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Workflow identifier used to start runs
    pub id: String,

    /// Optional display name
    #[serde(default)]
    pub name: Option<String>,

    /// Optional description
    #[serde(default)]
    pub description: Option<String>,

    /// Version string
    #[serde(default = "default_version")]
    pub version: String,

    /// Default context values seeded into every run
    #[serde(default)]
    pub context: Map<String, Value>,

    /// Hints handed to the trigger collaborator
    #[serde(default)]
    pub polling: PollingConfig,

    /// Ordered list of workflow steps
    pub steps: Vec<StepDefinition>,
}

fn default_version() -> String {
    "1".to_string()
}

/// Polling hints for the external trigger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    #[serde(default = "default_interval_minutes")]
    pub interval_minutes: u32,
}

fn default_interval_minutes() -> u32 {
    5
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_minutes: default_interval_minutes(),
        }
    }
}

/// A single step in the workflow pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Step id (unique within the workflow)
    pub id: String,

    /// Agent that polls for and executes this step
    pub agent: String,

    /// Input template; `{{key}}` placeholders resolve against the run context
    pub input: String,

    /// Output keys the worker must report (`KEY: value` lines)
    #[serde(default)]
    pub expects: Vec<String>,

    /// Failures tolerated before the step (and the run) fails
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// `single` (default) or `loop`
    #[serde(rename = "type", default)]
    pub step_type: StepType,

    /// Loop settings; required for `loop` steps
    #[serde(rename = "loop", default)]
    pub loop_config: Option<LoopConfig>,

    /// Drop this step when a story backlog is supplied at run creation
    #[serde(default)]
    pub skip_when_stories_supplied: bool,
}

fn default_max_retries() -> u32 {
    2
}

impl WorkflowDefinition {
    /// Parse and validate a workflow definition from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, RelayError> {
        let wf: Self = serde_yaml::from_str(yaml)
            .map_err(|e| RelayError::Validation(format!("Failed to parse workflow YAML: {}", e)))?;
        wf.validate()?;
        Ok(wf)
    }

    /// Load a workflow definition from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, RelayError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            RelayError::Validation(format!(
                "Failed to read workflow file '{}': {}",
                path.display(),
                e
            ))
        })?;
        Self::from_yaml(&content)
    }

    pub fn validate(&self) -> Result<(), RelayError> {
        if self.id.trim().is_empty() {
            return Err(RelayError::Validation("workflow id is empty".to_string()));
        }
        if self.steps.is_empty() {
            return Err(RelayError::Validation(format!(
                "workflow '{}' has no steps",
                self.id
            )));
        }

        let mut seen = HashSet::new();
        let mut loops = 0;
        for step in &self.steps {
            if step.id.trim().is_empty() {
                return Err(RelayError::Validation(format!(
                    "workflow '{}' has a step with an empty id",
                    self.id
                )));
            }
            if !seen.insert(step.id.as_str()) {
                return Err(RelayError::Validation(format!(
                    "workflow '{}' has duplicate step id '{}'",
                    self.id, step.id
                )));
            }
            if step.agent.trim().is_empty() {
                return Err(RelayError::Validation(format!(
                    "step '{}' has no agent",
                    step.id
                )));
            }
            match (step.step_type, &step.loop_config) {
                (StepType::Loop, None) => {
                    return Err(RelayError::Validation(format!(
                        "loop step '{}' is missing its loop config",
                        step.id
                    )))
                }
                (StepType::Loop, Some(cfg)) if cfg.concurrency == 0 => {
                    return Err(RelayError::Validation(format!(
                        "loop step '{}' needs concurrency >= 1",
                        step.id
                    )))
                }
                (StepType::Loop, Some(_)) => loops += 1,
                (StepType::Single, _) => {}
            }
        }
        if loops > 1 {
            return Err(RelayError::Validation(format!(
                "workflow '{}' has {} loop steps; at most one is supported",
                self.id, loops
            )));
        }
        Ok(())
    }

    /// Context defaults as a run context.
    pub fn default_context(&self) -> RunContext {
        RunContext::from_values(&self.context)
    }

    /// Distinct agents referenced by the given steps, in first-use order.
    pub fn agents(&self) -> Vec<String> {
        let mut agents: Vec<String> = Vec::new();
        for step in &self.steps {
            if !agents.contains(&step.agent) {
                agents.push(step.agent.clone());
            }
        }
        agents
    }

    /// The loop step's config, if the workflow has one.
    pub fn loop_step(&self) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.step_type == StepType::Loop)
    }

    /// Retry ceiling applied to stories of runs of this workflow.
    pub fn story_max_retries(&self) -> u32 {
        self.loop_step()
            .map(|step| {
                step.loop_config
                    .as_ref()
                    .and_then(|cfg| cfg.story_max_retries)
                    .unwrap_or(step.max_retries)
            })
            .unwrap_or_else(default_max_retries)
    }
}
