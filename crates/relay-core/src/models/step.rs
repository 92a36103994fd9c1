use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Waiting,
    Pending,
    Claimed,
    Done,
    Failed,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Pending => "pending",
            Self::Claimed => "claimed",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "waiting" => Some(Self::Waiting),
            "pending" => Some(Self::Pending),
            "claimed" => Some(Self::Claimed),
            "done" => Some(Self::Done),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StepType {
    #[default]
    Single,
    Loop,
}

impl StepType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Single => "single",
            Self::Loop => "loop",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "single" => Some(Self::Single),
            "loop" => Some(Self::Loop),
            _ => None,
        }
    }
}

/// What a loop step iterates over.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LoopOver {
    #[default]
    Stories,
}

/// What happens to a loop step when one of its stories exhausts its retries.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StoryFailurePolicy {
    /// The failed story is terminal; the loop keeps going and finishes `done`.
    #[default]
    Tolerate,
    /// The first exhausted story fails the step and the run immediately.
    Abort,
}

/// Loop configuration attached to a `loop` step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct LoopConfig {
    #[serde(default)]
    pub over: LoopOver,

    #[serde(default)]
    pub on_story_failure: StoryFailurePolicy,

    /// Retry ceiling applied to every story of the run unless a story
    /// carries its own override. Falls back to the step's `max_retries`.
    #[serde(default)]
    pub story_max_retries: Option<u32>,

    /// How many stories may be in progress at once.
    #[serde(default = "default_concurrency")]
    pub concurrency: u32,
}

fn default_concurrency() -> u32 {
    1
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            over: LoopOver::Stories,
            on_story_failure: StoryFailurePolicy::Tolerate,
            story_max_retries: None,
            concurrency: default_concurrency(),
        }
    }
}

/// One pipeline stage within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub id: String,
    pub run_id: String,
    pub step_id: String,
    pub agent_id: String,
    pub step_index: u32,
    pub input_template: String,
    pub expects: Vec<String>,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub step_type: StepType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loop_config: Option<LoopConfig>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Step {
    pub fn is_loop(&self) -> bool {
        self.step_type == StepType::Loop
    }

    /// Loop settings, defaulted when a loop step was stored without any.
    pub fn loop_settings(&self) -> LoopConfig {
        self.loop_config.clone().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_status_round_trip() {
        for status in [
            StepStatus::Waiting,
            StepStatus::Pending,
            StepStatus::Claimed,
            StepStatus::Done,
            StepStatus::Failed,
        ] {
            assert_eq!(StepStatus::from_str(status.as_str()), Some(status));
        }
    }

    #[test]
    fn test_loop_config_defaults() {
        let cfg: LoopConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg, LoopConfig::default());
        assert_eq!(cfg.concurrency, 1);

        let cfg: LoopConfig =
            serde_json::from_str(r#"{"on_story_failure": "abort", "story_max_retries": 4}"#).unwrap();
        assert_eq!(cfg.on_story_failure, StoryFailurePolicy::Abort);
        assert_eq!(cfg.story_max_retries, Some(4));
    }
}
