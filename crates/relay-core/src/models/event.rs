use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kinds of transitions recorded in the append-only event log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "run.created")]
    RunCreated,
    #[serde(rename = "run.started")]
    RunStarted,
    #[serde(rename = "run.paused")]
    RunPaused,
    #[serde(rename = "run.approved")]
    RunApproved,
    #[serde(rename = "run.done")]
    RunDone,
    #[serde(rename = "run.failed")]
    RunFailed,
    #[serde(rename = "run.resumed")]
    RunResumed,
    #[serde(rename = "run.cancelled")]
    RunCancelled,
    #[serde(rename = "step.pending")]
    StepPending,
    #[serde(rename = "step.claimed")]
    StepClaimed,
    #[serde(rename = "step.done")]
    StepDone,
    #[serde(rename = "step.retry")]
    StepRetry,
    #[serde(rename = "step.failed")]
    StepFailed,
    #[serde(rename = "step.input_unresolved")]
    StepInputUnresolved,
    #[serde(rename = "story.seeded")]
    StorySeeded,
    #[serde(rename = "story.started")]
    StoryStarted,
    #[serde(rename = "story.done")]
    StoryDone,
    #[serde(rename = "story.retry")]
    StoryRetry,
    #[serde(rename = "story.failed")]
    StoryFailed,
    #[serde(rename = "story.skipped")]
    StorySkipped,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RunCreated => "run.created",
            Self::RunStarted => "run.started",
            Self::RunPaused => "run.paused",
            Self::RunApproved => "run.approved",
            Self::RunDone => "run.done",
            Self::RunFailed => "run.failed",
            Self::RunResumed => "run.resumed",
            Self::RunCancelled => "run.cancelled",
            Self::StepPending => "step.pending",
            Self::StepClaimed => "step.claimed",
            Self::StepDone => "step.done",
            Self::StepRetry => "step.retry",
            Self::StepFailed => "step.failed",
            Self::StepInputUnresolved => "step.input_unresolved",
            Self::StorySeeded => "story.seeded",
            Self::StoryStarted => "story.started",
            Self::StoryDone => "story.done",
            Self::StoryRetry => "story.retry",
            Self::StoryFailed => "story.failed",
            Self::StorySkipped => "story.skipped",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "run.created" => Some(Self::RunCreated),
            "run.started" => Some(Self::RunStarted),
            "run.paused" => Some(Self::RunPaused),
            "run.approved" => Some(Self::RunApproved),
            "run.done" => Some(Self::RunDone),
            "run.failed" => Some(Self::RunFailed),
            "run.resumed" => Some(Self::RunResumed),
            "run.cancelled" => Some(Self::RunCancelled),
            "step.pending" => Some(Self::StepPending),
            "step.claimed" => Some(Self::StepClaimed),
            "step.done" => Some(Self::StepDone),
            "step.retry" => Some(Self::StepRetry),
            "step.failed" => Some(Self::StepFailed),
            "step.input_unresolved" => Some(Self::StepInputUnresolved),
            "story.seeded" => Some(Self::StorySeeded),
            "story.started" => Some(Self::StoryStarted),
            "story.done" => Some(Self::StoryDone),
            "story.retry" => Some(Self::StoryRetry),
            "story.failed" => Some(Self::StoryFailed),
            "story.skipped" => Some(Self::StorySkipped),
            _ => None,
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An immutable record of a significant transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunEvent {
    pub id: i64,
    pub run_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub story_id: Option<String>,
    pub kind: EventKind,
    pub detail: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_string_matches_serde() {
        for kind in [EventKind::RunDone, EventKind::StoryStarted, EventKind::StepInputUnresolved] {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
            assert_eq!(EventKind::from_str(kind.as_str()), Some(kind));
        }
    }
}
