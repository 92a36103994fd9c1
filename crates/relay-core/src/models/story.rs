use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StoryStatus {
    Pending,
    InProgress,
    Done,
    Failed,
    Skipped,
}

impl StoryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "in_progress" => Some(Self::InProgress),
            "done" => Some(Self::Done),
            "failed" => Some(Self::Failed),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Skipped)
    }
}

impl std::fmt::Display for StoryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One backlog item processed by a loop step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Story {
    pub id: String,
    pub run_id: String,
    pub story_index: u32,
    pub story_id: String,
    pub title: String,
    pub description: String,
    pub acceptance_criteria: Vec<String>,
    pub status: StoryStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Story {
    /// Human/agent readable rendering used for the `current_story` variable.
    pub fn render(&self) -> String {
        let mut out = format!("{}: {}", self.story_id, self.title);
        if !self.description.is_empty() {
            out.push_str("\n\n");
            out.push_str(&self.description);
        }
        if !self.acceptance_criteria.is_empty() {
            out.push_str("\n\nAcceptance criteria:");
            for criterion in &self.acceptance_criteria {
                out.push_str("\n- ");
                out.push_str(criterion);
            }
        }
        out
    }
}

/// A backlog entry supplied at run creation or produced by a planning step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StorySeed {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, alias = "acceptance_criteria")]
    pub acceptance_criteria: Vec<String>,
    /// Per-story override of the run-wide retry ceiling.
    #[serde(default, alias = "max_retries", skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
}

impl StorySeed {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            acceptance_criteria: Vec::new(),
            max_retries: None,
        }
    }
}

/// Check a backlog for empty ids/titles and duplicate ids.
pub fn validate_backlog(seeds: &[StorySeed]) -> Result<(), String> {
    if seeds.is_empty() {
        return Err("story backlog is empty".to_string());
    }
    let mut seen = std::collections::HashSet::new();
    for (i, seed) in seeds.iter().enumerate() {
        if seed.id.trim().is_empty() {
            return Err(format!("story #{} has an empty id", i + 1));
        }
        if seed.title.trim().is_empty() {
            return Err(format!("story '{}' has an empty title", seed.id));
        }
        if !seen.insert(seed.id.as_str()) {
            return Err(format!("duplicate story id '{}'", seed.id));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(StoryStatus::Done.is_terminal());
        assert!(StoryStatus::Failed.is_terminal());
        assert!(StoryStatus::Skipped.is_terminal());
        assert!(!StoryStatus::Pending.is_terminal());
        assert!(!StoryStatus::InProgress.is_terminal());
        assert_eq!(StoryStatus::from_str("in_progress"), Some(StoryStatus::InProgress));
    }

    #[test]
    fn test_seed_accepts_both_casings() {
        let seeds: Vec<StorySeed> = serde_json::from_str(
            r#"[
                {"id": "S-1", "title": "Login", "acceptanceCriteria": ["works"]},
                {"id": "S-2", "title": "Logout", "acceptance_criteria": ["also works"], "maxRetries": 5}
            ]"#,
        )
        .unwrap();
        assert_eq!(seeds[0].acceptance_criteria, vec!["works"]);
        assert_eq!(seeds[1].acceptance_criteria, vec!["also works"]);
        assert_eq!(seeds[1].max_retries, Some(5));
    }

    #[test]
    fn test_validate_backlog() {
        assert!(validate_backlog(&[]).is_err());
        assert!(validate_backlog(&[StorySeed::new("", "t")]).is_err());
        assert!(validate_backlog(&[StorySeed::new("a", " ")]).is_err());
        let dup = [StorySeed::new("a", "one"), StorySeed::new("a", "two")];
        assert_eq!(validate_backlog(&dup).unwrap_err(), "duplicate story id 'a'");
        assert!(validate_backlog(&[StorySeed::new("a", "one"), StorySeed::new("b", "two")]).is_ok());
    }

    #[test]
    fn test_render_includes_criteria() {
        let now = Utc::now();
        let story = Story {
            id: "x".into(),
            run_id: "r".into(),
            story_index: 0,
            story_id: "S-1".into(),
            title: "Login".into(),
            description: "Add a login form".into(),
            acceptance_criteria: vec!["form renders".into(), "bad password rejected".into()],
            status: StoryStatus::Pending,
            output: None,
            last_error: None,
            retry_count: 0,
            max_retries: 2,
            created_at: now,
            updated_at: now,
        };
        assert_eq!(
            story.render(),
            "S-1: Login\n\nAdd a login form\n\nAcceptance criteria:\n- form renders\n- bad password rejected"
        );
    }
}
