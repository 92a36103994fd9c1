use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Paused,
    Done,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "paused" => Some(Self::Paused),
            "done" => Some(Self::Done),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// `done` and `cancelled` never change again; `failed` only via resume.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Run-scoped key/value state threaded between steps.
///
/// Keys are lowercased on insert; insertion order is kept and a second write
/// of the same key replaces the value in place.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunContext(Map<String, Value>);

impl RunContext {
    pub fn new() -> Self {
        Self(Map::new())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(&key.to_lowercase()).and_then(Value::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(&key.to_lowercase())
    }

    pub fn insert(&mut self, key: impl AsRef<str>, value: impl Into<String>) {
        self.0
            .insert(key.as_ref().to_lowercase(), Value::String(value.into()));
    }

    /// Overwrite-on-conflict merge of another context into this one.
    pub fn merge(&mut self, other: &RunContext) {
        for (key, value) in other.iter() {
            self.insert(key, value);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0
            .iter()
            .filter_map(|(k, v)| v.as_str().map(|v| (k.as_str(), v)))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Build a context from loosely typed values (e.g. YAML defaults).
    /// Non-string scalars are stringified; nulls are dropped.
    pub fn from_values(values: &Map<String, Value>) -> Self {
        let mut ctx = Self::new();
        for (key, value) in values {
            match value {
                Value::Null => {}
                Value::String(s) => ctx.insert(key, s.clone()),
                other => ctx.insert(key, other.to_string()),
            }
        }
        ctx
    }

    pub fn to_json(&self) -> String {
        Value::Object(self.0.clone()).to_string()
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        let values: Map<String, Value> = serde_json::from_str(raw)?;
        Ok(Self::from_values(&values))
    }
}

impl<K: AsRef<str>, V: Into<String>> FromIterator<(K, V)> for RunContext {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut ctx = Self::new();
        for (k, v) in iter {
            ctx.insert(k, v);
        }
        ctx
    }
}

/// One pipeline execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub id: String,
    pub run_number: i64,
    pub workflow_id: String,
    pub task: String,
    pub status: RunStatus,
    pub context: RunContext,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notify_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_status_round_trip() {
        for status in [
            RunStatus::Running,
            RunStatus::Paused,
            RunStatus::Done,
            RunStatus::Failed,
            RunStatus::Cancelled,
        ] {
            assert_eq!(RunStatus::from_str(status.as_str()), Some(status));
        }
        assert_eq!(RunStatus::from_str("bogus"), None);
    }

    #[test]
    fn test_context_overwrites_in_place() {
        let mut ctx = RunContext::new();
        ctx.insert("task", "build it");
        ctx.insert("REPO", "acme/app");
        ctx.insert("Task", "build it twice");

        assert_eq!(ctx.get("task"), Some("build it twice"));
        assert_eq!(ctx.get("repo"), Some("acme/app"));
        assert_eq!(ctx.keys().collect::<Vec<_>>(), vec!["task", "repo"]);
    }

    #[test]
    fn test_context_json_round_trip() {
        let ctx: RunContext = [("b", "2"), ("a", "line one\nline two")].into_iter().collect();
        let restored = RunContext::from_json(&ctx.to_json()).unwrap();
        assert_eq!(restored, ctx);
        assert_eq!(restored.keys().collect::<Vec<_>>(), vec!["b", "a"]);
    }

    #[test]
    fn test_context_from_values_stringifies_scalars() {
        let values: Map<String, Value> =
            serde_json::from_str(r#"{"count": 3, "flag": true, "skip": null, "name": "x"}"#)
                .unwrap();
        let ctx = RunContext::from_values(&values);
        assert_eq!(ctx.get("count"), Some("3"));
        assert_eq!(ctx.get("flag"), Some("true"));
        assert_eq!(ctx.get("name"), Some("x"));
        assert!(!ctx.contains_key("skip"));
    }
}
