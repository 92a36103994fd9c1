//! `relay run` — start, inspect and steer runs.

use relay_core::models::{RunStatus, StorySeed};
use relay_core::state::AppState;
use relay_core::CreateRunInput;

use super::{err_string, to_value};

/// Options for `relay run start`.
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    pub repo: Option<String>,
    pub stories_file: Option<String>,
    pub require_approval: bool,
    pub notify_url: Option<String>,
    /// `key=value` context overrides.
    pub set: Vec<String>,
}

fn read_stories(path: &str) -> Result<Vec<StorySeed>, String> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| format!("Failed to read stories file '{}': {}", path, e))?;
    serde_json::from_str(&raw).map_err(|e| format!("Invalid stories file '{}': {}", path, e))
}

pub async fn start(
    state: &AppState,
    workflow_id: &str,
    task: &str,
    options: StartOptions,
) -> Result<serde_json::Value, String> {
    let mut input = CreateRunInput::new(workflow_id, task);
    for pair in &options.set {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| format!("Expected key=value, got '{}'", pair))?;
        if key.trim().is_empty() {
            return Err(format!("Empty context key in '{}'", pair));
        }
        input = input.with_context(key.trim(), value);
    }
    if let Some(repo) = options.repo {
        input = input.with_repo(repo);
    }
    if let Some(path) = &options.stories_file {
        input = input.with_stories(read_stories(path)?);
    }
    if options.require_approval {
        input = input.with_approval();
    }
    if let Some(url) = options.notify_url {
        input = input.with_notify_url(url);
    }

    let run = state.engine.create_run(input).await.map_err(err_string)?;
    to_value(&run)
}

pub async fn list(state: &AppState, status: Option<&str>) -> Result<serde_json::Value, String> {
    let runs = match status {
        Some(raw) => {
            let status = RunStatus::from_str(raw).ok_or_else(|| {
                format!(
                    "Unknown run status '{}' (expected running, paused, done, failed or cancelled)",
                    raw
                )
            })?;
            state.run_store.list_by_status(status).await
        }
        None => state.run_store.list().await,
    }
    .map_err(err_string)?;
    to_value(&runs)
}

/// A run with its steps and stories.
pub async fn status(state: &AppState, run_ref: &str) -> Result<serde_json::Value, String> {
    let run = state.run_store.find(run_ref).await.map_err(err_string)?;
    let steps = state.step_store.list_by_run(&run.id).await.map_err(err_string)?;
    let stories = state.story_store.list_by_run(&run.id).await.map_err(err_string)?;
    Ok(serde_json::json!({
        "run": to_value(&run)?,
        "steps": to_value(&steps)?,
        "stories": to_value(&stories)?,
    }))
}

pub async fn approve(state: &AppState, run_ref: &str) -> Result<serde_json::Value, String> {
    let run = state.run_store.find(run_ref).await.map_err(err_string)?;
    let run = state.engine.approve(&run.id).await.map_err(err_string)?;
    to_value(&run)
}

pub async fn resume(state: &AppState, run_ref: &str) -> Result<serde_json::Value, String> {
    let run = state.run_store.find(run_ref).await.map_err(err_string)?;
    let run = state.engine.resume(&run.id).await.map_err(err_string)?;
    to_value(&run)
}

pub async fn stop(state: &AppState, run_ref: &str) -> Result<serde_json::Value, String> {
    let run = state.run_store.find(run_ref).await.map_err(err_string)?;
    let run = state.engine.cancel(&run.id).await.map_err(err_string)?;
    to_value(&run)
}

/// Claimed steps of running runs untouched for `minutes`, for a watchdog.
pub async fn stale(state: &AppState, minutes: i64) -> Result<serde_json::Value, String> {
    let steps = state
        .step_store
        .list_stale_claims(chrono::Duration::minutes(minutes))
        .await
        .map_err(err_string)?;
    to_value(&steps)
}
