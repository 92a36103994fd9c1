//! `relay step` — the worker side: peek, claim, complete, fail.

use std::io::Read;

use relay_core::models::Story;
use relay_core::state::AppState;

use super::{err_string, to_value};

pub async fn peek(state: &AppState, agent_id: &str) -> Result<serde_json::Value, String> {
    let has_work = state.engine.peek(agent_id).await.map_err(err_string)?;
    Ok(serde_json::json!({ "agentId": agent_id, "hasWork": has_work }))
}

pub async fn claim(state: &AppState, agent_id: &str) -> Result<serde_json::Value, String> {
    let outcome = state.engine.claim(agent_id).await.map_err(err_string)?;
    to_value(&outcome)
}

/// Worker output from a file, or stdin when no file is given.
pub fn read_output(file: Option<&str>) -> Result<String, String> {
    match file {
        Some(path) => std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read output file '{}': {}", path, e)),
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .map_err(|e| format!("Failed to read output from stdin: {}", e))?;
            Ok(buf)
        }
    }
}

/// Resolve `--story` as a story row id, or as a story id within the step's run.
async fn resolve_story(state: &AppState, step_id: &str, story_ref: &str) -> Result<Story, String> {
    let step = state
        .step_store
        .get(step_id)
        .await
        .map_err(err_string)?
        .ok_or_else(|| format!("Not found: step {}", step_id))?;
    if let Some(story) = state.story_store.get(story_ref).await.map_err(err_string)? {
        if story.run_id != step.run_id {
            return Err(format!(
                "Story {} belongs to run {}, not to run {} of step {}",
                story.story_id, story.run_id, step.run_id, step_id
            ));
        }
        return Ok(story);
    }
    state
        .story_store
        .get_by_story_id(&step.run_id, story_ref)
        .await
        .map_err(err_string)?
        .ok_or_else(|| format!("Not found: story '{}' in run {}", story_ref, step.run_id))
}

pub async fn complete(
    state: &AppState,
    step_id: &str,
    story: Option<&str>,
    output: &str,
) -> Result<serde_json::Value, String> {
    let outcome = match story {
        Some(story_ref) => {
            let story = resolve_story(state, step_id, story_ref).await?;
            state.engine.complete_story(&story.id, output).await
        }
        None => state.engine.complete(step_id, output).await,
    }
    .map_err(err_string)?;
    to_value(&outcome)
}

pub async fn fail(
    state: &AppState,
    step_id: &str,
    message: &str,
    story: Option<&str>,
) -> Result<serde_json::Value, String> {
    let outcome = match story {
        Some(story_ref) => {
            let story = resolve_story(state, step_id, story_ref).await?;
            state.engine.fail_story(&story.id, message).await
        }
        None => state.engine.fail(step_id, message).await,
    }
    .map_err(err_string)?;
    to_value(&outcome)
}
