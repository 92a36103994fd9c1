//! `relay story` — inspect and prune a run's backlog.

use relay_core::state::AppState;

use super::{err_string, to_value};

pub async fn list(state: &AppState, run_ref: &str) -> Result<serde_json::Value, String> {
    let run = state.run_store.find(run_ref).await.map_err(err_string)?;
    let stories = state.story_store.list_by_run(&run.id).await.map_err(err_string)?;
    to_value(&stories)
}

/// Skip a pending story, addressed by its story id within the run.
pub async fn skip(state: &AppState, run_ref: &str, story_id: &str) -> Result<serde_json::Value, String> {
    let run = state.run_store.find(run_ref).await.map_err(err_string)?;
    let story = state
        .story_store
        .get_by_story_id(&run.id, story_id)
        .await
        .map_err(err_string)?
        .ok_or_else(|| format!("Not found: story '{}' in run {}", story_id, run.id))?;
    let loop_state = state.engine.skip_story(&story.id).await.map_err(err_string)?;
    Ok(serde_json::json!({
        "storyId": story.story_id,
        "status": "skipped",
        "loop": to_value(&loop_state)?,
    }))
}
