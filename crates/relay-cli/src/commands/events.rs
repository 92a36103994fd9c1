//! `relay events` — the append-only event log of a run.

use relay_core::state::AppState;

use super::{err_string, to_value};

pub async fn list(state: &AppState, run_ref: &str) -> Result<serde_json::Value, String> {
    let run = state.run_store.find(run_ref).await.map_err(err_string)?;
    let events = state.event_store.list_by_run(&run.id).await.map_err(err_string)?;
    to_value(&events)
}
