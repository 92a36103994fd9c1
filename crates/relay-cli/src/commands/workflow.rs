//! `relay workflow` — inspect loaded workflow definitions.

use relay_core::state::AppState;
use relay_core::workflow::WorkflowDefinition;
use serde::Serialize;

use super::{err_string, to_value};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WorkflowSummary<'a> {
    id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<&'a str>,
    version: &'a str,
    steps: Vec<&'a str>,
    agents: Vec<String>,
    poll_interval_minutes: u32,
}

fn summarize(workflow: &WorkflowDefinition) -> WorkflowSummary<'_> {
    WorkflowSummary {
        id: &workflow.id,
        name: workflow.name.as_deref(),
        description: workflow.description.as_deref(),
        version: &workflow.version,
        steps: workflow.steps.iter().map(|s| s.id.as_str()).collect(),
        agents: workflow.agents(),
        poll_interval_minutes: workflow.polling.interval_minutes,
    }
}

/// List the workflows the registry loaded.
pub async fn list(state: &AppState) -> Result<serde_json::Value, String> {
    let summaries: Vec<WorkflowSummary<'_>> =
        state.registry.all().into_iter().map(summarize).collect();
    to_value(&summaries)
}

/// Parse and validate one workflow file without touching the database.
pub async fn validate(file: &str) -> Result<serde_json::Value, String> {
    let workflow = WorkflowDefinition::from_file(file).map_err(err_string)?;
    workflow.validate().map_err(err_string)?;
    let mut value = to_value(&summarize(&workflow))?;
    value["valid"] = serde_json::json!(true);
    Ok(value)
}
