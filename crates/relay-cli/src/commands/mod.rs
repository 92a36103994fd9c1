//! CLI command implementations.
//!
//! Each submodule corresponds to a top-level CLI command and drives the
//! relay-core engine through `AppState`. Commands return a JSON value that
//! the binary prints to stdout; logs go to stderr.

pub mod events;
pub mod run;
pub mod step;
pub mod story;
pub mod workflow;

use std::path::PathBuf;
use std::sync::Arc;

use relay_core::state::AppState;
use relay_core::trigger::{CommandTrigger, NoopTrigger, PollingTrigger};
use relay_core::workflow::WorkflowRegistry;
use serde::Serialize;

/// Where a CLI invocation finds its database, workflows and trigger.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub db_path: Option<String>,
    pub workflows_dir: Option<String>,
    pub trigger_cmd: Option<String>,
}

/// `~/.relay/relay.db`, or `relay.db` in the working directory without a home.
pub fn default_db_path() -> String {
    dirs::home_dir()
        .map(|home| home.join(".relay").join("relay.db"))
        .unwrap_or_else(|| PathBuf::from("relay.db"))
        .to_string_lossy()
        .to_string()
}

/// Open the database, load workflows and wire the engine.
pub async fn init_state(config: &Config) -> Result<AppState, String> {
    let db_path = config.db_path.clone().unwrap_or_else(default_db_path);
    let db = relay_core::Database::open(&db_path)
        .map_err(|e| format!("Failed to open database '{}': {}", db_path, e))?;

    let mut registry = WorkflowRegistry::new();
    let loaded = match &config.workflows_dir {
        Some(dir) => registry.load_dir(dir),
        None => registry.load_default_dirs(),
    };
    let count = loaded.map_err(|e| format!("Failed to load workflows: {}", e))?;
    tracing::debug!("[relay] {} workflow(s) loaded", count);

    let trigger: Arc<dyn PollingTrigger> = match &config.trigger_cmd {
        Some(cmd) => Arc::new(CommandTrigger::new(cmd.clone())),
        None => Arc::new(NoopTrigger),
    };

    Ok(Arc::new(relay_core::AppStateInner::new(db, registry, trigger)))
}

/// Pretty-print a JSON value to stdout.
pub fn print_json(value: &serde_json::Value) {
    println!(
        "{}",
        serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
    );
}

pub(crate) fn to_value<T: Serialize>(value: &T) -> Result<serde_json::Value, String> {
    serde_json::to_value(value).map_err(|e| format!("Failed to encode output: {}", e))
}

pub(crate) fn err_string(err: relay_core::RelayError) -> String {
    err.to_string()
}
