//! Trigger collaborator — makes sure something periodically polls for an agent.
//!
//! The scheduler itself lives outside relay. Run creation asks the trigger to
//! ensure polling for every agent a workflow references; implementations must
//! be idempotent because every run of the same workflow asks again.

use async_trait::async_trait;
use tokio::process::Command;

use crate::workflow::schema::WorkflowDefinition;

#[async_trait]
pub trait PollingTrigger: Send + Sync {
    async fn ensure_polling(
        &self,
        agent_id: &str,
        workflow: &WorkflowDefinition,
    ) -> Result<(), String>;
}

/// Trigger that assumes polling is already set up elsewhere.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTrigger;

#[async_trait]
impl PollingTrigger for NoopTrigger {
    async fn ensure_polling(
        &self,
        agent_id: &str,
        workflow: &WorkflowDefinition,
    ) -> Result<(), String> {
        tracing::debug!(
            "[NoopTrigger] assuming polling exists for {} ({})",
            agent_id,
            workflow.id
        );
        Ok(())
    }
}

/// Trigger that runs a shell command once per agent.
///
/// The command sees `RELAY_AGENT_ID`, `RELAY_WORKFLOW_ID` and
/// `RELAY_POLL_INTERVAL_MINUTES` in its environment and must exit 0 when
/// polling exists (or was just installed).
#[derive(Debug, Clone)]
pub struct CommandTrigger {
    command: String,
}

impl CommandTrigger {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl PollingTrigger for CommandTrigger {
    async fn ensure_polling(
        &self,
        agent_id: &str,
        workflow: &WorkflowDefinition,
    ) -> Result<(), String> {
        let output = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .env("RELAY_AGENT_ID", agent_id)
            .env("RELAY_WORKFLOW_ID", &workflow.id)
            .env(
                "RELAY_POLL_INTERVAL_MINUTES",
                workflow.polling.interval_minutes.to_string(),
            )
            .output()
            .await
            .map_err(|e| format!("failed to spawn trigger command: {}", e))?;

        if output.status.success() {
            tracing::info!("[CommandTrigger] polling ensured for {}", agent_id);
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(format!(
                "trigger command exited with {} for agent {}: {}",
                output.status,
                agent_id,
                stderr.trim()
            ))
        }
    }
}
