//! Loads workflow definitions from a directory and serves them by id.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::RelayError;
use crate::workflow::schema::WorkflowDefinition;

/// Workflow definitions indexed by id. Loaded once and treated as read-only.
#[derive(Debug, Default, Clone)]
pub struct WorkflowRegistry {
    workflows: HashMap<String, WorkflowDefinition>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from already-parsed definitions (validated here).
    pub fn from_definitions(
        definitions: impl IntoIterator<Item = WorkflowDefinition>,
    ) -> Result<Self, RelayError> {
        let mut registry = Self::new();
        for wf in definitions {
            registry.insert(wf)?;
        }
        Ok(registry)
    }

    pub fn insert(&mut self, workflow: WorkflowDefinition) -> Result<(), RelayError> {
        workflow.validate()?;
        self.workflows.insert(workflow.id.clone(), workflow);
        Ok(())
    }

    /// Load every `.yaml`/`.yml` file in a directory.
    pub fn load_dir(&mut self, dir: impl AsRef<Path>) -> Result<usize, RelayError> {
        let dir_path = dir.as_ref();
        if !dir_path.is_dir() {
            return Err(RelayError::NotFound(format!(
                "workflow directory '{}'",
                dir_path.display()
            )));
        }

        let entries = std::fs::read_dir(dir_path).map_err(|e| {
            RelayError::Internal(format!(
                "Failed to read directory '{}': {}",
                dir_path.display(),
                e
            ))
        })?;

        let mut paths: Vec<PathBuf> = Vec::new();
        for entry in entries {
            let entry =
                entry.map_err(|e| RelayError::Internal(format!("Directory entry error: {}", e)))?;
            let path = entry.path();
            match path.extension().and_then(|e| e.to_str()) {
                Some("yaml") | Some("yml") => paths.push(path),
                _ => continue,
            }
        }
        paths.sort();

        let mut count = 0;
        for path in paths {
            let workflow = WorkflowDefinition::from_file(&path)?;
            tracing::info!(
                "[WorkflowRegistry] Loaded workflow: {} ({} steps) from {}",
                workflow.id,
                workflow.steps.len(),
                path.display()
            );
            self.insert(workflow)?;
            count += 1;
        }
        Ok(count)
    }

    /// Load from `./workflows` and `~/.relay/workflows`, skipping missing dirs.
    pub fn load_default_dirs(&mut self) -> Result<usize, RelayError> {
        let mut search_paths = vec![PathBuf::from("workflows")];
        if let Some(home) = dirs::home_dir() {
            search_paths.push(home.join(".relay").join("workflows"));
        }

        let mut total = 0;
        for path in search_paths {
            if path.is_dir() {
                total += self.load_dir(&path)?;
            }
        }
        Ok(total)
    }

    pub fn get(&self, id: &str) -> Result<&WorkflowDefinition, RelayError> {
        self.workflows
            .get(id)
            .ok_or_else(|| RelayError::NotFound(format!("workflow '{}'", id)))
    }

    /// All workflows sorted by id.
    pub fn all(&self) -> Vec<&WorkflowDefinition> {
        let mut all: Vec<_> = self.workflows.values().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub fn len(&self) -> usize {
        self.workflows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workflows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_dir_reads_yaml_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("one.yaml"),
            "id: one\nsteps:\n  - { id: a, agent: x, input: \"hi\" }\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("two.yml"),
            "id: two\nsteps:\n  - { id: a, agent: y, input: \"hi\" }\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let mut registry = WorkflowRegistry::new();
        assert_eq!(registry.load_dir(dir.path()).unwrap(), 2);
        assert_eq!(registry.get("two").unwrap().steps[0].agent, "y");
        assert_eq!(
            registry.all().iter().map(|w| w.id.as_str()).collect::<Vec<_>>(),
            vec!["one", "two"]
        );
    }

    #[test]
    fn test_unknown_workflow_is_not_found() {
        let registry = WorkflowRegistry::new();
        assert!(matches!(registry.get("nope"), Err(RelayError::NotFound(_))));
    }

    #[test]
    fn test_invalid_file_fails_the_load() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bad.yaml"), "id: bad\nsteps: []\n").unwrap();
        let mut registry = WorkflowRegistry::new();
        assert!(matches!(
            registry.load_dir(dir.path()),
            Err(RelayError::Validation(_))
        ));
    }
}
