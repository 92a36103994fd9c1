//! Core error type for the relay engine.
//!
//! `RelayError` covers genuine failures only. Losing a race against another
//! poller is not an error: those cases come back as outcome variants
//! (`ClaimOutcome::NoWork`, `CompleteOutcome::AlreadyHandled`, ...).

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unresolved placeholders in step input: {}", .0.join(", "))]
    MissingContextKeys(Vec<String>),

    #[error("Run {run_id} is not resumable (status: {status})")]
    NotResumable { run_id: String, status: String },

    #[error("Run {run_id} is not paused (status: {status})")]
    NotPaused { run_id: String, status: String },

    #[error("Run {run_id} cannot be cancelled (status: {status})")]
    NotCancellable { run_id: String, status: String },

    #[error("Trigger error: {0}")]
    Trigger(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<rusqlite::Error> for RelayError {
    fn from(err: rusqlite::Error) -> Self {
        RelayError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        RelayError::Internal(format!("JSON error: {}", err))
    }
}
