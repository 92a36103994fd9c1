//! Relay Core — run/step/story state machine for polled agent workflows.
//!
//! A workflow is an ordered pipeline of steps, each executed by an agent
//! role. Workers poll for work, claim a step, do whatever the step asks
//! outside this crate, and report free-text output back. There is no
//! central orchestrator: several pollers (threads or separate processes)
//! race on the same SQLite file, and every transition is a guarded
//! conditional update inside one transaction.
//!
//! - [`workflow`] — YAML definitions, `{{key}}` input templates, `KEY: value` output decoding
//! - [`engine`] — run creation, claim/complete/fail, the story loop, resume/approve/cancel
//! - [`store`] — read-side access to runs, steps, stories and the event log
//! - [`events`] / [`trigger`] — best-effort collaborators around the engine

pub mod db;
pub mod engine;
pub mod error;
pub mod events;
pub mod models;
pub mod state;
pub mod store;
pub mod trigger;
pub mod workflow;

// Convenience re-exports
pub use db::Database;
pub use engine::{
    Advance, ClaimOutcome, ClaimedWork, CompleteOutcome, CreateRunInput, Engine, FailOutcome,
    LoopState,
};
pub use error::RelayError;
pub use state::{AppState, AppStateInner};
