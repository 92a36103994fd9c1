//! Workflow definitions and the text contracts with workers.
//!
//! ```text
//! workflows/*.yaml ──► WorkflowRegistry ──► Engine::create_run
//!                                               │
//!             step.input ── template::interpolate(run.context) ──► worker
//!                                               │
//!             worker text ── output::parse_output ──► run.context
//! ```

pub mod output;
pub mod registry;
pub mod schema;
pub mod template;

pub use output::{missing_keys, parse_output, parse_story_seeds};
pub use registry::WorkflowRegistry;
pub use schema::{PollingConfig, StepDefinition, WorkflowDefinition};
pub use template::interpolate;
