//! Shared application state for front-ends (CLI, pollers, tests).

use std::sync::Arc;

use crate::db::Database;
use crate::engine::Engine;
use crate::events::EventBus;
use crate::store::{EventStore, RunStore, StepStore, StoryStore};
use crate::trigger::PollingTrigger;
use crate::workflow::registry::WorkflowRegistry;

/// Stores, registry and engine wired to one database.
pub struct AppStateInner {
    pub db: Database,
    pub run_store: RunStore,
    pub step_store: StepStore,
    pub story_store: StoryStore,
    pub event_store: EventStore,
    pub registry: Arc<WorkflowRegistry>,
    pub event_bus: EventBus,
    pub engine: Engine,
}

pub type AppState = Arc<AppStateInner>;

impl AppStateInner {
    pub fn new(
        db: Database,
        registry: WorkflowRegistry,
        trigger: Arc<dyn PollingTrigger>,
    ) -> Self {
        let registry = Arc::new(registry);
        let event_bus = EventBus::new();
        Self {
            run_store: RunStore::new(db.clone()),
            step_store: StepStore::new(db.clone()),
            story_store: StoryStore::new(db.clone()),
            event_store: EventStore::new(db.clone()),
            engine: Engine::new(db.clone(), registry.clone(), trigger, event_bus.clone()),
            registry,
            event_bus,
            db,
        }
    }
}
