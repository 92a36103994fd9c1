//! Event Bus — fans committed run events out to best-effort sinks.
//!
//! Events are written to the `events` table inside the transaction that
//! produced them. Only after the commit does the engine publish them here,
//! so a sink (issue-tracker sync, notifications) can never roll back or
//! block a core transition. Sink errors are logged and dropped.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::models::event::RunEvent;

#[async_trait]
pub trait EventSink: Send + Sync {
    /// Stable name used for registration and log lines.
    fn name(&self) -> &str;

    async fn deliver(&self, event: &RunEvent) -> Result<(), String>;
}

/// Thread-safe registry of event sinks.
#[derive(Clone, Default)]
pub struct EventBus {
    sinks: Arc<RwLock<BTreeMap<String, Arc<dyn EventSink>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a sink, replacing any sink with the same name.
    pub async fn subscribe(&self, sink: Arc<dyn EventSink>) {
        let mut sinks = self.sinks.write().await;
        sinks.insert(sink.name().to_string(), sink);
    }

    pub async fn unsubscribe(&self, name: &str) {
        let mut sinks = self.sinks.write().await;
        sinks.remove(name);
    }

    /// Deliver events in order to every sink.
    pub async fn publish(&self, events: &[RunEvent]) {
        if events.is_empty() {
            return;
        }
        let sinks: Vec<Arc<dyn EventSink>> = self.sinks.read().await.values().cloned().collect();
        for event in events {
            for sink in &sinks {
                if let Err(e) = sink.deliver(event).await {
                    tracing::warn!(
                        "[EventBus] sink '{}' failed on {} for run {}: {}",
                        sink.name(),
                        event.kind,
                        event.run_id,
                        e
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::event::EventKind;
    use std::sync::Mutex;

    struct Recorder {
        seen: Mutex<Vec<EventKind>>,
    }

    #[async_trait]
    impl EventSink for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        async fn deliver(&self, event: &RunEvent) -> Result<(), String> {
            self.seen.lock().unwrap().push(event.kind);
            Ok(())
        }
    }

    struct Broken;

    #[async_trait]
    impl EventSink for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        async fn deliver(&self, _event: &RunEvent) -> Result<(), String> {
            Err("tracker unreachable".to_string())
        }
    }

    fn event(kind: EventKind) -> RunEvent {
        RunEvent {
            id: 1,
            run_id: "run".to_string(),
            step_id: None,
            story_id: None,
            kind,
            detail: serde_json::json!({}),
            created_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_failing_sink_does_not_stop_delivery() {
        let bus = EventBus::new();
        let recorder = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
        });
        bus.subscribe(Arc::new(Broken)).await;
        bus.subscribe(recorder.clone()).await;

        bus.publish(&[event(EventKind::StoryStarted), event(EventKind::RunDone)])
            .await;

        assert_eq!(
            *recorder.seen.lock().unwrap(),
            vec![EventKind::StoryStarted, EventKind::RunDone]
        );
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let bus = EventBus::new();
        let recorder = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
        });
        bus.subscribe(recorder.clone()).await;
        bus.unsubscribe("recorder").await;
        bus.publish(&[event(EventKind::RunDone)]).await;
        assert!(recorder.seen.lock().unwrap().is_empty());
    }
}
