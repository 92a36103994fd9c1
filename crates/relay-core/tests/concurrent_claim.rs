//! Claim races between pollers that each hold their own connection to the
//! same database file, the way separate poller processes do.

use std::collections::HashSet;
use std::sync::Arc;

use relay_core::events::EventBus;
use relay_core::models::{StepStatus, StorySeed, StoryStatus};
use relay_core::store::{StepStore, StoryStore};
use relay_core::trigger::NoopTrigger;
use relay_core::workflow::{WorkflowDefinition, WorkflowRegistry};
use relay_core::{ClaimOutcome, CreateRunInput, Database, Engine};

const WORKFLOW: &str = r#"
id: race
steps:
  - id: build
    agent: developer
    input: "Build {{task}}"
    expects: [STATUS]
  - id: implement
    agent: implementer
    type: loop
    input: "Implement {{current_story_id}}"
    expects: [STATUS]
    loop:
      concurrency: 2
"#;

const POLLERS: usize = 8;

fn registry() -> Arc<WorkflowRegistry> {
    Arc::new(
        WorkflowRegistry::from_definitions([WorkflowDefinition::from_yaml(WORKFLOW).unwrap()])
            .unwrap(),
    )
}

/// One engine per poller, each on its own connection.
fn pollers(path: &str) -> Vec<Engine> {
    let registry = registry();
    (0..POLLERS)
        .map(|_| {
            Engine::new(
                Database::open(path).unwrap(),
                registry.clone(),
                Arc::new(NoopTrigger),
                EventBus::new(),
            )
        })
        .collect()
}

async fn race(engines: &[Engine], agent: &str) -> Vec<ClaimOutcome> {
    let handles: Vec<_> = engines
        .iter()
        .cloned()
        .map(|engine| {
            let agent = agent.to_string();
            tokio::spawn(async move { engine.claim(&agent).await.unwrap() })
        })
        .collect();
    let mut outcomes = Vec::new();
    for handle in handles {
        outcomes.push(handle.await.unwrap());
    }
    outcomes
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_exactly_one_poller_claims_a_pending_step() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("relay.db");
    let path = path.to_str().unwrap();
    let engines = pollers(path);

    let run = engines[0]
        .create_run(CreateRunInput::new("race", "the thing"))
        .await
        .unwrap();

    let outcomes = race(&engines, "developer").await;
    let claimed = outcomes
        .iter()
        .filter(|o| matches!(o, ClaimOutcome::Claimed(_)))
        .count();
    assert_eq!(claimed, 1);

    let steps = StepStore::new(Database::open(path).unwrap())
        .list_by_run(&run.id)
        .await
        .unwrap();
    let claimed_steps = steps
        .iter()
        .filter(|s| s.status == StepStatus::Claimed)
        .count();
    assert_eq!(claimed_steps, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_loop_concurrency_caps_parallel_story_claims() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("relay.db");
    let path = path.to_str().unwrap();
    let engines = pollers(path);

    let seeds: Vec<StorySeed> = (1..=5)
        .map(|i| StorySeed::new(format!("S-{}", i), format!("Story {}", i)))
        .collect();
    let run = engines[0]
        .create_run(CreateRunInput::new("race", "stories").with_stories(seeds))
        .await
        .unwrap();

    // Finish the single step so the loop opens.
    let work = match engines[0].claim("developer").await.unwrap() {
        ClaimOutcome::Claimed(work) => work,
        ClaimOutcome::NoWork => panic!("build step should be claimable"),
    };
    engines[0]
        .complete(&work.step.id, "STATUS: built")
        .await
        .unwrap();

    let outcomes = race(&engines, "implementer").await;
    let stories: Vec<String> = outcomes
        .iter()
        .filter_map(|o| match o {
            ClaimOutcome::Claimed(work) => work.story.as_ref().map(|s| s.story_id.clone()),
            ClaimOutcome::NoWork => None,
        })
        .collect();
    assert_eq!(stories.len(), 2);
    let distinct: HashSet<&String> = stories.iter().collect();
    assert_eq!(distinct.len(), 2);

    let in_progress = StoryStore::new(Database::open(path).unwrap())
        .list_by_run(&run.id)
        .await
        .unwrap()
        .into_iter()
        .filter(|s| s.status == StoryStatus::InProgress)
        .count();
    assert_eq!(in_progress, 2);
}
