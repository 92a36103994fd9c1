//! Integration tests for the relay-cli commands.
//!
//! These tests drive the same command functions the binary calls, against a
//! temporary database file and a temporary workflow directory.

use relay_cli::commands::{self, run::StartOptions, Config};
use relay_core::state::AppState;
use tempfile::TempDir;

const FEATURE: &str = r#"
id: feature
name: Feature development
steps:
  - id: plan
    agent: planner
    input: "Plan {{task}} in {{repo}}"
    expects: [STATUS, STORIES_JSON]
    skip_when_stories_supplied: true
  - id: implement
    agent: developer
    type: loop
    input: "Implement {{current_story}}"
    expects: [STATUS]
    loop:
      on_story_failure: tolerate
      story_max_retries: 1
  - id: review
    agent: reviewer
    input: "Review {{task}} (ticket {{ticket}})"
    expects: [VERDICT]
"#;

struct Fixture {
    dir: TempDir,
    state: AppState,
}

async fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let workflows = dir.path().join("workflows");
    std::fs::create_dir_all(&workflows).unwrap();
    std::fs::write(workflows.join("feature.yaml"), FEATURE).unwrap();

    let config = Config {
        db_path: Some(dir.path().join("relay.db").to_string_lossy().to_string()),
        workflows_dir: Some(workflows.to_string_lossy().to_string()),
        trigger_cmd: None,
    };
    let state = commands::init_state(&config).await.unwrap();
    Fixture { dir, state }
}

fn write_stories(dir: &TempDir) -> String {
    let path = dir.path().join("stories.json");
    std::fs::write(
        &path,
        r#"[
          {"id": "S-1", "title": "Login form", "acceptanceCriteria": ["renders", "submits"]},
          {"id": "S-2", "title": "Logout button"}
        ]"#,
    )
    .unwrap();
    path.to_string_lossy().to_string()
}

#[tokio::test]
async fn test_workflow_list_and_validate() {
    let f = fixture().await;
    let listed = commands::workflow::list(&f.state).await.unwrap();
    let workflows = listed.as_array().unwrap();
    assert_eq!(workflows.len(), 1);
    assert_eq!(workflows[0]["id"], "feature");
    assert_eq!(
        workflows[0]["agents"],
        serde_json::json!(["planner", "developer", "reviewer"])
    );

    let file = f.dir.path().join("workflows").join("feature.yaml");
    let validated = commands::workflow::validate(file.to_str().unwrap())
        .await
        .unwrap();
    assert_eq!(validated["valid"], true);

    let broken = f.dir.path().join("broken.yaml");
    std::fs::write(&broken, "id: broken\nsteps: []\n").unwrap();
    assert!(commands::workflow::validate(broken.to_str().unwrap())
        .await
        .is_err());
}

#[tokio::test]
async fn test_worker_round_trip_with_supplied_stories() {
    let f = fixture().await;
    let stories = write_stories(&f.dir);

    let run = commands::run::start(
        &f.state,
        "feature",
        "add auth",
        StartOptions {
            repo: Some("acme/web".to_string()),
            stories_file: Some(stories),
            require_approval: true,
            set: vec!["ticket=AUTH-7".to_string()],
            ..Default::default()
        },
    )
    .await
    .unwrap();
    assert_eq!(run["status"], "paused");
    assert_eq!(run["runNumber"], 1);
    assert_eq!(run["context"]["ticket"], "AUTH-7");

    let peek = commands::step::peek(&f.state, "developer").await.unwrap();
    assert_eq!(peek["hasWork"], false);

    let approved = commands::run::approve(&f.state, "#1").await.unwrap();
    assert_eq!(approved["status"], "running");

    let claim = commands::step::claim(&f.state, "developer").await.unwrap();
    assert_eq!(claim["outcome"], "claimed");
    assert_eq!(claim["story"]["storyId"], "S-1");
    let input = claim["input"].as_str().unwrap();
    assert!(input.contains("S-1: Login form"));
    assert!(input.contains("- submits"));
    let step_id = claim["step"]["id"].as_str().unwrap().to_string();

    let done = commands::step::complete(&f.state, &step_id, Some("S-1"), "STATUS: done")
        .await
        .unwrap();
    assert_eq!(done["outcome"], "story_done");
    assert_eq!(done["loop_state"]["state"], "continuing");

    let claim = commands::step::claim(&f.state, "developer").await.unwrap();
    assert_eq!(claim["story"]["storyId"], "S-2");
    let retry = commands::step::fail(&f.state, &step_id, "flaky test", None)
        .await
        .unwrap();
    assert_eq!(retry["outcome"], "story_retrying");
    assert_eq!(retry["retry_count"], 1);

    commands::step::claim(&f.state, "developer").await.unwrap();
    let finished = commands::step::complete(&f.state, &step_id, None, "STATUS: done")
        .await
        .unwrap();
    assert_eq!(finished["loop_state"]["state"], "finished");

    let review = commands::step::claim(&f.state, "reviewer").await.unwrap();
    assert_eq!(review["input"], "Review add auth (ticket AUTH-7)");
    let review_id = review["step"]["id"].as_str().unwrap().to_string();
    let last = commands::step::complete(&f.state, &review_id, None, "VERDICT: ship")
        .await
        .unwrap();
    assert_eq!(last["advance"]["kind"], "run_done");

    let status = commands::run::status(&f.state, "1").await.unwrap();
    assert_eq!(status["run"]["status"], "done");
    assert_eq!(status["steps"].as_array().unwrap().len(), 2);
    assert_eq!(status["run"]["context"]["s-1.status"], "done");

    let events = commands::events::list(&f.state, "1").await.unwrap();
    let kinds: Vec<&str> = events
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["kind"].as_str().unwrap())
        .collect();
    assert_eq!(kinds.first(), Some(&"run.created"));
    assert_eq!(kinds.last(), Some(&"run.done"));
    assert!(kinds.contains(&"story.retry"));
}

#[tokio::test]
async fn test_claim_without_work_and_stop() {
    let f = fixture().await;
    let idle = commands::step::claim(&f.state, "planner").await.unwrap();
    assert_eq!(idle["outcome"], "no_work");

    commands::run::start(
        &f.state,
        "feature",
        "add search",
        StartOptions {
            repo: Some("acme/web".to_string()),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    let claim = commands::step::claim(&f.state, "planner").await.unwrap();
    assert_eq!(claim["input"], "Plan add search in acme/web");

    let stopped = commands::run::stop(&f.state, "1").await.unwrap();
    assert_eq!(stopped["status"], "cancelled");
    let step_id = claim["step"]["id"].as_str().unwrap();
    let late = commands::step::complete(&f.state, step_id, None, "STATUS: ok")
        .await
        .unwrap();
    assert_eq!(late["outcome"], "run_inactive");

    let err = commands::run::resume(&f.state, "1").await.unwrap_err();
    assert!(err.contains("not resumable"));
}

#[tokio::test]
async fn test_story_skip_and_list() {
    let f = fixture().await;
    let stories = write_stories(&f.dir);
    commands::run::start(
        &f.state,
        "feature",
        "add auth",
        StartOptions {
            repo: Some("r".to_string()),
            stories_file: Some(stories),
            set: vec!["ticket=T".to_string()],
            ..Default::default()
        },
    )
    .await
    .unwrap();

    let skipped = commands::story::skip(&f.state, "1", "S-2").await.unwrap();
    assert_eq!(skipped["status"], "skipped");

    let listed = commands::story::list(&f.state, "1").await.unwrap();
    let statuses: Vec<&str> = listed
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["status"].as_str().unwrap())
        .collect();
    assert_eq!(statuses, vec!["pending", "skipped"]);
}

#[tokio::test]
async fn test_bad_inputs_are_reported() {
    let f = fixture().await;
    let err = commands::run::start(
        &f.state,
        "feature",
        "x",
        StartOptions {
            set: vec!["no-equals-sign".to_string()],
            ..Default::default()
        },
    )
    .await
    .unwrap_err();
    assert!(err.contains("key=value"));

    let err = commands::run::start(&f.state, "missing", "x", StartOptions::default())
        .await
        .unwrap_err();
    assert!(err.contains("Not found"));

    let err = commands::run::list(&f.state, Some("sleeping")).await.unwrap_err();
    assert!(err.contains("Unknown run status"));

    let err = commands::run::status(&f.state, "#42").await.unwrap_err();
    assert!(err.contains("Not found"));

    let stale = commands::run::stale(&f.state, 30).await.unwrap();
    assert!(stale.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_story_row_id_from_another_run_is_refused() {
    let f = fixture().await;
    for _ in 0..2 {
        commands::run::start(
            &f.state,
            "feature",
            "add auth",
            StartOptions {
                repo: Some("r".to_string()),
                stories_file: Some(write_stories(&f.dir)),
                set: vec!["ticket=T".to_string()],
                ..Default::default()
            },
        )
        .await
        .unwrap();
    }

    let first = commands::step::claim(&f.state, "developer").await.unwrap();
    let second = commands::step::claim(&f.state, "developer").await.unwrap();
    assert_ne!(first["runId"], second["runId"]);

    let first_step = first["step"]["id"].as_str().unwrap();
    let foreign_story = second["story"]["id"].as_str().unwrap();
    let err = commands::step::complete(&f.state, first_step, Some(foreign_story), "STATUS: done")
        .await
        .unwrap_err();
    assert!(err.contains("belongs to run"));

    let err = commands::step::fail(&f.state, first_step, "nope", Some(foreign_story))
        .await
        .unwrap_err();
    assert!(err.contains("belongs to run"));

    let own_story = first["story"]["id"].as_str().unwrap();
    let done = commands::step::complete(&f.state, first_step, Some(own_story), "STATUS: done")
        .await
        .unwrap();
    assert_eq!(done["outcome"], "story_done");
}
