//! Relay CLI — start workflow runs and act as a polling worker from the shell.
//!
//! Every command prints JSON on stdout; logs go to stderr
//! (`RELAY_LOG` / `RUST_LOG` filters, default `info`).

use clap::{Parser, Subcommand};
use relay_cli::commands::{self, Config};

/// Relay — polled multi-agent workflow runs over a shared SQLite file
#[derive(Parser)]
#[command(name = "relay", version, about = "Relay — polled multi-agent workflow runs")]
pub struct Cli {
    /// Path to the SQLite database file [default: ~/.relay/relay.db]
    #[arg(long, env = "RELAY_DB_PATH", global = true)]
    db: Option<String>,

    /// Directory of workflow YAML files [default: ./workflows and ~/.relay/workflows]
    #[arg(long, env = "RELAY_WORKFLOWS_DIR", global = true)]
    workflows: Option<String>,

    /// Shell command that ensures polling for an agent (sees RELAY_AGENT_ID)
    #[arg(long, env = "RELAY_TRIGGER_CMD", global = true)]
    trigger_cmd: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect workflow definitions
    Workflow {
        #[command(subcommand)]
        action: WorkflowAction,
    },

    /// Start and steer runs
    Run {
        #[command(subcommand)]
        action: RunAction,
    },

    /// Worker operations: peek, claim, complete, fail
    Step {
        #[command(subcommand)]
        action: StepAction,
    },

    /// Inspect a run's story backlog
    Story {
        #[command(subcommand)]
        action: StoryAction,
    },

    /// Show the event log of a run
    Events {
        /// Run id or number (`12`, `#12`)
        run: String,
    },
}

#[derive(Subcommand)]
enum WorkflowAction {
    /// List loaded workflows
    List,
    /// Validate a workflow YAML file
    Validate {
        /// Path to the workflow YAML file
        file: String,
    },
}

#[derive(Subcommand)]
enum RunAction {
    /// Start a run of a workflow
    Start {
        /// Workflow id
        workflow: String,
        /// Task description
        task: String,
        /// Repository / target override (context key `repo`)
        #[arg(long)]
        repo: Option<String>,
        /// JSON file with a story backlog; skips planning steps
        #[arg(long)]
        stories: Option<String>,
        /// Hold a run with supplied stories until `relay run approve`
        #[arg(long)]
        approve: bool,
        /// URL passed along for completion notifications
        #[arg(long)]
        notify: Option<String>,
        /// Context override, repeatable
        #[arg(long = "set", value_name = "KEY=VALUE")]
        set: Vec<String>,
    },
    /// List runs, newest first
    List {
        /// Only runs with this status
        #[arg(long)]
        status: Option<String>,
    },
    /// Show a run with its steps and stories
    Status { run: String },
    /// Approve a paused run
    Approve { run: String },
    /// Resume a failed run from its failed step
    Resume { run: String },
    /// Cancel a run
    Stop { run: String },
    /// List claimed steps that look abandoned
    Stale {
        /// Minutes since the claim was last touched
        #[arg(long, default_value_t = 60)]
        minutes: i64,
    },
}

#[derive(Subcommand)]
enum StepAction {
    /// Check whether an agent has work, without claiming it
    Peek { agent: String },
    /// Claim the next step (or story) for an agent
    Claim { agent: String },
    /// Report output for a claimed step; reads stdin unless --file is given
    Complete {
        /// Step id from the claim
        step: String,
        /// Story id (or story row id) when several stories are in progress
        #[arg(long)]
        story: Option<String>,
        /// File with the worker output
        #[arg(long)]
        file: Option<String>,
    },
    /// Report a failure for a claimed step
    Fail {
        step: String,
        message: String,
        #[arg(long)]
        story: Option<String>,
    },
}

#[derive(Subcommand)]
enum StoryAction {
    /// List stories of a run
    List { run: String },
    /// Skip a pending story
    Skip {
        run: String,
        /// Story id as given in the backlog
        story: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing on stderr so stdout stays JSON
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("RELAY_LOG")
                .or_else(|_| tracing_subscriber::EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = Config {
        db_path: cli.db,
        workflows_dir: cli.workflows,
        trigger_cmd: cli.trigger_cmd,
    };

    let result = match cli.command {
        Commands::Workflow {
            action: WorkflowAction::Validate { file },
        } => commands::workflow::validate(&file).await,

        command => match commands::init_state(&config).await {
            Err(e) => Err(e),
            Ok(state) => match command {
                Commands::Workflow { action } => match action {
                    WorkflowAction::List => commands::workflow::list(&state).await,
                    WorkflowAction::Validate { file } => commands::workflow::validate(&file).await,
                },

                Commands::Run { action } => match action {
                    RunAction::Start {
                        workflow,
                        task,
                        repo,
                        stories,
                        approve,
                        notify,
                        set,
                    } => {
                        let options = commands::run::StartOptions {
                            repo,
                            stories_file: stories,
                            require_approval: approve,
                            notify_url: notify,
                            set,
                        };
                        commands::run::start(&state, &workflow, &task, options).await
                    }
                    RunAction::List { status } => {
                        commands::run::list(&state, status.as_deref()).await
                    }
                    RunAction::Status { run } => commands::run::status(&state, &run).await,
                    RunAction::Approve { run } => commands::run::approve(&state, &run).await,
                    RunAction::Resume { run } => commands::run::resume(&state, &run).await,
                    RunAction::Stop { run } => commands::run::stop(&state, &run).await,
                    RunAction::Stale { minutes } => commands::run::stale(&state, minutes).await,
                },

                Commands::Step { action } => match action {
                    StepAction::Peek { agent } => commands::step::peek(&state, &agent).await,
                    StepAction::Claim { agent } => commands::step::claim(&state, &agent).await,
                    StepAction::Complete { step, story, file } => {
                        match commands::step::read_output(file.as_deref()) {
                            Ok(output) => {
                                commands::step::complete(&state, &step, story.as_deref(), &output)
                                    .await
                            }
                            Err(e) => Err(e),
                        }
                    }
                    StepAction::Fail {
                        step,
                        message,
                        story,
                    } => commands::step::fail(&state, &step, &message, story.as_deref()).await,
                },

                Commands::Story { action } => match action {
                    StoryAction::List { run } => commands::story::list(&state, &run).await,
                    StoryAction::Skip { run, story } => {
                        commands::story::skip(&state, &run, &story).await
                    }
                },

                Commands::Events { run } => commands::events::list(&state, &run).await,
            },
        },
    };

    match result {
        Ok(value) => commands::print_json(&value),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}
