use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod ask;
mod context;
mod setup_cmd;
mod status;
mod sync_cmd;
mod watch_cmd;

/// Durable AI expert agents for your git repositories
///
/// repo-expert keeps one long-lived agent per configured repository at a
/// remote memory service. The agent's archival memory mirrors the repo's
/// files and is re-synced after every commit (or file save, in watch mode).
///
/// QUICK START:
///
///   # Declare repos in repo-expert.yaml, then:
///   repo-expert setup            # create + index + bootstrap every repo
///   repo-expert watch            # auto-sync on commits and edits
///   repo-expert ask "how does the sync engine handle failures?"
#[derive(Parser)]
#[command(name = "repo-expert")]
#[command(version, about)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to the YAML config file
    #[arg(long, global = true, default_value = "repo-expert.yaml")]
    config: PathBuf,

    /// Path to the state file (default: .repo-expert-state.json)
    #[arg(long, global = true)]
    state: Option<PathBuf>,

    /// Emit structured JSON instead of human-readable output
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create, index, and bootstrap agents (resumable)
    Setup(setup_cmd::SetupArgs),

    /// One-shot sync of a repo against its current HEAD
    Sync(sync_cmd::SyncArgs),

    /// Watch repos and auto-sync until interrupted
    Watch(watch_cmd::WatchArgs),

    /// Ask one or more repo experts a question
    Ask(ask::AskArgs),

    /// Show per-repo agent and sync status
    Status(status::StatusArgs),
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    let ctx = context::Context {
        config_path: cli.config,
        state_path: cli.state,
        json: cli.json,
    };

    let result = match cli.command {
        Commands::Setup(args) => setup_cmd::run(&ctx, &args).await,
        Commands::Sync(args) => sync_cmd::run(&ctx, &args).await,
        Commands::Watch(args) => watch_cmd::run(&ctx, &args).await,
        Commands::Ask(args) => ask::run(&ctx, &args).await,
        Commands::Status(args) => status::run(&ctx, &args).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if ctx.json {
                let report = serde_json::json!({ "ok": false, "error": format!("{e:#}") });
                println!("{report}");
            } else {
                eprintln!("error: {e:#}");
            }
            ExitCode::FAILURE
        }
    }
}
