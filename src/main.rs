use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use tagtimer::AppState;
use tagtimer::application::commands::{
    get_timer_state_impl, list_tag_history_impl, start_timer_with_tags_impl, stop_timer_impl,
    update_tags_with_list_impl, validate_tag_list_impl,
};
use tagtimer::infrastructure::error::InfraError;
use tagtimer::infrastructure::logging::init_logging;
use tokio::sync::broadcast::error::RecvError;

#[derive(Debug, Parser)]
#[command(name = "tagtimer", version, about = "Tag-aware timer backed by an external time tracker")]
struct Cli {
    /// Workspace root holding config/ and logs/ (defaults to the current directory).
    #[arg(long, global = true)]
    workspace: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the current timer state.
    Status,
    /// Start a timer with the given tags, one tag per argument.
    Start { tags: Vec<String> },
    /// Stop the running timer.
    Stop,
    /// Replace the tags of the running timer, one tag per argument.
    Retag { tags: Vec<String> },
    /// Check tag text without touching the tracker.
    Validate { tags: Vec<String> },
    /// List recently used tags.
    History,
    /// Poll the tracker and print every change until interrupted.
    Watch,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let workspace_root = match cli.workspace.map(Ok).unwrap_or_else(std::env::current_dir) {
        Ok(path) => path,
        Err(error) => {
            eprintln!("failed to resolve workspace: {error}");
            return ExitCode::FAILURE;
        }
    };

    let state = match AppState::new(workspace_root) {
        Ok(state) => state,
        Err(error) => {
            eprintln!("failed to initialize: {error}");
            return ExitCode::FAILURE;
        }
    };
    if let Some(logs_dir) = state.logs_dir() {
        if let Err(error) = init_logging(logs_dir) {
            eprintln!("logging disabled: {error}");
        }
    }

    match run(&state, cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err((command, error)) => {
            eprintln!("{}", state.command_error(command, &error));
            ExitCode::FAILURE
        }
    }
}

async fn run(state: &AppState, command: Command) -> Result<(), (&'static str, InfraError)> {
    match command {
        Command::Status => print_json(
            get_timer_state_impl(state)
                .await
                .map_err(|error| ("status", error))?,
        ),
        Command::Start { tags } => print_json(
            start_timer_with_tags_impl(state, tags)
                .await
                .map_err(|error| ("start", error))?,
        ),
        Command::Stop => print_json(stop_timer_impl(state).await.map_err(|error| ("stop", error))?),
        Command::Retag { tags } => print_json(
            update_tags_with_list_impl(state, tags)
                .await
                .map_err(|error| ("retag", error))?,
        ),
        Command::Validate { tags } => print_json(validate_tag_list_impl(tags)),
        Command::History => print_json(
            list_tag_history_impl(state)
                .await
                .map_err(|error| ("history", error))?,
        ),
        Command::Watch => watch(state).await,
    }
    Ok(())
}

async fn watch(state: &AppState) {
    let mut snapshots = state.subscribe_snapshots();
    let mut events = state.subscribe_events();
    let poller = state.start_polling();

    loop {
        tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = snapshots.borrow_and_update().clone();
                print_json(&*snapshot);
            }
            event = events.recv() => match event {
                Ok(event) => print_json(&event),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "watch fell behind on timer events");
                }
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    poller.shutdown().await;
}

fn print_json<T: Serialize>(value: T) {
    match serde_json::to_string(&value) {
        Ok(line) => println!("{line}"),
        Err(error) => eprintln!("failed to serialize output: {error}"),
    }
}
