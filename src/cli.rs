//! Command-line surface.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde::Serialize;

use crate::error::{AppError, Result};
use crate::process::ShutdownOutcome;
use crate::supervisor::{StartOutcome, StopOutcome, Supervisor};

#[derive(Parser, Debug)]
#[command(name = "tts-supervisor", version)]
#[command(about = "Start, stop and inspect the speech-synthesis API worker")]
pub struct Cli {
    /// Path to the configuration file
    #[arg(short, long, global = true, env = "TTS_SUPERVISOR_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Launch the worker and wait until it reports healthy
    Start,
    /// Stop the worker, force killing it if it ignores SIGTERM
    Stop,
    /// Show process, port, health and GPU state
    Status {
        /// Print the snapshot as JSON
        #[arg(long)]
        json: bool,
    },
    /// Stop, clean up stray workers, then start again
    Restart,
}

fn describe_start(outcome: StartOutcome) -> String {
    match outcome {
        StartOutcome::AlreadyRunning { pid } => {
            format!("Worker already running (pid {})", pid)
        }
        StartOutcome::Running { pid } => format!("Worker running and healthy (pid {})", pid),
        StartOutcome::Unconfirmed {
            pid,
            port_listening,
        } => format!(
            "Worker started (pid {}) but not confirmed healthy: {}. \
             It may still be loading; check `status` shortly.",
            pid,
            if port_listening {
                "health endpoint not reporting healthy yet"
            } else {
                "port not listening yet"
            }
        ),
    }
}

fn describe_stop(outcome: StopOutcome) -> String {
    match outcome {
        StopOutcome::NotRunning => "Worker is not running".to_string(),
        StopOutcome::Stopped { pid, outcome } => {
            let how = match outcome {
                ShutdownOutcome::Graceful => "gracefully",
                ShutdownOutcome::Forced => "after SIGKILL",
                ShutdownOutcome::Failed => "incompletely",
            };
            format!("Worker stopped {} (pid {})", how, pid)
        }
    }
}

/// Run one command. Returns the text to print on success.
pub async fn execute(command: Command, supervisor: &mut Supervisor) -> Result<String> {
    match command {
        Command::Start => supervisor.start().await.map(describe_start),
        Command::Stop => supervisor.stop().await.map(describe_stop),
        Command::Status { json } => {
            let view = supervisor.status().await;
            if json {
                view.to_json()
            } else {
                Ok(view.to_string())
            }
        }
        Command::Restart => supervisor.restart().await.map(describe_start),
    }
}

/// Operator-facing rendering of a failed command.
pub fn render_error(error: &AppError) -> String {
    match error.hint() {
        Some(hint) => format!("error: {}\nhint: {}", error, hint),
        None => format!("error: {}", error),
    }
}

#[derive(Serialize)]
struct StatusFailure<'a> {
    state: &'static str,
    error: &'a AppError,
}

/// Status output when the supervisor itself could not be set up. `status`
/// still reports, with the state unknown.
pub fn render_status_failure(error: &AppError, json: bool) -> String {
    let text = || format!("State:    unknown\n{}", render_error(error));
    if !json {
        return text();
    }
    let failure = StatusFailure {
        state: "unknown",
        error,
    };
    serde_json::to_string_pretty(&failure).unwrap_or_else(|_| text())
}
