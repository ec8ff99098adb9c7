pub mod cli;
pub mod config;
pub mod error;
pub mod paths;
pub mod process;
pub mod status;
pub mod supervisor;

#[cfg(test)]
pub(crate) mod testing;

use clap::Parser as _;
use tracing_subscriber::EnvFilter;

use cli::{render_error, render_status_failure, Cli, Command};
use config::load_config;
pub use error::{AppError, ErrorKind, Result};
pub use supervisor::{Backends, Phase, StartOutcome, StopOutcome, Supervisor};

/// Route `log` records to stderr. `RUST_LOG` wins unless `-v` is given.
fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("tts_supervisor=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    if let Err(e) = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
    {
        eprintln!("Failed to initialize logging: {}", e);
    }
}

/// Report a failure to build the supervisor. `status` stays informational
/// and exits 0.
fn setup_failed(command: Command, error: &AppError) -> i32 {
    match command {
        Command::Status { json } => {
            println!("{}", render_status_failure(error, json));
            0
        }
        _ => {
            eprintln!("{}", render_error(error));
            1
        }
    }
}

async fn dispatch(cli: Cli) -> i32 {
    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => return setup_failed(cli.command, &e),
    };
    let mut supervisor = match supervisor::system_supervisor(&config) {
        Ok(supervisor) => supervisor,
        Err(e) => return setup_failed(cli.command, &e),
    };

    match cli::execute(cli.command, &mut supervisor).await {
        Ok(message) => {
            println!("{}", message);
            0
        }
        Err(e) => {
            eprintln!("{}", render_error(&e));
            1
        }
    }
}

/// Parse arguments, run the command and return the process exit code.
pub fn run() -> i32 {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("error: failed to start async runtime: {}", e);
            return 1;
        }
    };
    runtime.block_on(dispatch(cli))
}
