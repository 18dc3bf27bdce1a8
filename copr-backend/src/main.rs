use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;

use copr_backend::clock::SystemClock;
use copr_backend::config::BackendConfig;
use copr_backend::dispatcher::{BackendDaemon, shutdown_signal};
use copr_backend::frontend::{FrontendApi, HttpFrontendClient};
use copr_backend::logging::init_logging;
use copr_backend::store::SqliteStore;
use copr_backend::worker::WorkerHandle;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(short, long, global = true, env = "COPR_BE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the worker managers and the frontend sync until stopped
    Daemon,

    /// Report progress of a spawned worker into its record
    Worker {
        /// Worker id, e.g. rpm_build_worker:123-fedora-39-x86_64
        #[arg(long)]
        worker_id: String,

        #[command(subcommand)]
        action: WorkerCommand,
    },

    /// Ask the frontend whether a build may start
    StartingBuild {
        #[arg(long)]
        build_id: i64,
        #[arg(long)]
        chroot: String,
    },

    /// Tell the frontend to return a build to the pending state
    Reschedule {
        #[arg(long)]
        build_id: i64,
        #[arg(long)]
        task_id: String,
        #[arg(long)]
        chroot: String,
    },
}

#[derive(Subcommand, Debug)]
enum WorkerCommand {
    /// Announce the worker process; exits 2 when the manager gave up on it
    MarkStarted {
        /// Worker PID, defaults to the process running this command
        #[arg(long)]
        pid: Option<u32>,
    },
    /// Refresh the liveness timestamp
    RefreshChecked,
    /// Write the terminal status
    SetStatus { status: String },
    /// Write an arbitrary result field
    SetField { field: String, value: String },
    /// Exits 0 when cancellation was requested, 1 otherwise
    IsCancelRequested,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    let config = BackendConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;

    match cli.command {
        Command::Daemon => {
            let (logging, _guard) = init_logging(&config.logging)?;
            let token = CancellationToken::new();
            logging.start_retention_cleanup(token.clone());

            let signal_token = token.clone();
            tokio::spawn(async move {
                shutdown_signal().await;
                signal_token.cancel();
            });

            info!("copr-backend {} starting", env!("CARGO_PKG_VERSION"));
            BackendDaemon::new(config).run(token).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Worker { worker_id, action } => {
            let store = SqliteStore::connect(&config.store.url)
                .await
                .with_context(|| format!("Failed to open store {}", config.store.url))?;
            let handle = WorkerHandle::new(Arc::new(store), Arc::new(SystemClock), worker_id);
            run_worker_command(&handle, action).await
        }
        Command::StartingBuild { build_id, chroot } => {
            let client = HttpFrontendClient::new(&config.frontend);
            let can_start = client.starting_build(build_id, &chroot).await?;
            println!("{}", can_start);
            Ok(if can_start {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(1)
            })
        }
        Command::Reschedule {
            build_id,
            task_id,
            chroot,
        } => {
            let client = HttpFrontendClient::new(&config.frontend);
            client.reschedule_build(build_id, &task_id, &chroot).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn run_worker_command(handle: &WorkerHandle, action: WorkerCommand) -> anyhow::Result<ExitCode> {
    match action {
        WorkerCommand::MarkStarted { pid } => {
            let pid = worker_pid(pid)?;
            if !handle.mark_started(pid).await? {
                return Ok(ExitCode::from(2));
            }
        }
        WorkerCommand::RefreshChecked => handle.refresh_checked().await?,
        WorkerCommand::SetStatus { status } => handle.set_status(&status).await?,
        WorkerCommand::SetField { field, value } => handle.set_field(&field, &value).await?,
        WorkerCommand::IsCancelRequested => {
            if !handle.is_cancel_requested().await? {
                return Ok(ExitCode::from(1));
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

/// The helper is short-lived, so the worker is the process that invoked it.
fn worker_pid(explicit: Option<u32>) -> anyhow::Result<u32> {
    explicit
        .or_else(process_utils::parent_pid)
        .context("Can not determine the worker PID, pass --pid")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_pid_defaults_to_the_invoking_process() {
        assert_eq!(worker_pid(Some(4242)).unwrap(), 4242);
        let pid = worker_pid(None).unwrap();
        assert_ne!(pid, std::process::id());
        assert_eq!(Some(pid), process_utils::parent_pid());
    }
}
