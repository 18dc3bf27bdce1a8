//! Regenerate repository metadata, merged with concurrent requests for the
//! same directory.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use copr_backend::clock::SystemClock;
use copr_backend::config::BackendConfig;
use copr_backend::createrepo::{BatchTask, BatchedCreaterepo, CommandCreaterepo, PublishOutcome};
use copr_backend::logging::{LoggingConfig, init_logging};
use copr_backend::store::SqliteStore;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short, long, env = "COPR_BE_CONFIG")]
    config: Option<PathBuf>,

    /// Regenerate the whole repository
    #[arg(long)]
    full: bool,

    /// Work on the devel repository
    #[arg(long)]
    devel: bool,

    /// Skip appstream metadata
    #[arg(long)]
    no_appstream: bool,

    /// Build subdirectory to add
    #[arg(long)]
    add: Vec<String>,

    /// Build subdirectory to delete
    #[arg(long)]
    delete: Vec<String>,

    /// Package file to drop from the metadata
    #[arg(long)]
    rpms_to_remove: Vec<String>,

    /// Repository directory
    dir: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = BackendConfig::load(args.config.as_deref()).context("Failed to load configuration")?;

    // Console only; the daemon owns the log files.
    let (_logging, _guard) = init_logging(&LoggingConfig {
        log_dir: None,
        ..config.logging.clone()
    })?;

    let store = SqliteStore::connect(&config.store.url)
        .await
        .with_context(|| format!("Failed to open store {}", config.store.url))?;
    let batcher = BatchedCreaterepo::new(
        &config.createrepo,
        Arc::new(store),
        Arc::new(SystemClock),
        Arc::new(CommandCreaterepo::new(&config.createrepo.command)),
    );

    let task = BatchTask {
        full: args.full,
        add: args.add,
        delete: args.delete,
        rpms_to_remove: args.rpms_to_remove,
        appstream: !args.no_appstream,
        devel: args.devel,
    };

    match batcher.publish(&args.dir, &task).await? {
        PublishOutcome::Executed { merged } => {
            info!("{} done, {} requests merged", args.dir.display(), merged)
        }
        PublishOutcome::Absorbed => info!("{} done by another request", args.dir.display()),
    }
    Ok(())
}
