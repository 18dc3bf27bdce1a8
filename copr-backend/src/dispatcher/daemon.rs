//! Wiring of the whole backend process.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::{DispatcherSet, FamilyDispatcher};
use crate::Result;
use crate::actions::{ActionWorkerBehavior, RepoPublisher};
use crate::builds::{BuildFamily, BuildWorkerBehavior, build_limits};
use crate::clock::{Clock, SystemClock};
use crate::config::BackendConfig;
use crate::createrepo::{BatchedCreaterepo, CommandCreaterepo};
use crate::frontend::{FrontendApi, FrontendSync, HttpFrontendClient, OutboxConfig, UpdateOutbox};
use crate::store::{SharedStore, SqliteStore};
use crate::worker::WorkerManager;

/// Environment variable telling spawned workers where the store lives.
pub const STORE_URL_ENV: &str = "COPR_BE_STORE_URL";

const OUTBOX_BUFFER: usize = 100;
const PRUNE_INTERVAL: Duration = Duration::from_secs(3600);

/// The backend daemon: three dispatchers, the frontend sync and the
/// update outbox sharing one store.
pub struct BackendDaemon {
    config: BackendConfig,
}

impl BackendDaemon {
    pub fn new(config: BackendConfig) -> Self {
        Self { config }
    }

    /// Run until `token` is cancelled, then flush pending updates.
    pub async fn run(self, token: CancellationToken) -> Result<()> {
        let config = self.config;
        let sqlite = Arc::new(SqliteStore::connect(&config.store.url).await?);
        let store: Arc<dyn SharedStore> = sqlite.clone();
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let frontend: Arc<dyn FrontendApi> = Arc::new(HttpFrontendClient::new(&config.frontend));

        let outbox = Arc::new(UpdateOutbox::new(
            OutboxConfig {
                max_buffer_size: OUTBOX_BUFFER,
                flush_interval: config.sleeptime(),
            },
            frontend.clone(),
        ));

        let batcher = Arc::new(BatchedCreaterepo::new(
            &config.createrepo,
            store.clone(),
            clock.clone(),
            Arc::new(CommandCreaterepo::new(&config.createrepo.command)),
        ));
        let publisher = Arc::new(RepoPublisher::new(
            frontend.clone(),
            batcher,
            config.destdir.clone(),
        ));

        let idle_sleep = config.idle_sleep();
        let store_url = config.store.url.clone();
        let mut srpm_manager = WorkerManager::new(
            config.workers.srpm.manager_config(idle_sleep),
            BuildWorkerBehavior::new(BuildFamily::Source, &config.workers.srpm.command, outbox.clone())
                .with_env(STORE_URL_ENV, store_url.clone()),
            store.clone(),
            clock.clone(),
        )
        .await?;
        let mut rpm_manager = WorkerManager::new(
            config.workers.rpm.manager_config(idle_sleep),
            BuildWorkerBehavior::new(BuildFamily::Rpm, &config.workers.rpm.command, outbox.clone())
                .with_env(STORE_URL_ENV, store_url.clone()),
            store.clone(),
            clock.clone(),
        )
        .await?;
        for limit in build_limits(&config.limits) {
            srpm_manager = srpm_manager.with_limit(limit);
        }
        for limit in build_limits(&config.limits) {
            rpm_manager = rpm_manager.with_limit(limit);
        }
        let publishes = TaskTracker::new();
        let action_manager = WorkerManager::new(
            config.workers.action.manager_config(idle_sleep),
            ActionWorkerBehavior::new(&config.workers.action.command, outbox.clone())
                .with_publisher(publisher, publishes.clone())
                .with_env(STORE_URL_ENV, store_url),
            store.clone(),
            clock.clone(),
        )
        .await?;

        let sleeptime = config.sleeptime();
        let (srpm, srpm_handle) = FamilyDispatcher::new("srpm", srpm_manager, sleeptime);
        let (rpm, rpm_handle) = FamilyDispatcher::new("rpm", rpm_manager, sleeptime);
        let (action, action_handle) = FamilyDispatcher::new("action", action_manager, sleeptime);

        let router = Arc::new(DispatcherSet {
            srpm: srpm_handle,
            rpm: rpm_handle,
            action: action_handle,
        });
        let sync = FrontendSync::new(
            frontend,
            store,
            router,
            config.store.control_channel.clone(),
            sleeptime,
        )
        .await?;

        let tasks: Vec<(&str, JoinHandle<()>)> = vec![
            ("srpm", tokio::spawn(srpm.run(token.clone()))),
            ("rpm", tokio::spawn(rpm.run(token.clone()))),
            ("action", tokio::spawn(action.run(token.clone()))),
            ("sync", tokio::spawn(sync.run(token.clone()))),
            (
                "prune",
                tokio::spawn(prune_messages(
                    sqlite,
                    Duration::from_secs(config.store.message_retention_secs),
                    token.clone(),
                )),
            ),
        ];
        info!("Backend started, frontend {}", config.frontend.base_url);

        token.cancelled().await;
        info!("Stopping backend");
        for (name, task) in tasks {
            if let Err(e) = task.await {
                error!("{} task failed: {}", name, e);
            }
        }

        publishes.close();
        if !publishes.is_empty() {
            info!("Waiting for {} repository publishes", publishes.len());
        }
        publishes.wait().await;

        match outbox.shutdown().await {
            Ok(0) => {}
            Ok(pending) => warn!("{} updates could not be delivered", pending),
            Err(e) => warn!("Final update flush failed: {}", e),
        }
        info!("Backend stopped");
        Ok(())
    }
}

async fn prune_messages(store: Arc<SqliteStore>, max_age: Duration, token: CancellationToken) {
    loop {
        match store.prune_messages(max_age).await {
            Ok(0) => {}
            Ok(count) => debug!("Pruned {} control messages", count),
            Err(e) => warn!("Pruning control messages failed: {}", e),
        }
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(PRUNE_INTERVAL) => {}
        }
    }
}

/// Resolves on Ctrl+C or, on unix, SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to install Ctrl+C handler: {e}");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received; starting graceful shutdown");
}
