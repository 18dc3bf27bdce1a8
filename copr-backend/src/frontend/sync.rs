//! Periodic pull of ready work from the frontend.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ControlMessage, FrontendApi, ReadyTasks};
use crate::Result;
use crate::store::SharedStore;
use crate::task::QueueTask;

/// Control messages handled per poll.
const CONTROL_BATCH: usize = 100;

/// Destination of the tasks pulled by [`FrontendSync`].
#[async_trait]
pub trait TaskRouter: Send + Sync {
    /// Replace the queued work of every family that received tasks.
    async fn replace_tasks(&self, tasks: ReadyTasks) -> Result<()>;

    /// Cancel a task wherever it lives; returns whether a worker was running.
    async fn cancel(&self, task_id: &str) -> Result<bool>;

    /// Queue a known task again; returns whether it was found.
    async fn reschedule(&self, task_id: &str) -> Result<bool>;
}

/// What one [`FrontendSync::sync_once`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub builds: usize,
    pub actions: usize,
    pub new_tasks: usize,
    pub cancelled: usize,
    pub control_handled: usize,
    pub control_ignored: usize,
}

pub struct FrontendSync {
    frontend: Arc<dyn FrontendApi>,
    store: Arc<dyn SharedStore>,
    router: Arc<dyn TaskRouter>,
    control_channel: String,
    cursor: i64,
    last_ids: HashSet<String>,
    period: Duration,
}

impl FrontendSync {
    /// Create the sync; control messages published before this call are
    /// skipped.
    pub async fn new(
        frontend: Arc<dyn FrontendApi>,
        store: Arc<dyn SharedStore>,
        router: Arc<dyn TaskRouter>,
        control_channel: impl Into<String>,
        period: Duration,
    ) -> Result<Self> {
        let control_channel = control_channel.into();
        let cursor = store.last_message_id(&control_channel).await?;
        Ok(Self {
            frontend,
            store,
            router,
            control_channel,
            cursor,
            last_ids: HashSet::new(),
            period,
        })
    }

    /// One round: pull tasks, forward cancel requests, drain control messages.
    pub async fn sync_once(&mut self) -> Result<SyncReport> {
        let mut report = SyncReport::default();

        let tasks = self.frontend.ready_tasks().await?;
        report.builds = tasks.builds.len();
        report.actions = tasks.actions.len();

        let ids: HashSet<String> = tasks
            .builds
            .iter()
            .map(QueueTask::id)
            .chain(tasks.actions.iter().map(|a| format!("action-{}", a.id)))
            .collect();
        let mut new_ids: Vec<&String> = ids.difference(&self.last_ids).collect();
        report.new_tasks = new_ids.len();
        if !new_ids.is_empty() {
            new_ids.sort();
            info!("New tasks: {:?}", new_ids);
        }
        self.last_ids = ids;

        self.router.replace_tasks(tasks).await?;

        for task_id in self.frontend.cancel_requests().await? {
            let was_running = match self.router.cancel(&task_id).await {
                Ok(was_running) => was_running,
                Err(e) => {
                    warn!(task_id = %task_id, detail = %e, "Can not cancel task {}", task_id);
                    continue;
                }
            };
            self.frontend.report_canceled(&task_id, was_running).await?;
            report.cancelled += 1;
        }

        self.poll_control(&mut report).await?;
        Ok(report)
    }

    async fn poll_control(&mut self, report: &mut SyncReport) -> Result<()> {
        loop {
            let messages = self
                .store
                .poll_messages(&self.control_channel, self.cursor, CONTROL_BATCH)
                .await?;
            if messages.is_empty() {
                return Ok(());
            }

            for message in messages {
                self.cursor = message.id;
                let parsed = match ControlMessage::parse(&message.payload) {
                    Ok(parsed) => parsed,
                    Err(e) => {
                        warn!(
                            kind = "control_ignored",
                            detail = %e,
                            "Ignoring control message {}: {}",
                            message.id,
                            message.payload
                        );
                        report.control_ignored += 1;
                        continue;
                    }
                };

                let task_id = parsed.task_id().to_string();
                let handled = match parsed {
                    ControlMessage::Remove { .. } => self.router.cancel(&task_id).await,
                    ControlMessage::Reschedule { .. } => self.router.reschedule(&task_id).await,
                };
                match handled {
                    Ok(found) => {
                        debug!(task_id = %task_id, found, "Control message {} handled", message.id);
                        report.control_handled += 1;
                    }
                    Err(e) => warn!(
                        task_id = %task_id,
                        detail = %e,
                        "Control message {} failed",
                        message.id
                    ),
                }
            }
        }
    }

    /// Sync every `period` until `token` is cancelled. Failures are logged
    /// and retried on the next round; dispatchers keep draining their queues.
    pub async fn run(mut self, token: CancellationToken) {
        info!("Frontend sync started, period {:?}", self.period);
        loop {
            let started = tokio::time::Instant::now();
            match self.sync_once().await {
                Ok(report) => debug!(?report, "Frontend sync round done"),
                Err(e) if e.is_transient() => {
                    warn!(kind = "frontend_unavailable", detail = %e, "Frontend sync failed")
                }
                Err(e) => warn!(detail = %e, "Frontend sync failed"),
            }

            let remaining = self.period.saturating_sub(started.elapsed());
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(remaining) => {}
            }
        }
        info!("Frontend sync stopped");
    }
}
