//! The action worker family: non-build work such as deleting, forking or
//! regenerating repositories.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use crate::createrepo::{BatchTask, BatchedCreaterepo, PublishOutcome};
use crate::frontend::{ActionUpdate, FrontendApi, UpdateItem, UpdateOutbox};
use crate::store::WorkerRecord;
use crate::task::{ActionResult, ActionTask};
use crate::worker::WorkerBehavior;
use crate::{Error, Result};

/// Publishes repositories changed by successful actions.
pub struct RepoPublisher {
    frontend: Arc<dyn FrontendApi>,
    batcher: Arc<BatchedCreaterepo>,
    destdir: PathBuf,
}

impl RepoPublisher {
    pub fn new(
        frontend: Arc<dyn FrontendApi>,
        batcher: Arc<BatchedCreaterepo>,
        destdir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            frontend,
            batcher,
            destdir: destdir.into(),
        }
    }

    /// Regenerate every repository `action_id` touched. Returns the number
    /// of directories published.
    pub async fn publish_action(&self, action_id: i64) -> Result<usize> {
        let action = self.frontend.get_action(action_id).await?;
        if !action.action_type.is_some_and(|t| t.publishes_repo()) {
            return Ok(0);
        }

        let targets = action.publish_targets(&self.destdir)?;
        let mut published = 0;
        for target in targets {
            let task = BatchTask::full(target.devel, target.appstream);
            match self.batcher.publish(&target.dir, &task).await? {
                PublishOutcome::Executed { merged } => {
                    debug!("Published {} ({} requests)", target.dir.display(), merged)
                }
                PublishOutcome::Absorbed => {
                    debug!("Publish of {} done by a peer", target.dir.display())
                }
            }
            published += 1;
        }
        Ok(published)
    }
}

/// Starts one action process per action and reports its result.
pub struct ActionWorkerBehavior {
    command: Vec<String>,
    envs: Vec<(String, String)>,
    outbox: Arc<UpdateOutbox>,
    publisher: Option<Arc<RepoPublisher>>,
    publishes: TaskTracker,
}

impl ActionWorkerBehavior {
    pub fn new(command: &str, outbox: Arc<UpdateOutbox>) -> Self {
        Self {
            command: command.split_whitespace().map(str::to_string).collect(),
            envs: Vec::new(),
            outbox,
            publisher: None,
            publishes: TaskTracker::new(),
        }
    }

    /// Publish repositories after successful actions. The publish runs in
    /// the background on `tracker`, which the owner drains on shutdown.
    pub fn with_publisher(mut self, publisher: Arc<RepoPublisher>, tracker: TaskTracker) -> Self {
        self.publisher = Some(publisher);
        self.publishes = tracker;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn command_line(&self, worker_id: &str, task: &ActionTask) -> Vec<String> {
        let mut argv = self.command.clone();
        argv.extend([
            "--daemon".to_string(),
            "--task-id".to_string(),
            task.id.to_string(),
            "--worker-id".to_string(),
            worker_id.to_string(),
        ]);
        argv
    }
}

/// Worker prefixes never contain ':', so the first one ends the prefix.
fn action_id(worker_id: &str) -> Result<i64> {
    worker_id
        .split_once(':')
        .and_then(|(_, id)| id.parse().ok())
        .ok_or_else(|| Error::validation(format!("invalid action worker id '{}'", worker_id)))
}

#[async_trait]
impl WorkerBehavior<ActionTask> for ActionWorkerBehavior {
    async fn start_task(&self, worker_id: &str, task: &ActionTask) -> Result<()> {
        let argv = self.command_line(worker_id, task);
        let pid = process_utils::spawn_detached(&argv, &self.envs)
            .map_err(|e| Error::start_failed(worker_id, e))?;
        debug!(worker_id = %worker_id, pid, "Action worker spawned");
        Ok(())
    }

    async fn finish_task(&self, worker_id: &str, record: &WorkerRecord) -> Result<()> {
        let id = action_id(worker_id)?;
        let result = ActionResult::from_status(record.status().unwrap_or_default());

        self.outbox
            .deliver(UpdateItem::Action(ActionUpdate {
                id,
                result: result.code(),
            }))
            .await?;

        if result == ActionResult::Success
            && let Some(publisher) = self.publisher.clone()
        {
            self.publishes.spawn(async move {
                match publisher.publish_action(id).await {
                    Ok(0) => {}
                    Ok(count) => info!("Action {} published {} repositories", id, count),
                    Err(e) => error!(
                        task_id = id,
                        kind = "publish_failed",
                        detail = %e,
                        "Repository publish after action {} failed",
                        id
                    ),
                }
            });
        }
        Ok(())
    }
}
