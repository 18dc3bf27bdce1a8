//! One long-running task per worker family.
//!
//! A [`FamilyDispatcher`] owns its [`WorkerManager`] and is the only code
//! touching it. Everyone else talks to it through a [`DispatcherHandle`];
//! commands are applied between two manager runs.

mod daemon;

pub use daemon::{BackendDaemon, shutdown_signal};

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::builds::{BuildFamily, spread_sandboxes};
use crate::frontend::{ReadyTasks, TaskRouter};
use crate::task::{ActionTask, BuildTask, QueueTask};
use crate::worker::{WorkerBehavior, WorkerManager};
use crate::{Error, Result};

const COMMAND_CAPACITY: usize = 64;

/// Message from the sync to a dispatcher.
#[derive(Debug)]
pub enum DispatchCommand<T> {
    /// Forget queued tasks and queue these instead.
    ReplaceTasks(Vec<T>),
    Cancel {
        task_id: String,
        reply: oneshot::Sender<Result<bool>>,
    },
    Reschedule {
        task_id: String,
        reply: oneshot::Sender<Result<bool>>,
    },
}

/// Sending side of a [`FamilyDispatcher`].
#[derive(Debug)]
pub struct DispatcherHandle<T> {
    name: String,
    sender: mpsc::Sender<DispatchCommand<T>>,
}

impl<T> Clone for DispatcherHandle<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            sender: self.sender.clone(),
        }
    }
}

impl<T: QueueTask> DispatcherHandle<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, command: DispatchCommand<T>) -> Result<()> {
        self.sender
            .send(command)
            .await
            .map_err(|_| Error::Other(format!("{} dispatcher stopped", self.name)))
    }

    pub async fn replace_tasks(&self, tasks: Vec<T>) -> Result<()> {
        self.send(DispatchCommand::ReplaceTasks(tasks)).await
    }

    /// Returns whether a worker was running.
    pub async fn cancel(&self, task_id: &str) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.send(DispatchCommand::Cancel {
            task_id: task_id.to_string(),
            reply,
        })
        .await?;
        rx.await
            .map_err(|_| Error::Other(format!("{} dispatcher dropped the reply", self.name)))?
    }

    /// Returns whether the task was known.
    pub async fn reschedule(&self, task_id: &str) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.send(DispatchCommand::Reschedule {
            task_id: task_id.to_string(),
            reply,
        })
        .await?;
        rx.await
            .map_err(|_| Error::Other(format!("{} dispatcher dropped the reply", self.name)))?
    }
}

/// Drives one [`WorkerManager`] in a loop.
pub struct FamilyDispatcher<T: QueueTask, B: WorkerBehavior<T>> {
    name: String,
    manager: WorkerManager<T, B>,
    receiver: mpsc::Receiver<DispatchCommand<T>>,
    sleeptime: Duration,
}

impl<T: QueueTask, B: WorkerBehavior<T>> FamilyDispatcher<T, B> {
    pub fn new(
        name: impl Into<String>,
        manager: WorkerManager<T, B>,
        sleeptime: Duration,
    ) -> (Self, DispatcherHandle<T>) {
        let name = name.into();
        let (sender, receiver) = mpsc::channel(COMMAND_CAPACITY);
        let dispatcher = Self {
            name: name.clone(),
            manager,
            receiver,
            sleeptime,
        };
        (dispatcher, DispatcherHandle { name, sender })
    }

    pub fn manager(&self) -> &WorkerManager<T, B> {
        &self.manager
    }

    pub async fn apply(&mut self, command: DispatchCommand<T>) {
        match command {
            DispatchCommand::ReplaceTasks(tasks) => {
                self.manager.clean_tasks();
                let count = tasks.len();
                let mut queued = 0;
                for task in tasks {
                    let task_id = task.id();
                    match self.manager.add_task(task).await {
                        Ok(true) => queued += 1,
                        Ok(false) => {}
                        Err(e) => warn!(
                            task_id = %task_id,
                            detail = %e,
                            "{}: can not queue task",
                            self.name
                        ),
                    }
                }
                debug!("{}: {} of {} tasks queued", self.name, queued, count);
            }
            DispatchCommand::Cancel { task_id, reply } => {
                let result = self.manager.cancel_task_id(&task_id).await;
                let _ = reply.send(result);
            }
            DispatchCommand::Reschedule { task_id, reply } => {
                let result = match self.manager.task(&task_id).cloned() {
                    Some(task) => self.manager.add_task(task).await.map(|_| true),
                    None => Ok(false),
                };
                let _ = reply.send(result);
            }
        }
    }

    fn drain_commands(&mut self) -> Vec<DispatchCommand<T>> {
        let mut commands = Vec::new();
        while let Ok(command) = self.receiver.try_recv() {
            commands.push(command);
        }
        commands
    }

    /// Run until `token` is cancelled or every handle is dropped.
    pub async fn run(mut self, token: CancellationToken) {
        info!(
            "{} dispatcher started, max {} workers",
            self.name,
            self.manager.config().max_workers
        );

        loop {
            for command in self.drain_commands() {
                self.apply(command).await;
            }

            let started = tokio::time::Instant::now();
            match self.manager.run(Some(self.sleeptime)).await {
                Ok(summary) => debug!(?summary, "{} run finished", self.name),
                Err(e) => error!(detail = %e, "{} run failed", self.name),
            }

            let remaining = self.sleeptime.saturating_sub(started.elapsed());
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                command = self.receiver.recv() => match command {
                    Some(command) => self.apply(command).await,
                    None => break,
                },
                _ = tokio::time::sleep(remaining) => {}
            }
        }

        info!("{} dispatcher stopped", self.name);
    }
}

/// The three dispatchers of the backend, as seen by the frontend sync.
#[derive(Clone)]
pub struct DispatcherSet {
    pub srpm: DispatcherHandle<BuildTask>,
    pub rpm: DispatcherHandle<BuildTask>,
    pub action: DispatcherHandle<ActionTask>,
}

impl DispatcherSet {
    /// Build tasks are cancelled and rescheduled by task id; numeric ids
    /// belong to source builds.
    fn build_dispatcher(&self, task_id: &str) -> &DispatcherHandle<BuildTask> {
        if task_id.parse::<i64>().is_ok() {
            &self.srpm
        } else {
            &self.rpm
        }
    }
}

#[async_trait]
impl TaskRouter for DispatcherSet {
    async fn replace_tasks(&self, tasks: ReadyTasks) -> Result<()> {
        let (mut srpm, mut rpm): (Vec<BuildTask>, Vec<BuildTask>) = tasks
            .builds
            .into_iter()
            .partition(|task| BuildFamily::of(task) == BuildFamily::Source);
        spread_sandboxes(&mut srpm);
        spread_sandboxes(&mut rpm);

        // An empty answer keeps the current queue.
        if !srpm.is_empty() {
            self.srpm.replace_tasks(srpm).await?;
        }
        if !rpm.is_empty() {
            self.rpm.replace_tasks(rpm).await?;
        }
        if !tasks.actions.is_empty() {
            self.action.replace_tasks(tasks.actions).await?;
        }
        Ok(())
    }

    async fn cancel(&self, task_id: &str) -> Result<bool> {
        self.build_dispatcher(task_id).cancel(task_id).await
    }

    async fn reschedule(&self, task_id: &str) -> Result<bool> {
        self.build_dispatcher(task_id).reschedule(task_id).await
    }
}
