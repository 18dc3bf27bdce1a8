//! The per-family control loop.
//!
//! One iteration of [`WorkerManager::run`]:
//! 1. reap: classify every worker record of this family and clean up
//!    finished, abandoned, stillborn and dead workers;
//! 2. throttle: stop dispatching while `max_workers` records are alive;
//! 3. dispatch: pop one task, write its `allocated` record, start its worker.
//!
//! The manager never waits for a worker process; all it knows about a worker
//! comes from the shared store and the behavior's liveness probe.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::behavior::WorkerBehavior;
use super::limits::WorkerLimit;
use crate::clock::{Clock, Timestamp};
use crate::queue::JobQueue;
use crate::store::{SharedStore, WorkerRecord, escape_glob, fields, format_timestamp};
use crate::task::QueueTask;
use crate::{Error, Result};

/// Static parameters of one worker family.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Namespace of the worker records, unique per family.
    pub worker_prefix: String,
    /// Maximum number of concurrently alive workers.
    pub max_workers: usize,
    /// Seconds a worker has to write `started`.
    pub worker_timeout_start: f64,
    /// Seconds between liveness probes of a started worker.
    pub worker_timeout_deadcheck: f64,
    /// Pause of the loop when there is nothing to dispatch.
    pub idle_sleep: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            worker_prefix: "worker".to_string(),
            max_workers: 8,
            worker_timeout_start: 30.0,
            worker_timeout_deadcheck: 60.0,
            idle_sleep: Duration::from_secs(1),
        }
    }
}

/// What happened during one [`WorkerManager::run`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub cycles: usize,
    pub started: usize,
    pub start_failed: usize,
    pub finished: usize,
    pub abandoned: usize,
    pub stillborn: usize,
    pub dead: usize,
    pub orphaned: usize,
    pub skipped_by_limit: usize,
    pub store_errors: usize,
}

/// Drains a priority queue into background workers of one family.
pub struct WorkerManager<T: QueueTask, B: WorkerBehavior<T>> {
    config: ManagerConfig,
    behavior: B,
    store: Arc<dyn SharedStore>,
    clock: Arc<dyn Clock>,
    queue: JobQueue<T>,
    limits: Vec<Box<dyn WorkerLimit<T>>>,
    /// Worker ids believed alive, with their task when it is known.
    tracked: HashMap<String, Option<T>>,
}

impl<T: QueueTask, B: WorkerBehavior<T>> WorkerManager<T, B> {
    /// Create a manager and adopt the workers a previous process left behind.
    pub async fn new(
        config: ManagerConfig,
        behavior: B,
        store: Arc<dyn SharedStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        if config.worker_prefix.is_empty() || config.worker_prefix.contains(':') {
            return Err(Error::config(format!(
                "invalid worker prefix '{}'",
                config.worker_prefix
            )));
        }

        let mut manager = Self {
            config,
            behavior,
            store,
            clock,
            queue: JobQueue::new(),
            limits: Vec::new(),
            tracked: HashMap::new(),
        };

        for worker_id in manager.worker_ids().await? {
            manager.tracked.insert(worker_id, None);
        }
        if !manager.tracked.is_empty() {
            info!(
                "Adopted {} {} workers from the store",
                manager.tracked.len(),
                manager.config.worker_prefix
            );
        }
        Ok(manager)
    }

    /// Add a concurrency limit checked at dispatch time.
    pub fn with_limit(mut self, limit: Box<dyn WorkerLimit<T>>) -> Self {
        self.limits.push(limit);
        self
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn behavior(&self) -> &B {
        &self.behavior
    }

    pub fn worker_prefix(&self) -> &str {
        &self.config.worker_prefix
    }

    pub fn queue(&self) -> &JobQueue<T> {
        &self.queue
    }

    pub fn queue_mut(&mut self) -> &mut JobQueue<T> {
        &mut self.queue
    }

    /// Number of workers considered alive after the last sweep.
    pub fn worker_count(&self) -> usize {
        self.tracked.len()
    }

    /// Last known body of `task_id`, queued or running.
    pub fn task(&self, task_id: &str) -> Option<&T> {
        self.queue.get(task_id).or_else(|| {
            self.tracked
                .get(&self.get_worker_id(task_id))
                .and_then(Option::as_ref)
        })
    }

    /// Store key of the worker processing `task_id`.
    pub fn get_worker_id(&self, task_id: &str) -> String {
        format!("{}:{}", self.config.worker_prefix, task_id)
    }

    /// Inverse of [`Self::get_worker_id`]; `None` for foreign ids.
    pub fn get_task_id_from_worker_id<'a>(&self, worker_id: &'a str) -> Option<&'a str> {
        worker_id
            .strip_prefix(self.config.worker_prefix.as_str())?
            .strip_prefix(':')
    }

    /// Keys of all worker records of this family.
    pub async fn worker_ids(&self) -> Result<Vec<String>> {
        let pattern = format!("{}:*", escape_glob(&self.config.worker_prefix));
        self.store.keys(&pattern).await
    }

    /// Queue `task` unless a worker already processes it.
    ///
    /// Returns `false` when the task was skipped. A skipped task is still
    /// accounted in the limits, since its worker keeps running.
    pub async fn add_task(&mut self, task: T) -> Result<bool> {
        let task_id = task.id();
        let worker_id = self.get_worker_id(&task_id);

        if self.tracked.contains_key(&worker_id) || self.store.exists(&worker_id).await? {
            for limit in &mut self.limits {
                limit.worker_added(&worker_id, &task);
            }
            self.tracked.insert(worker_id.clone(), Some(task));
            debug!(
                worker_id = %worker_id,
                task_id = %task_id,
                kind = "duplicate",
                "Task {} already has a worker process",
                task_id
            );
            return Ok(false);
        }

        let priority = task.priority();
        debug!("Adding task {} to queue, priority {}", task_id, priority);
        self.queue.add(task, priority);
        Ok(true)
    }

    /// Drop all queued tasks and rebuild the limit statistics from the
    /// running workers. Workers are not affected.
    pub fn clean_tasks(&mut self) {
        self.queue = JobQueue::new();
        for limit in &mut self.limits {
            limit.clear();
            for (worker_id, task) in &self.tracked {
                if let Some(task) = task {
                    limit.worker_added(worker_id, task);
                }
            }
        }
    }

    /// Cancel `task_id`: drop it from the queue and ask its worker to stop.
    ///
    /// Returns whether a worker was running.
    pub async fn cancel_task_id(&mut self, task_id: &str) -> Result<bool> {
        if self.queue.remove_id(task_id).is_ok() {
            info!("Cancel request, task {} dropped from queue", task_id);
        }

        let worker_id = self.get_worker_id(task_id);
        if !self.store.exists(&worker_id).await? {
            info!("Cancel request, worker {} is not running", worker_id);
            return Ok(false);
        }

        info!("Cancel request, worker {} requested to cancel", worker_id);
        self.store
            .hset_many(
                &worker_id,
                &[(fields::CANCEL_REQUEST, "1"), (fields::DELETE, "1")],
            )
            .await?;
        Ok(true)
    }

    /// Drive the control loop.
    ///
    /// Returns when `deadline` elapsed, or earlier once the queue is empty and
    /// no worker remains.
    pub async fn run(&mut self, deadline: Option<Duration>) -> Result<RunSummary> {
        let start = self.clock.now();
        let mut summary = RunSummary::default();
        debug!("{} run() start at {}", self.config.worker_prefix, start);

        loop {
            let now = self.clock.now();
            if let Some(deadline) = deadline
                && now - start >= deadline.as_secs_f64()
            {
                break;
            }
            summary.cycles += 1;

            if let Err(err) = self.reap(now, &mut summary).await {
                if !err.is_transient() {
                    return Err(err);
                }
                summary.store_errors += 1;
                warn!(
                    kind = "store_unavailable",
                    detail = %err,
                    "{}: skipping cycle, store unavailable",
                    self.config.worker_prefix
                );
                self.clock.sleep(self.config.idle_sleep).await;
                continue;
            }

            let worker_count = self.tracked.len();
            if worker_count >= self.config.max_workers {
                debug!("Worker count on a limit {}", worker_count);
                self.clock.sleep(self.config.idle_sleep).await;
                continue;
            }

            let task = match self.queue.pop() {
                Ok(task) => task,
                Err(Error::QueueEmpty) => {
                    if worker_count == 0 {
                        break;
                    }
                    debug!("No more tasks, waiting for {} workers", worker_count);
                    self.clock.sleep(self.config.idle_sleep).await;
                    continue;
                }
                Err(err) => return Err(err),
            };

            if let Some(limit) = self.limits.iter().find(|limit| !limit.check(&task)) {
                debug!("Task '{}' skipped, limit info: {}", task.id(), limit.info());
                summary.skipped_by_limit += 1;
                continue;
            }

            if let Err(err) = self.start_worker(task, now, &mut summary).await {
                if !err.is_transient() {
                    return Err(err);
                }
                summary.store_errors += 1;
                self.clock.sleep(self.config.idle_sleep).await;
            }
        }

        debug!(
            "{} run() stop at {}: {:?}",
            self.config.worker_prefix,
            self.clock.now(),
            summary
        );
        Ok(summary)
    }

    async fn start_worker(
        &mut self,
        task: T,
        now: Timestamp,
        summary: &mut RunSummary,
    ) -> Result<()> {
        let task_id = task.id();
        let worker_id = self.get_worker_id(&task_id);

        let allocated = format_timestamp(now);
        let sandbox = task.sandbox();
        let mut record: Vec<(&str, &str)> = vec![(fields::ALLOCATED, allocated.as_str())];
        if let Some(sandbox) = sandbox.as_deref() {
            record.push((fields::SANDBOX, sandbox));
        }
        self.store.hset_many(&worker_id, &record).await?;

        info!(
            "Starting worker {}, task.priority={}",
            worker_id,
            task.priority()
        );

        if let Err(err) = self.behavior.start_task(&worker_id, &task).await {
            summary.start_failed += 1;
            error!(
                worker_id = %worker_id,
                task_id = %task_id,
                kind = "start_failed",
                detail = %err,
                "Failed to start worker {}",
                worker_id
            );
            // Nothing was spawned, so nobody will ever write into the record.
            if let Err(err) = self.store.delete(&worker_id).await {
                warn!(
                    worker_id = %worker_id,
                    detail = %err,
                    "Leaving record of failed worker for the start timeout"
                );
                self.track(worker_id, task);
            }
            return Ok(());
        }

        summary.started += 1;
        self.track(worker_id, task);
        Ok(())
    }

    fn track(&mut self, worker_id: String, task: T) {
        for limit in &mut self.limits {
            limit.worker_added(&worker_id, &task);
        }
        self.tracked.insert(worker_id, Some(task));
    }

    async fn delete_worker(&mut self, worker_id: &str) -> Result<()> {
        self.store.delete(worker_id).await?;
        self.untrack(worker_id);
        Ok(())
    }

    fn untrack(&mut self, worker_id: &str) {
        self.tracked.remove(worker_id);
        for limit in &mut self.limits {
            limit.worker_removed(worker_id);
        }
    }

    /// Classify every worker record and clean up the ones that are done.
    async fn reap(&mut self, now: Timestamp, summary: &mut RunSummary) -> Result<()> {
        let worker_ids = self.worker_ids().await?;

        // Records removed behind our back (e.g. by a worker giving up).
        let gone: Vec<String> = self
            .tracked
            .keys()
            .filter(|id| !worker_ids.contains(*id))
            .cloned()
            .collect();
        for worker_id in gone {
            self.untrack(&worker_id);
        }

        for worker_id in worker_ids {
            let record = WorkerRecord::from(self.store.hgetall(&worker_id).await?);
            if record.fields.is_empty() {
                self.untrack(&worker_id);
                continue;
            }
            self.tracked.entry(worker_id.clone()).or_insert(None);
            let task_id = self
                .get_task_id_from_worker_id(&worker_id)
                .unwrap_or_default()
                .to_string();

            let Some(allocated) = record.allocated() else {
                info!(
                    worker_id = %worker_id,
                    task_id = %task_id,
                    kind = "orphan",
                    "Missing 'allocated' flag for worker {}",
                    worker_id
                );
                summary.orphaned += 1;
                self.delete_worker(&worker_id).await?;
                continue;
            };

            if self.behavior.has_worker_ended(&worker_id, &record) {
                info!("Finished worker {}", worker_id);
                match self.behavior.finish_task(&worker_id, &record).await {
                    Ok(()) => {
                        summary.finished += 1;
                        self.delete_worker(&worker_id).await?;
                    }
                    Err(err) => warn!(
                        worker_id = %worker_id,
                        task_id = %task_id,
                        kind = "finish_failed",
                        detail = %err,
                        "Can not finish worker {}, retrying on next sweep",
                        worker_id
                    ),
                }
                continue;
            }

            if record.is_marked_deleted() {
                warn!(
                    worker_id = %worker_id,
                    task_id = %task_id,
                    kind = "abandoned",
                    "Worker {} deleted",
                    worker_id
                );
                summary.abandoned += 1;
                self.delete_worker(&worker_id).await?;
                continue;
            }

            if !self.behavior.has_worker_started(&worker_id, &record) {
                if now - allocated > self.config.worker_timeout_start {
                    let err = Error::WorkerStillborn(worker_id.clone());
                    error!(
                        worker_id = %worker_id,
                        task_id = %task_id,
                        kind = "stillborn",
                        detail = %err,
                        "Worker {} failed to start",
                        worker_id
                    );
                    summary.stillborn += 1;
                    self.delete_worker(&worker_id).await?;
                }
                continue;
            }

            let checked = record.checked().unwrap_or(allocated);
            if now - checked > self.config.worker_timeout_deadcheck {
                debug!("Checking worker {}", worker_id);
                self.store
                    .hset(&worker_id, fields::CHECKED, &format_timestamp(now))
                    .await?;
                if self.behavior.is_worker_alive(&worker_id, &record).await {
                    continue;
                }
                let err = Error::WorkerDead(worker_id.clone());
                error!(
                    worker_id = %worker_id,
                    task_id = %task_id,
                    kind = "dead",
                    detail = %err,
                    "Dead worker {}",
                    worker_id
                );
                summary.dead += 1;
                // Reaped on the next sweep; the worker may still finish meanwhile.
                self.store.hset(&worker_id, fields::DELETE, "1").await?;
            }
        }
        Ok(())
    }
}
