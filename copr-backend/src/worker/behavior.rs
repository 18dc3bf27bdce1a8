use async_trait::async_trait;

use crate::Result;
use crate::store::WorkerRecord;
use crate::task::QueueTask;

/// Family-specific hooks of a [`WorkerManager`](super::WorkerManager).
///
/// The manager drives the state machine; a behavior only knows how to launch a
/// worker for a task, how to read its record and whom to tell about the result.
#[async_trait]
pub trait WorkerBehavior<T: QueueTask>: Send + Sync {
    /// Launch a detached background process for `task`.
    ///
    /// The child must write `started` into the `worker_id` record on its own.
    /// This must not wait for the child to finish.
    async fn start_task(&self, worker_id: &str, task: &T) -> Result<()>;

    /// Report the outcome of a finished worker.
    ///
    /// Called again if the manager restarts before it removed the record, so
    /// it must be idempotent. An error keeps the record for the next sweep.
    async fn finish_task(&self, worker_id: &str, record: &WorkerRecord) -> Result<()>;

    fn has_worker_started(&self, _worker_id: &str, record: &WorkerRecord) -> bool {
        record.is_started()
    }

    fn has_worker_ended(&self, _worker_id: &str, record: &WorkerRecord) -> bool {
        record.status().is_some()
    }

    /// Out-of-band liveness probe. Defaults to checking the recorded `PID`.
    async fn is_worker_alive(&self, _worker_id: &str, record: &WorkerRecord) -> bool {
        record.pid().is_some_and(process_utils::pid_alive)
    }
}
