//! Worker-side half of the record protocol.

use std::sync::Arc;

use tracing::warn;

use crate::Result;
use crate::clock::Clock;
use crate::store::{SharedStore, WorkerRecord, fields, format_timestamp};

/// Used by a spawned worker process to report progress into its record.
pub struct WorkerHandle {
    store: Arc<dyn SharedStore>,
    clock: Arc<dyn Clock>,
    worker_id: String,
}

impl WorkerHandle {
    pub fn new(store: Arc<dyn SharedStore>, clock: Arc<dyn Clock>, worker_id: impl Into<String>) -> Self {
        Self {
            store,
            clock,
            worker_id: worker_id.into(),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Announce that the worker runs as `pid`.
    ///
    /// Returns `false` when the manager already gave up on this worker (the
    /// `allocated` field is gone); the record is then removed and the worker
    /// must exit without doing anything.
    pub async fn mark_started(&self, pid: u32) -> Result<bool> {
        let pid = pid.to_string();
        self.store
            .hset_many(&self.worker_id, &[(fields::STARTED, "1"), (fields::PID, pid.as_str())])
            .await?;

        if self.store.hget(&self.worker_id, fields::ALLOCATED).await?.is_none() {
            warn!(
                worker_id = %self.worker_id,
                kind = "orphan",
                "Manager gave up on worker {}, exiting",
                self.worker_id
            );
            self.store.delete(&self.worker_id).await?;
            return Ok(false);
        }
        Ok(true)
    }

    pub async fn refresh_checked(&self) -> Result<()> {
        self.store
            .hset(&self.worker_id, fields::CHECKED, &format_timestamp(self.clock.now()))
            .await
    }

    /// Whether the manager asked this worker to stop, or dropped its record.
    pub async fn is_cancel_requested(&self) -> Result<bool> {
        let record = WorkerRecord::from(self.store.hgetall(&self.worker_id).await?);
        Ok(record.fields.is_empty() || record.cancel_requested() || record.is_marked_deleted())
    }

    /// Write the terminal status; the manager finishes the task on its next sweep.
    pub async fn set_status(&self, status: &str) -> Result<()> {
        self.store.hset(&self.worker_id, fields::STATUS, status).await
    }

    pub async fn set_field(&self, field: &str, value: &str) -> Result<()> {
        self.store.hset(&self.worker_id, field, value).await
    }
}
