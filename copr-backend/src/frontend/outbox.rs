//! Delivery of finished results to the frontend.
//!
//! Every result is pushed right away and its caller learns whether it
//! arrived. Items of a failed flush stay buffered and are retried together
//! with newer results, at the latest after one flush interval. Items the
//! frontend rejects for good are dropped.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::interval;
use tracing::{debug, error, warn};

use super::{FrontendApi, UpdateItem, UpdatePayload};
use crate::{Error, Result};

/// Configuration for the outbox.
#[derive(Debug, Clone)]
pub struct OutboxConfig {
    /// Expected number of pending items; sizes the buffer and the channel.
    pub max_buffer_size: usize,
    /// Retry interval of pending items.
    pub flush_interval: Duration,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            max_buffer_size: 100,
            flush_interval: Duration::from_secs(5),
        }
    }
}

enum OutboxCommand {
    /// Queue and flush; replies whether the item is still pending.
    Deliver(UpdateItem, oneshot::Sender<bool>),
    /// Flush now; replies with the number of items still pending.
    Flush(oneshot::Sender<usize>),
    Shutdown(oneshot::Sender<usize>),
}

/// Queue of frontend updates drained by a background task.
pub struct UpdateOutbox {
    sender: mpsc::Sender<OutboxCommand>,
    _handle: tokio::task::JoinHandle<()>,
}

impl UpdateOutbox {
    pub fn new(config: OutboxConfig, frontend: Arc<dyn FrontendApi>) -> Self {
        let (sender, receiver) = mpsc::channel(config.max_buffer_size.max(1) * 2);
        let handle = tokio::spawn(run_flush_loop(receiver, config, frontend));
        Self {
            sender,
            _handle: handle,
        }
    }

    /// Queue one update and flush right away. Fails when the update is still
    /// pending afterwards; it then stays buffered for a later flush. A later
    /// update of the same object replaces an earlier one still pending.
    pub async fn deliver(&self, item: UpdateItem) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(OutboxCommand::Deliver(item, tx))
            .await
            .map_err(|_| Error::Other("Update outbox channel closed".to_string()))?;
        let pending = rx
            .await
            .map_err(|_| Error::Other("Update outbox stopped".to_string()))?;
        if pending {
            return Err(Error::frontend("update not delivered yet"));
        }
        Ok(())
    }

    /// Flush immediately; returns how many items are still pending afterwards.
    pub async fn flush(&self) -> Result<usize> {
        self.request(OutboxCommand::Flush).await
    }

    /// Final flush; the outbox accepts no more items afterwards.
    pub async fn shutdown(&self) -> Result<usize> {
        self.request(OutboxCommand::Shutdown).await
    }

    async fn request(
        &self,
        command: impl FnOnce(oneshot::Sender<usize>) -> OutboxCommand,
    ) -> Result<usize> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(command(tx))
            .await
            .map_err(|_| Error::Other("Update outbox channel closed".to_string()))?;
        rx.await
            .map_err(|_| Error::Other("Update outbox stopped".to_string()))
    }
}

fn push(buffer: &mut Vec<UpdateItem>, item: UpdateItem) {
    let identity = item.identity();
    match buffer.iter_mut().find(|queued| queued.identity() == identity) {
        Some(queued) => *queued = item,
        None => buffer.push(item),
    }
}

/// Send the buffer; on failure the items stay for the next attempt.
///
/// A permanent rejection of a multi-item payload is retried item by item so
/// one bad update can not hold back the others.
async fn flush(buffer: &mut Vec<UpdateItem>, frontend: &dyn FrontendApi, reason: &str) {
    if buffer.is_empty() {
        return;
    }
    let payload = UpdatePayload::from_items(buffer);
    match frontend.update(&payload).await {
        Ok(response) => {
            debug!(
                builds = response.updated_builds_ids.len(),
                actions = response.updated_actions_ids.len(),
                "{} flush delivered {} updates",
                reason,
                payload.len()
            );
            buffer.clear();
        }
        Err(e) if e.is_transient() => {
            warn!("{} flush of {} updates failed, keeping them: {}", reason, buffer.len(), e);
        }
        Err(e) if buffer.len() == 1 => {
            error!(item = ?buffer[0], "Frontend rejected the update, dropping it: {}", e);
            buffer.clear();
        }
        Err(e) => {
            warn!("{} flush of {} updates rejected, sending one by one: {}", reason, buffer.len(), e);
            for item in std::mem::take(buffer) {
                let single = UpdatePayload::from_items(std::slice::from_ref(&item));
                match frontend.update(&single).await {
                    Ok(_) => {}
                    Err(e) if e.is_transient() => buffer.push(item),
                    Err(e) => {
                        error!(item = ?item, "Frontend rejected the update, dropping it: {}", e)
                    }
                }
            }
        }
    }
}

async fn run_flush_loop(
    mut receiver: mpsc::Receiver<OutboxCommand>,
    config: OutboxConfig,
    frontend: Arc<dyn FrontendApi>,
) {
    let mut buffer = Vec::with_capacity(config.max_buffer_size);
    let mut flush_timer = interval(config.flush_interval);
    flush_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            command = receiver.recv() => {
                match command {
                    Some(OutboxCommand::Deliver(item, reply)) => {
                        let identity = item.identity();
                        push(&mut buffer, item);
                        flush(&mut buffer, frontend.as_ref(), "Immediate").await;
                        let _ = reply.send(buffer.iter().any(|queued| queued.identity() == identity));
                    }
                    Some(OutboxCommand::Flush(reply)) => {
                        flush(&mut buffer, frontend.as_ref(), "Forced").await;
                        let _ = reply.send(buffer.len());
                    }
                    Some(OutboxCommand::Shutdown(reply)) => {
                        receiver.close();
                        flush(&mut buffer, frontend.as_ref(), "Final").await;
                        if !buffer.is_empty() {
                            error!("Dropping {} undelivered frontend updates", buffer.len());
                        }
                        let _ = reply.send(buffer.len());
                        break;
                    }
                    None => {
                        flush(&mut buffer, frontend.as_ref(), "Final").await;
                        break;
                    }
                }
            }

            _ = flush_timer.tick() => {
                flush(&mut buffer, frontend.as_ref(), "Periodic").await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{Map, json};

    use super::*;
    use crate::frontend::tests::FakeFrontend;
    use crate::frontend::{ActionUpdate, BuildUpdate};

    fn config(max_buffer_size: usize) -> OutboxConfig {
        OutboxConfig {
            max_buffer_size,
            flush_interval: Duration::from_secs(3600),
        }
    }

    fn build_update(task_id: &str, status: i64) -> UpdateItem {
        UpdateItem::Build(BuildUpdate {
            build_id: 7,
            task_id: task_id.to_string(),
            chroot: None,
            status: json!(status),
            result_dir: None,
            extra: Map::new(),
        })
    }

    fn action(id: i64, result: i64) -> UpdateItem {
        UpdateItem::Action(ActionUpdate { id, result })
    }

    #[tokio::test]
    async fn test_deliver_sends_right_away() {
        let frontend = Arc::new(FakeFrontend::default());
        let outbox = UpdateOutbox::new(config(100), frontend.clone());

        outbox.deliver(action(1, 1)).await.unwrap();
        outbox.deliver(action(2, 2)).await.unwrap();
        assert_eq!(outbox.flush().await.unwrap(), 0);

        let updates = frontend.updates.lock();
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[1].actions, vec![ActionUpdate { id: 2, result: 2 }]);
    }

    #[tokio::test]
    async fn test_deliver_reports_pending_update() {
        let frontend = Arc::new(FakeFrontend::default());
        *frontend.fail_updates.lock() = 1;
        let outbox = UpdateOutbox::new(config(100), frontend.clone());

        let err = outbox.deliver(build_update("7-fedora-39-x86_64", 1)).await.unwrap_err();
        assert!(err.is_transient());
        assert!(frontend.updates.lock().is_empty());

        // Still buffered; the next flush sends it.
        assert_eq!(outbox.flush().await.unwrap(), 0);
        let updates = frontend.updates.lock();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].builds.len(), 1);
    }

    #[tokio::test]
    async fn test_rejected_update_does_not_block_others() {
        let frontend = Arc::new(FakeFrontend::default());
        *frontend.fail_updates.lock() = 1;
        frontend.rejected_actions.lock().push(1);
        let outbox = UpdateOutbox::new(config(100), frontend.clone());

        assert!(outbox.deliver(action(2, 1)).await.is_err());
        // Both are sent together, then one by one after the rejection.
        outbox.deliver(action(1, 2)).await.unwrap();
        outbox.deliver(action(3, 1)).await.unwrap();
        assert_eq!(outbox.flush().await.unwrap(), 0);

        let delivered: Vec<i64> = frontend
            .updates
            .lock()
            .iter()
            .flat_map(|u| u.actions.iter().map(|a| a.id))
            .collect();
        assert_eq!(delivered, vec![2, 3]);
    }

    #[tokio::test]
    async fn test_latest_update_of_an_object_wins() {
        let frontend = Arc::new(FakeFrontend::default());
        *frontend.fail_updates.lock() = 2;
        let outbox = UpdateOutbox::new(config(100), frontend.clone());

        assert!(outbox.deliver(build_update("7-fedora-39-x86_64", 3)).await.is_err());
        assert!(outbox.deliver(build_update("7-fedora-39-x86_64", 1)).await.is_err());
        assert_eq!(outbox.shutdown().await.unwrap(), 0);

        let updates = frontend.updates.lock();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].builds.len(), 1);
        assert_eq!(updates[0].builds[0].status, json!(1));
        drop(updates);

        assert!(outbox.deliver(build_update("8", 1)).await.is_err());
    }
}
