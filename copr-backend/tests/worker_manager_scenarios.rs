use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use copr_backend::{Error, Result};
use copr_backend::clock::{Clock, ManualClock};
use copr_backend::store::{MemoryStore, SharedStore, WorkerRecord, fields, format_timestamp};
use copr_backend::task::QueueTask;
use copr_backend::worker::{ManagerConfig, WorkerBehavior, WorkerManager};

const T0: f64 = 1_700_000_000.0;

#[derive(Debug, Clone)]
struct Job {
    id: String,
    priority: i64,
}

impl QueueTask for Job {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn priority(&self) -> i64 {
        self.priority
    }
}

fn job(id: &str, priority: i64) -> Job {
    Job {
        id: id.to_string(),
        priority,
    }
}

/// What the fake worker of a task does once spawned.
#[derive(Debug, Clone, Copy)]
enum Script {
    Succeed,
    Silent,
    StartThenDie,
}

struct ScriptedBehavior {
    store: Arc<MemoryStore>,
    scripts: HashMap<String, Script>,
    started: Mutex<Vec<String>>,
    finished: Mutex<Vec<String>>,
    /// Number of upcoming `finish_task` calls failing like an unreachable
    /// frontend.
    failing_finishes: Mutex<usize>,
}

impl ScriptedBehavior {
    fn new(store: Arc<MemoryStore>, scripts: &[(&str, Script)]) -> Self {
        Self {
            store,
            scripts: scripts
                .iter()
                .map(|(id, script)| (format!("worker:{}", id), *script))
                .collect(),
            started: Mutex::default(),
            finished: Mutex::default(),
            failing_finishes: Mutex::default(),
        }
    }
}

#[async_trait]
impl WorkerBehavior<Job> for ScriptedBehavior {
    async fn start_task(&self, worker_id: &str, _task: &Job) -> Result<()> {
        self.started.lock().push(worker_id.to_string());
        match self.scripts.get(worker_id).copied().unwrap_or(Script::Silent) {
            Script::Succeed => {
                self.store
                    .hset_many(worker_id, &[(fields::STARTED, "1"), (fields::STATUS, "succeeded")])
                    .await
            }
            Script::StartThenDie => self.store.hset(worker_id, fields::STARTED, "1").await,
            Script::Silent => Ok(()),
        }
    }

    async fn finish_task(&self, worker_id: &str, _record: &WorkerRecord) -> Result<()> {
        {
            let mut failing = self.failing_finishes.lock();
            if *failing > 0 {
                *failing -= 1;
                return Err(Error::frontend("update not delivered yet"));
            }
        }
        self.finished.lock().push(worker_id.to_string());
        Ok(())
    }

    async fn is_worker_alive(&self, _worker_id: &str, _record: &WorkerRecord) -> bool {
        false
    }
}

async fn manager(
    store: Arc<MemoryStore>,
    clock: Arc<ManualClock>,
    max_workers: usize,
    scripts: &[(&str, Script)],
) -> WorkerManager<Job, ScriptedBehavior> {
    let config = ManagerConfig {
        worker_prefix: "worker".to_string(),
        max_workers,
        worker_timeout_start: 30.0,
        worker_timeout_deadcheck: 60.0,
        idle_sleep: Duration::from_secs(1),
    };
    let behavior = ScriptedBehavior::new(store.clone(), scripts);
    WorkerManager::new(config, behavior, store, clock).await.unwrap()
}

#[tokio::test]
async fn happy_path_single_build() {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::new(T0));
    let mut manager = manager(store.clone(), clock, 2, &[("A", Script::Succeed)]).await;

    assert!(manager.add_task(job("A", 0)).await.unwrap());
    let summary = manager.run(None).await.unwrap();

    assert_eq!(summary.started, 1);
    assert_eq!(summary.finished, 1);
    assert_eq!(*manager.behavior().finished.lock(), vec!["worker:A"]);
    assert!(!store.exists("worker:A").await.unwrap());
    assert!(manager.queue().is_empty());
    assert_eq!(manager.worker_count(), 0);
}

#[tokio::test]
async fn readding_a_task_updates_its_priority() {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::new(T0));
    let mut manager = manager(store, clock, 2, &[]).await;

    manager.add_task(job("A", 10)).await.unwrap();
    manager.add_task(job("B", 5)).await.unwrap();
    manager.add_task(job("A", 1)).await.unwrap();

    let queue = manager.queue_mut();
    assert_eq!(queue.pop().unwrap().id, "A");
    assert_eq!(queue.pop().unwrap().id, "B");
    assert!(queue.pop().is_err());
}

#[tokio::test]
async fn stillborn_worker_is_removed_and_not_resubmitted() {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::new(T0));
    let mut manager = manager(store.clone(), clock.clone(), 2, &[("A", Script::Silent)]).await;

    manager.add_task(job("A", 0)).await.unwrap();
    let summary = manager.run(None).await.unwrap();

    assert!(clock.now() - T0 > 30.0);
    assert!(summary.cycles >= 2);
    assert_eq!(summary.stillborn, 1);
    assert!(!store.exists("worker:A").await.unwrap());
    assert!(manager.behavior().finished.lock().is_empty());
    assert_eq!(*manager.behavior().started.lock(), vec!["worker:A"]);
    assert!(manager.queue().is_empty());
}

#[tokio::test]
async fn dead_worker_is_marked_then_reaped() {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::new(T0));
    let mut manager =
        manager(store.clone(), clock.clone(), 2, &[("A", Script::StartThenDie)]).await;

    manager.add_task(job("A", 0)).await.unwrap();

    // The liveness check fires once 60s passed since allocation.
    let summary = manager.run(Some(Duration::from_secs(62))).await.unwrap();
    assert_eq!(summary.dead, 1);
    assert_eq!(
        store.hget("worker:A", fields::DELETE).await.unwrap().as_deref(),
        Some("1")
    );

    let summary = manager.run(None).await.unwrap();
    assert_eq!(summary.abandoned, 1);
    assert!(!store.exists("worker:A").await.unwrap());
    assert!(manager.behavior().finished.lock().is_empty());
}

#[tokio::test]
async fn task_with_existing_record_is_not_queued() {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::new(T0));
    store
        .hset_many(
            "worker:A",
            &[(fields::ALLOCATED, format_timestamp(T0).as_str()), (fields::STARTED, "1")],
        )
        .await
        .unwrap();
    let before = store.hgetall("worker:A").await.unwrap();

    let mut manager = manager(store.clone(), clock, 2, &[]).await;
    assert!(!manager.add_task(job("A", 0)).await.unwrap());

    assert!(manager.queue().is_empty());
    assert_eq!(store.hgetall("worker:A").await.unwrap(), before);
    assert_eq!(store.len(), 1);
}

#[tokio::test]
async fn finished_worker_frees_its_slot_in_the_same_cycle() {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::new(T0));
    store
        .hset_many(
            "worker:A",
            &[
                (fields::ALLOCATED, format_timestamp(T0 - 10.0).as_str()),
                (fields::STARTED, "1"),
                (fields::STATUS, "succeeded"),
            ],
        )
        .await
        .unwrap();

    let mut manager = manager(store.clone(), clock, 1, &[]).await;
    assert_eq!(manager.worker_count(), 1);
    manager.add_task(job("B", 0)).await.unwrap();

    let summary = manager.run(Some(Duration::from_secs(1))).await.unwrap();
    assert_eq!(summary.finished, 1);
    assert_eq!(summary.started, 1);
    assert_eq!(*manager.behavior().started.lock(), vec!["worker:B"]);
    assert!(store.exists("worker:B").await.unwrap());
}

#[tokio::test]
async fn store_outage_skips_cycles_without_losing_tasks() {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::new(T0));
    let mut manager = manager(store.clone(), clock, 2, &[("A", Script::Succeed)]).await;
    manager.add_task(job("A", 0)).await.unwrap();

    store.set_available(false);
    let summary = manager.run(Some(Duration::from_secs(3))).await.unwrap();
    assert!(summary.store_errors > 0);
    assert_eq!(summary.started, 0);
    assert!(manager.queue().contains("A"));

    store.set_available(true);
    let summary = manager.run(None).await.unwrap();
    assert_eq!(summary.finished, 1);
}

#[tokio::test]
async fn undelivered_result_keeps_the_record_for_the_next_run() {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::new(T0));
    let mut manager = manager(store.clone(), clock, 2, &[("A", Script::Succeed)]).await;
    *manager.behavior().failing_finishes.lock() = 1;
    manager.add_task(job("A", 0)).await.unwrap();

    let summary = manager.run(Some(Duration::from_secs(1))).await.unwrap();
    assert_eq!(summary.finished, 0);
    assert!(store.exists("worker:A").await.unwrap());
    assert_eq!(
        store.hget("worker:A", fields::STATUS).await.unwrap().as_deref(),
        Some("succeeded")
    );

    let summary = manager.run(None).await.unwrap();
    assert_eq!(summary.finished, 1);
    assert_eq!(*manager.behavior().finished.lock(), vec!["worker:A"]);
    assert!(!store.exists("worker:A").await.unwrap());
}

#[tokio::test]
async fn finished_record_survives_a_manager_restart() {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::new(T0));
    {
        let mut crashed = manager(store.clone(), clock.clone(), 2, &[("A", Script::Succeed)]).await;
        *crashed.behavior().failing_finishes.lock() = usize::MAX;
        crashed.add_task(job("A", 0)).await.unwrap();
        crashed.run(Some(Duration::from_secs(1))).await.unwrap();
    }
    assert!(store.exists("worker:A").await.unwrap());

    let mut restarted = manager(store.clone(), clock, 2, &[]).await;
    assert_eq!(restarted.worker_count(), 1);
    let summary = restarted.run(None).await.unwrap();
    assert_eq!(summary.finished, 1);
    assert_eq!(*restarted.behavior().finished.lock(), vec!["worker:A"]);
    assert!(!store.exists("worker:A").await.unwrap());
}
