//! Batched repository metadata regeneration.
//!
//! Many builds of one project tend to finish back-to-back, each wanting to
//! regenerate the metadata of the same directory. Every requester posts a
//! record under `createrepo_batched::{dir}::{requester}`, waits briefly, and
//! then atomically either learns that a peer already did its work, or claims
//! the compatible pending peers and runs the tool once for all of them.
//!
//! Record fields:
//! - `task`: the JSON encoded [`BatchTask`];
//! - `status`: `success` once a peer processed the request;
//! - `claimed_by`: key of the executor that absorbed the request;
//! - `executing`: start time of the executor's run.
//!
//! The last key segment starts with the requester's pid. A record whose
//! owner process is gone is orphaned: the next executor absorbs its task and
//! removes it on commit.

mod runner;

pub use runner::{CommandCreaterepo, CreaterepoRunner};

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clock::{Clock, Timestamp};
use crate::config::CreaterepoConfig;
use crate::store::{ScriptView, SharedStore, escape_glob, format_timestamp};
use crate::{Error, Result};

pub const KEY_PREFIX: &str = "createrepo_batched";

const TASK: &str = "task";
const STATUS: &str = "status";
const CLAIMED_BY: &str = "claimed_by";
const EXECUTING: &str = "executing";
const SUCCESS: &str = "success";

fn default_true() -> bool {
    true
}

/// Options of one createrepo request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchTask {
    #[serde(default)]
    pub full: bool,
    #[serde(default)]
    pub add: Vec<String>,
    #[serde(default)]
    pub delete: Vec<String>,
    #[serde(default)]
    pub rpms_to_remove: Vec<String>,
    #[serde(default = "default_true")]
    pub appstream: bool,
    #[serde(default)]
    pub devel: bool,
}

impl Default for BatchTask {
    fn default() -> Self {
        Self {
            full: false,
            add: Vec::new(),
            delete: Vec::new(),
            rpms_to_remove: Vec::new(),
            appstream: true,
            devel: false,
        }
    }
}

impl BatchTask {
    /// Full regeneration of a directory.
    pub fn full(devel: bool, appstream: bool) -> Self {
        Self {
            full: true,
            devel,
            appstream,
            ..Self::default()
        }
    }

    /// Whether a batch with these options may absorb `peer`.
    ///
    /// `devel` must match. A non-appstream peer is absorbed into an appstream
    /// batch, never the other way around.
    pub fn can_absorb(&self, peer: &BatchTask) -> bool {
        compatible(self.devel, self.appstream, peer)
    }
}

fn compatible(devel: bool, appstream: bool, peer: &BatchTask) -> bool {
    devel == peer.devel && (appstream == peer.appstream || appstream)
}

/// Union of several compatible requests.
#[derive(Debug, Clone, Default)]
struct MergedTask {
    full: bool,
    add: BTreeSet<String>,
    delete: BTreeSet<String>,
    rpms_to_remove: BTreeSet<String>,
    appstream: bool,
    devel: bool,
}

impl MergedTask {
    fn new(task: &BatchTask) -> Self {
        let mut merged = Self {
            appstream: task.appstream,
            devel: task.devel,
            ..Self::default()
        };
        merged.absorb(task);
        merged
    }

    fn absorb(&mut self, task: &BatchTask) {
        if task.full {
            self.full = true;
        }
        // A full run regenerates everything that would be added.
        if self.full {
            self.add.clear();
        } else {
            self.add.extend(task.add.iter().cloned());
        }
        self.delete.extend(task.delete.iter().cloned());
        self.rpms_to_remove.extend(task.rpms_to_remove.iter().cloned());
        self.appstream |= task.appstream;
    }

    fn into_task(self) -> BatchTask {
        BatchTask {
            full: self.full,
            add: self.add.into_iter().collect(),
            delete: self.delete.into_iter().collect(),
            rpms_to_remove: self.rpms_to_remove.into_iter().collect(),
            appstream: self.appstream,
            devel: self.devel,
        }
    }
}

/// A claimed batch, ready to run.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub key: String,
    pub task: BatchTask,
    /// Absorbed peers, notified on [`BatchedCreaterepo::commit`].
    pub notify: Vec<String>,
    /// Absorbed records of dead requesters, removed on commit.
    pub orphans: Vec<String>,
}

impl Batch {
    /// Number of requests served by this batch, our own included.
    pub fn merged(&self) -> usize {
        self.notify.len() + self.orphans.len() + 1
    }
}

/// Tells whether the process owning a request is still running.
pub type OwnerCheck = fn(u32) -> bool;

fn owner_pid(key: &str) -> Option<u32> {
    let (pid, _) = key.rsplit("::").next()?.split_once('-')?;
    pid.parse().ok()
}

/// Result of [`BatchedCreaterepo::claim_batch`].
#[derive(Debug, Clone, PartialEq)]
pub enum Claim {
    /// A peer already processed the request.
    Processed,
    /// A peer claimed the request, or runs a compatible batch right now.
    Wait,
    /// The request record disappeared.
    Gone,
    /// This requester runs the tool.
    Run(Batch),
}

/// How a [`BatchedCreaterepo::publish`] call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// The tool ran here, for `merged` requests including our own.
    Executed { merged: usize },
    /// A peer did the work.
    Absorbed,
}

/// Coalesces concurrent createrepo requests for the same directory.
pub struct BatchedCreaterepo {
    store: Arc<dyn SharedStore>,
    clock: Arc<dyn Clock>,
    runner: Arc<dyn CreaterepoRunner>,
    max_in_batch: usize,
    batch_wait: Duration,
    poll_interval: Duration,
    stale_execution: f64,
    owner_alive: OwnerCheck,
}

impl BatchedCreaterepo {
    pub fn new(
        config: &CreaterepoConfig,
        store: Arc<dyn SharedStore>,
        clock: Arc<dyn Clock>,
        runner: Arc<dyn CreaterepoRunner>,
    ) -> Self {
        Self {
            store,
            clock,
            runner,
            max_in_batch: config.max_in_batch.max(1),
            batch_wait: Duration::from_millis(config.batch_wait_ms),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            stale_execution: config.stale_execution_secs,
            owner_alive: process_utils::pid_alive,
        }
    }

    /// Replace the liveness check of request owners.
    pub fn with_owner_check(mut self, check: OwnerCheck) -> Self {
        self.owner_alive = check;
        self
    }

    pub fn key_pattern(dir: &Path) -> String {
        format!("{}::{}::*", KEY_PREFIX, escape_glob(&dir.display().to_string()))
    }

    fn new_key(dir: &Path) -> String {
        format!(
            "{}::{}::{}-{:x}",
            KEY_PREFIX,
            dir.display(),
            std::process::id(),
            rand::random::<u64>()
        )
    }

    /// Post the request; returns its key.
    pub async fn make_request(&self, dir: &Path, task: &BatchTask) -> Result<String> {
        let key = Self::new_key(dir);
        self.post(&key, task).await?;
        Ok(key)
    }

    async fn post(&self, key: &str, task: &BatchTask) -> Result<()> {
        let json = serde_json::to_string(task)?;
        self.store.hset(key, TASK, &json).await
    }

    /// Whether a peer processed the request; a processed record is removed.
    pub async fn check_processed(&self, key: &str) -> Result<bool> {
        let processed = self.store.hget(key, STATUS).await?.as_deref() == Some(SUCCESS);
        if processed {
            self.store.delete(key).await?;
        }
        Ok(processed)
    }

    /// The atomic check-and-merge step.
    pub async fn claim_batch(&self, dir: &Path, key: &str) -> Result<Claim> {
        let now = self.clock.now();
        let max_in_batch = self.max_in_batch;
        let liveness = Liveness {
            now,
            stale: self.stale_execution,
            owner_alive: self.owner_alive,
        };
        let mut claim = Claim::Gone;

        self.store
            .run_script(&Self::key_pattern(dir), &mut |view: &mut ScriptView| {
                claim = claim_in_view(view, key, &liveness, max_in_batch)?;
                Ok(())
            })
            .await?;
        Ok(claim)
    }

    /// Mark absorbed peers processed and drop our own record.
    pub async fn commit(&self, dir: &Path, batch: &Batch) -> Result<()> {
        self.store
            .run_script(&Self::key_pattern(dir), &mut |view: &mut ScriptView| {
                for peer in &batch.notify {
                    if view.contains(peer) {
                        debug!("Notifying {} that we succeeded", peer);
                        view.hset(peer, STATUS, SUCCESS)?;
                    }
                }
                for orphan in &batch.orphans {
                    if view.contains(orphan) {
                        view.delete(orphan)?;
                    }
                }
                view.delete(&batch.key)
            })
            .await
    }

    /// Give absorbed peers back to their owners and drop our own record.
    pub async fn release(&self, dir: &Path, batch: &Batch) -> Result<()> {
        self.store
            .run_script(&Self::key_pattern(dir), &mut |view: &mut ScriptView| {
                for peer in batch.notify.iter().chain(&batch.orphans) {
                    if view.hget(peer, CLAIMED_BY) == Some(batch.key.as_str()) {
                        view.hdel(peer, CLAIMED_BY)?;
                    }
                }
                view.delete(&batch.key)
            })
            .await
    }

    /// Request createrepo over `dir` and return once it is done, by us or by
    /// a peer.
    pub async fn publish(&self, dir: &Path, task: &BatchTask) -> Result<PublishOutcome> {
        let key = self.make_request(dir, task).await?;
        self.clock.sleep(self.batch_wait).await;

        loop {
            match self.claim_batch(dir, &key).await? {
                Claim::Processed => {
                    let err = Error::BatchMergeLost(key.clone());
                    info!("{}, nothing to do", err);
                    self.store.delete(&key).await?;
                    return Ok(PublishOutcome::Absorbed);
                }
                Claim::Wait => {
                    debug!("{} waits for a peer", key);
                    self.clock.sleep(self.poll_interval).await;
                }
                Claim::Gone => {
                    warn!("Batch record {} vanished, posting it again", key);
                    self.post(&key, task).await?;
                }
                Claim::Run(batch) => {
                    let merged = batch.merged();
                    info!("{} runs createrepo for {} requests", key, merged);
                    match self.runner.run(dir, &batch.task).await {
                        Ok(()) => {
                            self.commit(dir, &batch).await?;
                            return Ok(PublishOutcome::Executed { merged });
                        }
                        Err(e) => {
                            if let Err(release_err) = self.release(dir, &batch).await {
                                warn!("Can not release batch {}: {}", key, release_err);
                            }
                            return Err(e);
                        }
                    }
                }
            }
        }
    }
}

fn parse_task(view: &ScriptView, key: &str) -> Option<BatchTask> {
    let raw = view.hget(key, TASK)?;
    match serde_json::from_str(raw) {
        Ok(task) => Some(task),
        Err(e) => {
            warn!("Malformed batch task in {}: {}", key, e);
            None
        }
    }
}

fn executing_since(view: &ScriptView, key: &str) -> Option<Timestamp> {
    view.hget(key, EXECUTING)
        .and_then(|v| v.trim().parse::<f64>().ok())
}

/// What a claim needs to tell live requests from dead ones.
struct Liveness {
    now: Timestamp,
    stale: f64,
    owner_alive: OwnerCheck,
}

impl Liveness {
    /// Keys in a foreign format are assumed to be alive.
    fn owner_alive(&self, key: &str) -> bool {
        match owner_pid(key) {
            Some(pid) if pid == std::process::id() => true,
            Some(pid) => (self.owner_alive)(pid),
            None => true,
        }
    }

    /// Whether `key` is an executor whose run is in progress.
    fn is_live_executor(&self, view: &ScriptView, key: &str) -> bool {
        executing_since(view, key).is_some_and(|since| self.now - since < self.stale)
            && self.owner_alive(key)
    }
}

fn claim_in_view(
    view: &mut ScriptView,
    key: &str,
    liveness: &Liveness,
    max_in_batch: usize,
) -> Result<Claim> {
    if !view.contains(key) {
        return Ok(Claim::Gone);
    }
    if view.hget(key, STATUS) == Some(SUCCESS) {
        return Ok(Claim::Processed);
    }

    if let Some(executor) = view.hget(key, CLAIMED_BY).map(str::to_string) {
        if liveness.is_live_executor(view, &executor) {
            return Ok(Claim::Wait);
        }
        debug!("Executor {} of {} is gone, taking the request back", executor, key);
        view.hdel(key, CLAIMED_BY)?;
    }

    let Some(own) = parse_task(view, key) else {
        return Err(Error::validation(format!("batch record {} has no task", key)));
    };

    let peers: Vec<String> = view.keys().into_iter().filter(|k| k != key).collect();

    // One run per directory and devel flag at a time.
    let busy = {
        let view: &ScriptView = view;
        peers.iter().any(|peer| {
            liveness.is_live_executor(view, peer)
                && parse_task(view, peer).is_some_and(|t| t.devel == own.devel)
        })
    };
    if busy {
        return Ok(Claim::Wait);
    }

    let mut merged = MergedTask::new(&own);
    let mut notify = Vec::new();
    let mut orphans = Vec::new();
    for peer in peers {
        if notify.len() + orphans.len() + 1 >= max_in_batch {
            info!("Batch limit {} reached, skip the rest", max_in_batch);
            break;
        }
        if view.hget(&peer, STATUS).is_some() {
            continue;
        }
        if let Some(executor) = view.hget(&peer, CLAIMED_BY)
            && liveness.is_live_executor(view, executor)
        {
            continue;
        }
        // A crashed executor never committed its run.
        let orphaned = executing_since(view, &peer).is_some() || !liveness.owner_alive(&peer);
        let Some(task) = parse_task(view, &peer) else {
            if orphaned {
                warn!("Dropping orphaned batch record {} without a task", peer);
                view.delete(&peer)?;
            }
            continue;
        };
        if !compatible(merged.devel, merged.appstream, &task) {
            debug!("{} is not compatible with {}, skip", peer, key);
            continue;
        }
        merged.absorb(&task);
        view.hset(&peer, CLAIMED_BY, key)?;
        if orphaned {
            info!("Taking over orphaned batch record {}", peer);
            view.hdel(&peer, EXECUTING)?;
            orphans.push(peer);
        } else {
            notify.push(peer);
        }
    }

    view.hset(key, EXECUTING, format_timestamp(liveness.now))?;
    Ok(Claim::Run(Batch {
        key: key.to_string(),
        task: merged.into_task(),
        notify,
        orphans,
    }))
}
