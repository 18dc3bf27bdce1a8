//! Communication with the frontend, the authority on build state.
//!
//! The worker managers never talk to the frontend directly: the
//! [`FrontendSync`] pulls ready tasks and routes them to the dispatchers, and
//! finished results go back through the [`UpdateOutbox`].

mod client;
mod control;
mod outbox;
mod sync;

pub use client::HttpFrontendClient;
pub use control::ControlMessage;
pub use outbox::{OutboxConfig, UpdateOutbox};
pub use sync::{FrontendSync, SyncReport, TaskRouter};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::Result;
use crate::task::{ActionTask, BuildTask};

/// Work the frontend considers ready to dispatch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReadyTasks {
    #[serde(default)]
    pub actions: Vec<ActionTask>,
    #[serde(default)]
    pub builds: Vec<BuildTask>,
}

impl ReadyTasks {
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty() && self.builds.is_empty()
    }
}

/// Result of one build task, keyed by the build id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildUpdate {
    #[serde(rename = "id")]
    pub build_id: i64,
    pub task_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chroot: Option<String>,
    /// Status as written by the worker; numeric statuses stay numbers.
    pub status: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_dir: Option<String>,
    /// Additional fields the worker left in its record.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionUpdate {
    pub id: i64,
    pub result: i64,
}

/// One item queued for the frontend's `update` endpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateItem {
    Build(BuildUpdate),
    Action(ActionUpdate),
}

impl UpdateItem {
    /// Identity used to coalesce repeated updates of the same object.
    fn identity(&self) -> (u8, String) {
        match self {
            Self::Build(b) => (0, b.task_id.clone()),
            Self::Action(a) => (1, a.id.to_string()),
        }
    }
}

/// Body of `POST update`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdatePayload {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub builds: Vec<BuildUpdate>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<ActionUpdate>,
}

impl UpdatePayload {
    pub fn from_items(items: &[UpdateItem]) -> Self {
        let mut payload = Self::default();
        for item in items {
            match item {
                UpdateItem::Build(b) => payload.builds.push(b.clone()),
                UpdateItem::Action(a) => payload.actions.push(*a),
            }
        }
        payload
    }

    pub fn len(&self) -> usize {
        self.builds.len() + self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Response of `POST update`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateResponse {
    pub updated_builds_ids: Vec<i64>,
    pub non_existing_builds_ids: Vec<i64>,
    pub updated_actions_ids: Vec<i64>,
    pub non_existing_actions_ids: Vec<i64>,
}

/// Operations the backend needs from the frontend.
#[async_trait]
pub trait FrontendApi: Send + Sync {
    /// Builds and actions ready to be dispatched. Never blocks on the frontend
    /// side; an empty answer means there is nothing to do.
    async fn ready_tasks(&self) -> Result<ReadyTasks>;

    /// Push finished results. Idempotent by id.
    async fn update(&self, payload: &UpdatePayload) -> Result<UpdateResponse>;

    /// Final go/no-go before a build starts.
    async fn starting_build(&self, build_id: i64, chroot: &str) -> Result<bool>;

    /// Put a build chroot back into the pending state.
    async fn reschedule_build(&self, build_id: i64, task_id: &str, chroot: &str) -> Result<()>;

    /// The full body of one action.
    async fn get_action(&self, action_id: i64) -> Result<ActionTask>;

    /// Task ids the users asked to cancel.
    async fn cancel_requests(&self) -> Result<Vec<String>>;

    /// Acknowledge a cancel request.
    async fn report_canceled(&self, task_id: &str, was_running: bool) -> Result<()>;
}
