use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{QueueTask, SandboxLabel};

/// Width of one priority band; see [`BuildTask::frontend_priority`].
pub const PRIORITY_SECTION_SIZE: i64 = 1_000_000;

/// A build (SRPM or RPM) as announced by the frontend.
///
/// Only the fields the scheduler needs are typed; everything else is kept in
/// `payload` and forwarded untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildTask {
    /// `"{build_id}"` for source builds, `"{build_id}-{chroot}"` otherwise.
    #[serde(deserialize_with = "deserialize_task_id")]
    pub task_id: String,
    pub build_id: i64,
    #[serde(default)]
    pub chroot: Option<String>,
    pub project_owner: String,
    #[serde(default)]
    pub project_name: Option<String>,
    #[serde(default)]
    pub submitter: Option<String>,
    /// Priority assigned by the frontend.
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub background: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub sandbox: Option<String>,
    /// Local adjustment added on top of the frontend priority.
    #[serde(skip)]
    pub backend_priority: i64,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

fn deserialize_task_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "task_id must be a string or a number, got {}",
            other
        ))),
    }
}

impl BuildTask {
    /// Source builds carry a purely numeric task id.
    pub fn is_source_build(&self) -> bool {
        self.task_id.parse::<i64>().is_ok()
    }

    /// Priority derived from the frontend data alone.
    ///
    /// Tasks fall into four bands: source builds, background source builds,
    /// RPM builds and background RPM builds.
    pub fn frontend_priority(&self) -> i64 {
        let mut priority = self.priority;
        if self.background {
            priority += 2 * PRIORITY_SECTION_SIZE;
        }
        if !self.is_source_build() {
            priority += PRIORITY_SECTION_SIZE;
        }
        priority
    }

    /// Native builder architecture; `i386`/`i686` and friends build on `x86_64`.
    pub fn requested_arch(&self) -> Option<String> {
        let chroot = self.chroot.as_deref().filter(|c| !c.is_empty())?;
        let arch = chroot.rsplit('-').next().unwrap_or(chroot);
        if arch.ends_with("86") {
            Some("x86_64".to_string())
        } else {
            Some(arch.to_string())
        }
    }

    pub fn sandbox_label(&self) -> Option<SandboxLabel> {
        self.sandbox.as_deref().and_then(|s| s.parse().ok())
    }

    /// Chroot argument passed to the builder process.
    pub fn worker_chroot(&self) -> &str {
        if self.is_source_build() {
            "srpm-builds"
        } else {
            self.chroot.as_deref().unwrap_or("srpm-builds")
        }
    }
}

impl QueueTask for BuildTask {
    fn id(&self) -> String {
        self.task_id.clone()
    }

    fn priority(&self) -> i64 {
        self.frontend_priority() + self.backend_priority
    }

    fn sandbox(&self) -> Option<String> {
        self.sandbox.clone()
    }
}
