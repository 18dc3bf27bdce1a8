//! Build worker families: SRPM (source) builds and RPM builds.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::debug;

use crate::config::LimitsConfig;
use crate::frontend::{BuildUpdate, UpdateItem, UpdateOutbox};
use crate::store::{WorkerRecord, fields};
use crate::task::BuildTask;
use crate::worker::{HashWorkerLimit, PredicateWorkerLimit, WorkerBehavior, WorkerLimit};
use crate::{Error, Result};

/// Record field holding the results directory of a finished build.
pub const RESULT_DIR_FIELD: &str = "result_dir";

/// Chroot name used for source builds.
pub const SRPM_CHROOT: &str = "srpm-builds";

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum BuildFamily {
    Source,
    Rpm,
}

impl BuildFamily {
    pub fn of(task: &BuildTask) -> Self {
        if task.is_source_build() {
            Self::Source
        } else {
            Self::Rpm
        }
    }
}

/// Starts one builder process per build task and reports its result.
pub struct BuildWorkerBehavior {
    family: BuildFamily,
    command: Vec<String>,
    envs: Vec<(String, String)>,
    outbox: Arc<UpdateOutbox>,
}

impl BuildWorkerBehavior {
    pub fn new(family: BuildFamily, command: &str, outbox: Arc<UpdateOutbox>) -> Self {
        Self {
            family,
            command: command.split_whitespace().map(str::to_string).collect(),
            envs: Vec::new(),
            outbox,
        }
    }

    /// Environment passed to every spawned builder.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn family(&self) -> BuildFamily {
        self.family
    }

    pub fn command_line(&self, worker_id: &str, task: &BuildTask) -> Vec<String> {
        let mut argv = self.command.clone();
        argv.extend([
            "--daemon".to_string(),
            "--build-id".to_string(),
            task.build_id.to_string(),
            "--chroot".to_string(),
            task.worker_chroot().to_string(),
            "--worker-id".to_string(),
            worker_id.to_string(),
        ]);
        argv
    }
}

/// Split a task id into build id and chroot.
pub fn parse_task_id(task_id: &str) -> Result<(i64, String)> {
    let invalid = || Error::validation(format!("invalid build task id '{}'", task_id));
    match task_id.split_once('-') {
        None => Ok((task_id.parse().map_err(|_| invalid())?, SRPM_CHROOT.to_string())),
        Some((build_id, chroot)) if !chroot.is_empty() => {
            Ok((build_id.parse().map_err(|_| invalid())?, chroot.to_string()))
        }
        Some(_) => Err(invalid()),
    }
}

/// Worker-written status; numeric statuses are reported as numbers.
fn status_value(raw: &str) -> Value {
    match raw.trim().parse::<i64>() {
        Ok(code) => Value::from(code),
        Err(_) => Value::from(raw),
    }
}

const MANAGER_FIELDS: &[&str] = &[
    fields::ALLOCATED,
    fields::STARTED,
    fields::CHECKED,
    fields::DELETE,
    fields::STATUS,
    fields::PID,
    fields::CANCEL_REQUEST,
    fields::SANDBOX,
    RESULT_DIR_FIELD,
];

pub fn build_update(worker_id: &str, record: &WorkerRecord) -> Result<BuildUpdate> {
    // Worker prefixes never contain ':'.
    let task_id = worker_id
        .split_once(':')
        .map(|(_, task_id)| task_id)
        .ok_or_else(|| Error::validation(format!("invalid worker id '{}'", worker_id)))?;
    let (build_id, chroot) = parse_task_id(task_id)?;
    let status = record
        .status()
        .map(status_value)
        .ok_or_else(|| Error::validation(format!("worker {} has no status", worker_id)))?;

    let extra: Map<String, Value> = record
        .fields
        .iter()
        .filter(|(k, _)| !MANAGER_FIELDS.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), Value::from(v.as_str())))
        .collect();

    Ok(BuildUpdate {
        build_id,
        task_id: task_id.to_string(),
        chroot: Some(chroot),
        status,
        result_dir: record.get(RESULT_DIR_FIELD).map(str::to_string),
        extra,
    })
}

#[async_trait]
impl WorkerBehavior<BuildTask> for BuildWorkerBehavior {
    async fn start_task(&self, worker_id: &str, task: &BuildTask) -> Result<()> {
        let argv = self.command_line(worker_id, task);
        let pid = process_utils::spawn_detached(&argv, &self.envs)
            .map_err(|e| Error::start_failed(worker_id, e))?;
        debug!(worker_id = %worker_id, pid, family = %self.family, "Builder spawned");
        Ok(())
    }

    /// The record is only dropped once the frontend has the result.
    async fn finish_task(&self, worker_id: &str, record: &WorkerRecord) -> Result<()> {
        let update = build_update(worker_id, record)?;
        self.outbox.deliver(UpdateItem::Build(update)).await
    }
}

/// Interleave sandboxes: the n-th build of a sandbox, in frontend priority
/// order, gets a backend priority of n.
pub fn spread_sandboxes(builds: &mut [BuildTask]) {
    let mut order: Vec<usize> = (0..builds.len()).collect();
    order.sort_by_key(|&i| builds[i].frontend_priority());

    let mut seen: HashMap<String, i64> = HashMap::new();
    for i in order {
        let task = &mut builds[i];
        let sandbox = task
            .sandbox
            .clone()
            .unwrap_or_else(|| task.project_owner.clone());
        let count = seen.entry(sandbox).or_default();
        task.backend_priority = *count;
        *count += 1;
    }
}

/// Cap on running builds for one native architecture.
pub fn arch_limit(arch: &str, limit: usize) -> PredicateWorkerLimit<BuildTask> {
    let wanted = arch.to_string();
    PredicateWorkerLimit::new(format!("arch_{}", arch), limit, move |task: &BuildTask| {
        task.requested_arch().as_deref() == Some(wanted.as_str())
    })
}

/// Cap on running builds carrying `tag`.
pub fn tag_limit(tag: &str, limit: usize) -> PredicateWorkerLimit<BuildTask> {
    let wanted = tag.to_string();
    PredicateWorkerLimit::new(format!("tag_{}", tag), limit, move |task: &BuildTask| {
        task.tags.iter().any(|t| *t == wanted)
    })
}

pub fn sandbox_limit(limit: usize) -> HashWorkerLimit<BuildTask> {
    HashWorkerLimit::new("sandbox", limit, |task: &BuildTask| task.sandbox.clone())
}

pub fn owner_limit(limit: usize) -> HashWorkerLimit<BuildTask> {
    HashWorkerLimit::new("owner", limit, |task: &BuildTask| {
        Some(task.project_owner.clone())
    })
}

/// Every limit configured for the build families.
pub fn build_limits(config: &LimitsConfig) -> Vec<Box<dyn WorkerLimit<BuildTask>>> {
    let mut limits: Vec<Box<dyn WorkerLimit<BuildTask>>> = Vec::new();
    for (arch, limit) in &config.arch {
        limits.push(Box::new(arch_limit(arch, *limit)));
    }
    for (tag, limit) in &config.tags {
        limits.push(Box::new(tag_limit(tag, *limit)));
    }
    limits.push(Box::new(sandbox_limit(config.sandbox)));
    limits.push(Box::new(owner_limit(config.owner)));
    limits
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::frontend::OutboxConfig;
    use crate::frontend::tests::FakeFrontend;
    use crate::task::QueueTask;
    use crate::task::build::tests::build;

    fn record(pairs: &[(&str, &str)]) -> WorkerRecord {
        WorkerRecord::new(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    fn outbox(frontend: Arc<FakeFrontend>) -> Arc<UpdateOutbox> {
        Arc::new(UpdateOutbox::new(
            OutboxConfig {
                max_buffer_size: 100,
                flush_interval: Duration::from_secs(3600),
            },
            frontend,
        ))
    }

    #[test]
    fn test_parse_task_id() {
        assert_eq!(parse_task_id("123").unwrap(), (123, "srpm-builds".to_string()));
        assert_eq!(
            parse_task_id("123-fedora-39-x86_64").unwrap(),
            (123, "fedora-39-x86_64".to_string())
        );
        assert!(parse_task_id("abc").is_err());
        assert!(parse_task_id("12-").is_err());
    }

    #[tokio::test]
    async fn test_command_line() {
        let behavior = BuildWorkerBehavior::new(
            BuildFamily::Rpm,
            "/usr/bin/copr-backend-process-build --verbose",
            outbox(Arc::new(FakeFrontend::default())),
        );
        let task = build("7-fedora-39-x86_64", Some("fedora-39-x86_64"));
        assert_eq!(
            behavior.command_line("rpm_build_worker:7-fedora-39-x86_64", &task),
            vec![
                "/usr/bin/copr-backend-process-build",
                "--verbose",
                "--daemon",
                "--build-id",
                "7",
                "--chroot",
                "fedora-39-x86_64",
                "--worker-id",
                "rpm_build_worker:7-fedora-39-x86_64",
            ]
        );
        assert_eq!(BuildFamily::of(&task), BuildFamily::Rpm);
        assert_eq!(BuildFamily::of(&build("7", None)), BuildFamily::Source);
    }

    #[test]
    fn test_build_update_forwards_worker_fields() {
        let rec = record(&[
            ("allocated", "1700000000"),
            ("started", "1"),
            ("PID", "42"),
            ("status", "1"),
            ("result_dir", "00000007"),
            ("ended_on", "1700000100"),
        ]);
        let update = build_update("rpm_build_worker:7-fedora-39-x86_64", &rec).unwrap();
        assert_eq!(update.build_id, 7);
        assert_eq!(update.chroot.as_deref(), Some("fedora-39-x86_64"));
        assert_eq!(update.status, json!(1));
        assert_eq!(update.result_dir.as_deref(), Some("00000007"));
        assert_eq!(update.extra.len(), 1);
        assert_eq!(update.extra["ended_on"], json!("1700000100"));

        let odd = build_update("rpm_build_worker:7-fedora:39", &rec).unwrap();
        assert_eq!((odd.build_id, odd.chroot.as_deref()), (7, Some("fedora:39")));
        assert!(build_update("rpm_build_worker", &rec).is_err());

        let rec = record(&[("allocated", "1"), ("status", "succeeded")]);
        let update = build_update("srpm_build_worker:9", &rec).unwrap();
        assert_eq!(update.status, json!("succeeded"));
        assert_eq!(update.chroot.as_deref(), Some("srpm-builds"));
    }

    #[tokio::test]
    async fn test_finish_task_delivers_update() {
        let frontend = Arc::new(FakeFrontend::default());
        let behavior = BuildWorkerBehavior::new(BuildFamily::Source, "true", outbox(frontend.clone()));

        behavior
            .finish_task("srpm_build_worker:9", &record(&[("status", "0")]))
            .await
            .unwrap();

        let updates = frontend.updates.lock();
        assert_eq!(updates[0].builds[0].build_id, 9);
        assert_eq!(updates[0].builds[0].status, json!(0));
    }

    #[tokio::test]
    async fn test_finish_task_fails_while_frontend_is_down() {
        let frontend = Arc::new(FakeFrontend::default());
        *frontend.fail_updates.lock() = 1;
        let behavior = BuildWorkerBehavior::new(BuildFamily::Rpm, "true", outbox(frontend.clone()));
        let rec = record(&[("status", "1")]);

        let err = behavior
            .finish_task("rpm_build_worker:7-fedora-39-x86_64", &rec)
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert!(frontend.updates.lock().is_empty());

        behavior
            .finish_task("rpm_build_worker:7-fedora-39-x86_64", &rec)
            .await
            .unwrap();
        assert_eq!(frontend.updates.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_start_failure_is_reported() {
        let behavior = BuildWorkerBehavior::new(
            BuildFamily::Rpm,
            "/nonexistent/copr-builder",
            outbox(Arc::new(FakeFrontend::default())),
        );
        let task = build("7-fedora-39-x86_64", Some("fedora-39-x86_64"));
        let err = behavior
            .start_task("rpm_build_worker:7-fedora-39-x86_64", &task)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::WorkerStartFailed { .. }));
    }

    #[test]
    fn test_spread_sandboxes() {
        let mut builds = vec![
            build("1-fedora-39-x86_64", Some("fedora-39-x86_64")),
            build("1-fedora-40-x86_64", Some("fedora-40-x86_64")),
            build("1-fedora-41-x86_64", Some("fedora-41-x86_64")),
            BuildTask {
                sandbox: Some("bob/bar--bob".to_string()),
                ..build("2-fedora-39-x86_64", Some("fedora-39-x86_64"))
            },
        ];
        spread_sandboxes(&mut builds);

        let backend: Vec<i64> = builds.iter().map(|b| b.backend_priority).collect();
        assert_eq!(backend, vec![0, 1, 2, 0]);
        // Bob's single build goes before alice's second one.
        assert!(builds[3].priority() < builds[1].priority());
    }

    #[test]
    fn test_configured_limits() {
        let mut config = LimitsConfig::default();
        config.arch.insert("aarch64".to_string(), 1);
        config.owner = 5;
        let mut limits = build_limits(&config);
        assert_eq!(limits.len(), 3);

        let arm1 = build("1-fedora-39-aarch64", Some("fedora-39-aarch64"));
        let arm2 = build("2-fedora-39-aarch64", Some("fedora-39-aarch64"));
        let x86 = build("3-fedora-39-i386", Some("fedora-39-i386"));
        for limit in &mut limits {
            limit.worker_added("rpm_build_worker:1-fedora-39-aarch64", &arm1);
        }
        assert!(!limits.iter().all(|l| l.check(&arm2)));
        assert!(limits.iter().all(|l| l.check(&x86)));
        assert_eq!(x86.requested_arch().as_deref(), Some("x86_64"));
    }
}
