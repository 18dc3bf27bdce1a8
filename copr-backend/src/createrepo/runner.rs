//! Invocation of the repository metadata tool.

use std::path::Path;

use async_trait::async_trait;
use tracing::{debug, info};

use super::BatchTask;
use crate::{Error, Result};

/// Runs the metadata tool once for a merged batch.
#[async_trait]
pub trait CreaterepoRunner: Send + Sync {
    async fn run(&self, dir: &Path, task: &BatchTask) -> Result<()>;
}

/// Runs an external command and waits for it.
#[derive(Debug, Clone)]
pub struct CommandCreaterepo {
    command: Vec<String>,
}

impl CommandCreaterepo {
    pub fn new(command: &str) -> Self {
        Self {
            command: command.split_whitespace().map(str::to_string).collect(),
        }
    }

    pub fn arguments(&self, dir: &Path, task: &BatchTask) -> Vec<String> {
        let mut args: Vec<String> = self.command.iter().skip(1).cloned().collect();
        if task.full {
            args.push("--full".to_string());
        }
        if task.devel {
            args.push("--devel".to_string());
        }
        if !task.appstream {
            args.push("--no-appstream".to_string());
        }
        for (flag, values) in [
            ("--add", &task.add),
            ("--delete", &task.delete),
            ("--rpms-to-remove", &task.rpms_to_remove),
        ] {
            for value in values {
                args.push(flag.to_string());
                args.push(value.clone());
            }
        }
        args.push(dir.display().to_string());
        args
    }
}

#[async_trait]
impl CreaterepoRunner for CommandCreaterepo {
    async fn run(&self, dir: &Path, task: &BatchTask) -> Result<()> {
        let Some(program) = self.command.first() else {
            return Err(Error::config("empty createrepo command"));
        };
        let args = self.arguments(dir, task);
        info!("Running {} {}", program, args.join(" "));

        let output = process_utils::tokio_command(program)
            .args(&args)
            .output()
            .await
            .map_err(|e| Error::Createrepo {
                dir: dir.display().to_string(),
                detail: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Createrepo {
                dir: dir.display().to_string(),
                detail: format!("{}: {}", output.status, stderr.trim()),
            });
        }
        debug!("createrepo in {} done", dir.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> BatchTask {
        BatchTask {
            add: vec!["00001-foo".to_string(), "00002-bar".to_string()],
            rpms_to_remove: vec!["x.rpm".to_string()],
            appstream: false,
            ..BatchTask::default()
        }
    }

    #[test]
    fn test_arguments() {
        let runner = CommandCreaterepo::new("copr-repo --log-to-stdout");
        assert_eq!(
            runner.arguments(Path::new("/results/alice/foo/fedora-39-x86_64"), &task()),
            vec![
                "--log-to-stdout",
                "--no-appstream",
                "--add",
                "00001-foo",
                "--add",
                "00002-bar",
                "--rpms-to-remove",
                "x.rpm",
                "/results/alice/foo/fedora-39-x86_64",
            ]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exit_status() {
        let dir = Path::new("/tmp");
        CommandCreaterepo::new("true").run(dir, &task()).await.unwrap();
        let err = CommandCreaterepo::new("false").run(dir, &task()).await.unwrap_err();
        assert!(matches!(err, Error::Createrepo { .. }));
    }
}
