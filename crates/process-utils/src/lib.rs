//! Small process-related helpers shared across the workspace.
//!
//! The backend never waits for the processes it starts: children are detached
//! into their own process group and a background task reaps them, while
//! liveness is answered out-of-band by [`pid_alive`].

use std::ffi::OsStr;
use std::process::Stdio;

use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System};

/// Return `true` when a process with the given PID exists and is not a zombie.
pub fn pid_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }

    let pid = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[pid]),
        true,
        ProcessRefreshKind::nothing(),
    );

    match system.process(pid) {
        Some(process) => !matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead),
        None => false,
    }
}

/// PID of the process that started the current one.
pub fn parent_pid() -> Option<u32> {
    let own = Pid::from_u32(std::process::id());
    let mut system = System::new();
    system.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[own]),
        true,
        ProcessRefreshKind::nothing(),
    );
    system.process(own)?.parent().map(Pid::as_u32)
}

/// Create a `tokio::process::Command` with stdio detached from the caller.
#[cfg(feature = "tokio")]
pub fn tokio_command(program: impl AsRef<OsStr>) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new(program);
    cmd.stdin(Stdio::null());
    cmd
}

/// Start `argv[0]` with the remaining arguments as a detached background process.
///
/// The child gets its own process group so it survives the caller's terminal
/// signals. A reaper task collects the exit status; nothing ever blocks on it.
/// Returns the PID of the started process.
#[cfg(feature = "tokio")]
pub fn spawn_detached<S: AsRef<OsStr>>(argv: &[S], envs: &[(String, String)]) -> std::io::Result<u32> {
    let Some((program, args)) = argv.split_first() else {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "empty command line",
        ));
    };

    let mut cmd = tokio_command(program);
    cmd.args(args)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(false);
    for (key, value) in envs {
        cmd.env(key, value);
    }
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd.spawn()?;
    let pid = child.id().unwrap_or_default();
    tracing::debug!(pid, "background process started");

    tokio::spawn(async move {
        match child.wait().await {
            Ok(status) => tracing::debug!(pid, %status, "background process reaped"),
            Err(e) => tracing::warn!(pid, error = %e, "failed to reap background process"),
        }
    });

    Ok(pid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_pid_is_alive() {
        assert!(pid_alive(std::process::id()));
    }

    #[test]
    fn parent_is_another_live_process() {
        let parent = parent_pid().unwrap();
        assert_ne!(parent, std::process::id());
        assert!(pid_alive(parent));
    }

    #[test]
    fn pid_zero_is_never_alive() {
        assert!(!pid_alive(0));
    }

    #[cfg(feature = "tokio")]
    #[tokio::test]
    async fn spawn_detached_rejects_empty_argv() {
        let argv: [&str; 0] = [];
        let err = spawn_detached(&argv, &[]).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
    }

    #[cfg(all(feature = "tokio", unix))]
    #[tokio::test]
    async fn spawn_detached_returns_pid() {
        let pid = spawn_detached(&["sleep", "0.1"], &[]).unwrap();
        assert!(pid > 0);
    }
}
