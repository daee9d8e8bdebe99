// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Spawning, credential hand-over and killing of worker processes.

use std::fs::OpenOptions;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::server::ApplicationState;

/// Spawn `executable` with a piped stdin. Output goes to `log_path` when set,
/// and is discarded otherwise.
pub(super) fn spawn(
    executable: &Path,
    args: &[String],
    log_path: Option<&Path>,
) -> std::io::Result<Child> {
    let mut cmd = Command::new(executable);
    cmd.args(args).stdin(Stdio::piped()).kill_on_drop(true);

    match log_path {
        Some(path) => {
            let log = OpenOptions::new().create(true).append(true).open(path)?;
            cmd.stdout(Stdio::from(log.try_clone()?));
            cmd.stderr(Stdio::from(log));
        }
        None => {
            cmd.stdout(Stdio::null());
            cmd.stderr(Stdio::null());
        }
    }

    debug!(executable = %executable.display(), ?args, "spawning worker");
    cmd.spawn()
}

/// Write the connection info to the child's stdin and close it.
pub(super) async fn hand_over(
    child: &mut Child,
    state: &ApplicationState,
    timeout: Duration,
) -> std::io::Result<()> {
    let Some(mut stdin) = child.stdin.take() else {
        return Err(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "worker stdin is not piped",
        ));
    };

    match tokio::time::timeout(timeout, state.write_conn_info(&mut stdin)).await {
        Ok(result) => result,
        Err(_) => Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "timed out writing connection info",
        )),
    }
    // stdin dropped here; the worker reads until EOF
}

/// Send SIGKILL to `pid`. A process that is already gone is not an error.
pub(super) fn kill(pid: u32) -> std::io::Result<()> {
    send_signal(pid, Signal::SIGKILL)
}

/// Ask `pid` to exit with SIGTERM.
pub(super) fn terminate(pid: u32) -> std::io::Result<()> {
    send_signal(pid, Signal::SIGTERM)
}

fn send_signal(pid: u32, sig: Signal) -> std::io::Result<()> {
    let Ok(raw) = i32::try_from(pid) else {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("invalid pid {}", pid),
        ));
    };
    match signal::kill(Pid::from_raw(raw), sig) {
        Ok(()) => {
            debug!(pid, signal = ?sig, "signal sent");
            Ok(())
        }
        Err(nix::errno::Errno::ESRCH) => {
            debug!(pid, "process already dead");
            Ok(())
        }
        Err(e) => {
            warn!(pid, signal = ?sig, error = %e, "failed to send signal");
            Err(std::io::Error::from(e))
        }
    }
}

/// Human-readable exit, e.g. "exit code 1" or "signal 9".
pub(super) fn describe_exit(status: &ExitStatus) -> String {
    if let Some(code) = status.code() {
        return format!("exit code {}", code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return format!("signal {}", sig);
        }
    }
    "unknown status".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_describe_exit() {
        let status = Command::new("/bin/sh")
            .args(["-c", "exit 3"])
            .status()
            .await
            .unwrap();
        assert_eq!(describe_exit(&status), "exit code 3");
    }

    #[tokio::test]
    async fn test_kill_reports_signal() {
        let mut child = spawn(Path::new("/bin/sleep"), &["30".to_string()], None).unwrap();
        kill(child.id().unwrap()).unwrap();
        let status = child.wait().await.unwrap();
        assert_eq!(describe_exit(&status), "signal 9");
    }

    #[tokio::test]
    async fn test_terminate_reports_signal() {
        let mut child = spawn(Path::new("/bin/sleep"), &["30".to_string()], None).unwrap();
        terminate(child.id().unwrap()).unwrap();
        let status = child.wait().await.unwrap();
        assert_eq!(describe_exit(&status), "signal 15");
    }

    #[tokio::test]
    async fn test_spawn_writes_log_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let log = tmp.path().join("worker.log");
        let mut child = spawn(
            Path::new("/bin/sh"),
            &["-c".to_string(), "echo hello".to_string()],
            Some(&log),
        )
        .unwrap();
        child.wait().await.unwrap();
        assert_eq!(std::fs::read_to_string(&log).unwrap().trim(), "hello");
    }
}
