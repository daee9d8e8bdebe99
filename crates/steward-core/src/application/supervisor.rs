// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-application supervisor task and the handles of individual runs.
//!
//! Every run of a process-mode worker gets a watcher task that reaps the
//! child. When the child exits on its own the watcher sends
//! [`SupervisorEvent::Exited`]; the supervisor decides whether that was a
//! crash and respawns the worker, rate limited by the application's restart
//! bucket. A worker reporting Failed arrives as [`SupervisorEvent::Restart`].

use std::sync::Weak;
use std::time::Duration;

use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::Application;
use super::credentials::CredentialsListener;
use super::process;

#[derive(Debug)]
pub(super) enum SupervisorEvent {
    /// Run `run_id` exited without being asked to.
    Exited { run_id: u64, description: String },
    /// Kill the current run and start again.
    Restart { reason: String },
}

/// One start of the worker.
#[derive(Debug)]
pub(super) struct RunHandle {
    id: u64,
    kind: RunKind,
}

#[derive(Debug)]
enum RunKind {
    Process {
        pid: Option<u32>,
        stop: CancellationToken,
        watcher: JoinHandle<()>,
    },
    Service {
        listener: CredentialsListener,
    },
}

impl RunHandle {
    /// Watch `child`; on stop it gets SIGTERM and `grace` to exit before it
    /// is killed.
    pub(super) fn process(
        id: u64,
        child: Child,
        events: mpsc::UnboundedSender<SupervisorEvent>,
        grace: Duration,
    ) -> Self {
        let pid = child.id();
        let stop = CancellationToken::new();
        let watcher = tokio::spawn(watch(id, child, events, stop.clone(), grace));
        Self {
            id,
            kind: RunKind::Process { pid, stop, watcher },
        }
    }

    pub(super) fn service(id: u64, listener: CredentialsListener) -> Self {
        Self {
            id,
            kind: RunKind::Service { listener },
        }
    }

    pub(super) fn id(&self) -> u64 {
        self.id
    }

    pub(super) fn pid(&self) -> Option<u32> {
        match &self.kind {
            RunKind::Process { pid, .. } => *pid,
            RunKind::Service { .. } => None,
        }
    }

    /// End the run. With `force` the process is killed right away, otherwise
    /// it gets its grace period first. Returns once the process is reaped.
    pub(super) async fn shutdown(self, force: bool) -> std::io::Result<()> {
        match self.kind {
            RunKind::Process { pid, stop, watcher } => {
                let mut result = Ok(());
                if force && let Some(pid) = pid {
                    result = process::kill(pid);
                }
                stop.cancel();
                if let Err(e) = watcher.await {
                    warn!(error = %e, "process watcher failed");
                }
                result
            }
            RunKind::Service { listener } => {
                listener.close().await;
                Ok(())
            }
        }
    }
}

async fn watch(
    run_id: u64,
    mut child: Child,
    events: mpsc::UnboundedSender<SupervisorEvent>,
    stop: CancellationToken,
    grace: Duration,
) {
    let pid = child.id();

    let exited = tokio::select! {
        biased;

        status = child.wait() => Some(status),

        _ = stop.cancelled() => None,
    };

    match exited {
        Some(status) => {
            let description = match status {
                Ok(status) => process::describe_exit(&status),
                Err(e) => format!("unknown status ({})", e),
            };
            debug!(?pid, run_id, exit = %description, "worker exited");
            // the supervisor may be gone already
            let _ = events.send(SupervisorEvent::Exited {
                run_id,
                description,
            });
        }
        None => {
            if let Some(pid) = pid {
                let _ = process::terminate(pid);
            }
            if tokio::time::timeout(grace, child.wait()).await.is_err() {
                warn!(?pid, "worker did not exit after stop, killing");
                if let Some(pid) = pid {
                    let _ = process::kill(pid);
                }
                let _ = child.wait().await;
            }
            debug!(?pid, run_id, "worker reaped after stop");
        }
    }
}

/// Supervisor loop of one application. Ends when the application is dropped
/// or `bg` is cancelled, in which case the application is stopped first.
pub(super) async fn supervise(
    app: Weak<Application>,
    mut events: mpsc::UnboundedReceiver<SupervisorEvent>,
    bg: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;

            _ = bg.cancelled() => {
                if let Some(app) = app.upgrade()
                    && let Err(e) = app.stop().await
                {
                    warn!(app_id = %app.id(), error = %e, "failed to stop application on shutdown");
                }
                break;
            }

            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        let Some(app) = app.upgrade() else {
            break;
        };

        let (reason, kill) = match event {
            SupervisorEvent::Exited {
                run_id,
                description,
            } => {
                if !app.handle_exit(run_id, &description).await {
                    continue;
                }
                (format!("Restarting after {}", description), false)
            }
            SupervisorEvent::Restart { reason } => (reason, true),
        };

        if app.restarts.acquire(&bg).await.is_err() {
            continue;
        }
        info!(app_id = %app.id(), reason = %reason, "restarting application");
        if let Err(e) = app.restart(&reason, kill).await {
            warn!(app_id = %app.id(), error = %e, "restart failed");
        }
    }
    debug!("supervisor stopped");
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;

    fn sh(script: &str) -> Child {
        process::spawn(
            Path::new("/bin/sh"),
            &["-c".to_string(), script.to_string()],
            None,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_graceful_shutdown_sends_sigterm() {
        let dir = tempfile::TempDir::new().unwrap();
        let marker = dir.path().join("term");
        let child = sh(&format!(
            "trap 'touch {}; exit 0' TERM; while true; do sleep 0.1; done",
            marker.display()
        ));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let run = RunHandle::process(1, child, tx, Duration::from_secs(5));

        // give the shell time to install its trap
        tokio::time::sleep(Duration::from_millis(200)).await;
        run.shutdown(false).await.unwrap();

        assert!(marker.exists());
        // a requested stop is not reported as an exit
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_worker_ignoring_sigterm_is_killed_after_grace() {
        let child = sh("trap '' TERM; while true; do sleep 0.1; done");
        let pid = child.id().unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let run = RunHandle::process(1, child, tx, Duration::from_millis(300));

        tokio::time::sleep(Duration::from_millis(200)).await;
        run.shutdown(false).await.unwrap();

        let gone = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None).is_err();
        assert!(gone);
    }

    #[tokio::test]
    async fn test_unexpected_exit_is_reported() {
        let child = sh("exit 4");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _run = RunHandle::process(7, child, tx, Duration::from_secs(1));

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            SupervisorEvent::Exited {
                run_id,
                description,
            } => {
                assert_eq!(run_id, 7);
                assert_eq!(description, "exit code 4");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
