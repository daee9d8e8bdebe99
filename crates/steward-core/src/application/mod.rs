// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Lifecycle of one supervised worker.
//!
//! An [`Application`] runs its worker either as a child process (the
//! connection info goes to the child's stdin) or as a pre-installed service
//! (the connection info is handed out on a loopback listener). Its [`State`]
//! follows the worker's check-ins; a supervisor task respawns the worker when
//! it crashes or reports Failed.

mod credentials;
mod process;
mod status;
mod supervisor;

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde_json::Value;
use steward_protocol::proto::{StateExpectedState, StateObservedStatus};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::descriptor::Descriptor;
use crate::error::{Error, Result};
use crate::monitor::Monitor;
use crate::reporter::{ReportQueue, Reporter};
use crate::retry::TokenBucket;
use crate::server::{ApplicationState, Server};
use crate::state::{ProcessInfo, State, Status};
use crate::sync::lock;

pub use status::ApplicationStatusHandler;

use credentials::CredentialsListener;
use supervisor::{RunHandle, SupervisorEvent};

/// Process supervision tuning
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    /// Graceful stop timeout before the worker is killed
    pub stop_timeout: Duration,
    /// How long handing the connection info to a new worker may take
    pub spawn_timeout: Duration,
    /// Restarts allowed back to back
    pub restart_burst: u32,
    /// One more restart is allowed per interval
    pub restart_refill: Duration,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            stop_timeout: Duration::from_secs(30),
            spawn_timeout: Duration::from_secs(30),
            restart_burst: 5,
            restart_refill: Duration::from_secs(10),
        }
    }
}

/// How the worker is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecMode {
    /// Spawned and reaped by the application.
    Process,
    /// Owned by the system service manager; picks up its connection info
    /// from a loopback listener on `port`.
    Service { port: u16 },
}

struct Inner {
    state: State,
    srv_state: Option<Arc<ApplicationState>>,
    /// Last configuration the worker accepted, as JSON.
    last_config: Option<String>,
    run: Option<RunHandle>,
    next_run_id: u64,
}

/// One supervised worker.
pub struct Application {
    id: String,
    name: String,
    pipeline_id: String,
    descriptor: Descriptor,
    mode: ExecMode,
    srv: Arc<Server>,
    monitor: Arc<dyn Monitor>,
    reports: ReportQueue,
    config: ProcessConfig,
    bg: CancellationToken,
    /// Serializes start, stop and restart.
    lifecycle: tokio::sync::Mutex<()>,
    inner: Mutex<Inner>,
    events: mpsc::UnboundedSender<SupervisorEvent>,
    restarts: TokenBucket,
    me: Weak<Application>,
}

impl std::fmt::Debug for Application {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Application")
            .field("id", &self.id)
            .field("mode", &self.mode)
            .field("status", &self.state().status)
            .finish_non_exhaustive()
    }
}

impl Application {
    /// Create a stopped application and spawn its supervisor task.
    ///
    /// `bg` is the owner's background token: cancelling it stops the worker
    /// and ends the supervisor.
    pub fn new(
        descriptor: Descriptor,
        pipeline_id: impl Into<String>,
        srv: Arc<Server>,
        monitor: Arc<dyn Monitor>,
        reporter: Arc<dyn Reporter>,
        config: ProcessConfig,
        bg: CancellationToken,
    ) -> Arc<Self> {
        let (events, rx) = mpsc::unbounded_channel();
        let mode = match descriptor.service_port() {
            Some(port) => ExecMode::Service { port },
            None => ExecMode::Process,
        };

        let reports = ReportQueue::spawn(
            reporter,
            descriptor.id().to_string(),
            descriptor.spec().name.clone(),
        );

        let app = Arc::new_cyclic(|me| Self {
            id: descriptor.id().to_string(),
            name: descriptor.spec().name.clone(),
            pipeline_id: pipeline_id.into(),
            descriptor,
            mode,
            srv,
            monitor,
            reports,
            restarts: TokenBucket::new(config.restart_burst, config.restart_refill),
            config,
            bg,
            lifecycle: tokio::sync::Mutex::new(()),
            inner: Mutex::new(Inner {
                state: State::default(),
                srv_state: None,
                last_config: None,
                run: None,
                next_run_id: 1,
            }),
            events,
            me: me.clone(),
        });

        tokio::spawn(supervisor::supervise(
            Arc::downgrade(&app),
            rx,
            app.bg.clone(),
        ));
        app
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    pub fn mode(&self) -> ExecMode {
        self.mode
    }

    /// Snapshot of the current state.
    pub fn state(&self) -> State {
        lock(&self.inner).state.clone()
    }

    /// Control-plane registration of the running worker.
    pub fn server_state(&self) -> Option<Arc<ApplicationState>> {
        lock(&self.inner).srv_state.clone()
    }

    /// Overwrite status and message, keeping process info and payload.
    pub fn set_state(&self, status: Status, message: impl Into<String>) {
        let snapshot = {
            let mut inner = lock(&self.inner);
            inner.state.status = status;
            inner.state.message = message.into();
            inner.state.clone()
        };
        self.report_state(snapshot);
    }

    /// Whether a worker run is active: a spawned process, or an open
    /// credentials listener for a service.
    pub fn is_running(&self) -> bool {
        lock(&self.inner).run.is_some()
    }

    /// Start the worker with `config`.
    ///
    /// A no-op while a run is active, so starting twice spawns one worker.
    #[instrument(skip(self, config), fields(app_id = %self.id))]
    pub async fn start(&self, config: &Value) -> Result<()> {
        let config = serde_json::to_string(config)?;
        let _guard = self.lifecycle.lock().await;
        self.start_locked(config).await
    }

    /// Stop the worker. A no-op when already stopped.
    #[instrument(skip(self), fields(app_id = %self.id))]
    pub async fn stop(&self) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        self.stop_locked().await
    }

    /// Push `config` to the running worker.
    ///
    /// Fails with [`Error::AppNotRunning`] when stopped. On failure the
    /// previously accepted configuration stays in effect.
    #[instrument(skip(self, config), fields(app_id = %self.id))]
    pub async fn configure(&self, config: &Value) -> Result<()> {
        let config = serde_json::to_string(config)?;
        let srv_state = {
            let inner = lock(&self.inner);
            if inner.state.status == Status::STOPPED {
                return Err(Error::AppNotRunning(self.id.clone()));
            }
            inner.srv_state.clone()
        };
        let Some(srv_state) = srv_state else {
            return Err(Error::AppNotRunning(self.id.clone()));
        };

        srv_state.update_config(config.clone())?;
        lock(&self.inner).last_config = Some(config);
        debug!(config_idx = srv_state.expected_config_idx(), "configuration pushed");
        Ok(())
    }

    /// Run an action on the connected worker.
    pub async fn perform_action(&self, name: &str, params: Value) -> Result<Value> {
        let srv_state = self
            .server_state()
            .ok_or_else(|| Error::AppNotRunning(self.id.clone()))?;
        let timeout = self.srv.config().action_timeout;
        Ok(srv_state.perform_action(name, params, timeout).await?)
    }

    async fn start_locked(&self, config: String) -> Result<()> {
        {
            let mut inner = lock(&self.inner);
            if inner.run.is_some() {
                debug!(status = %inner.state.status, "already running");
                return Ok(());
            }
            inner.state = State::new(Status::STARTING, "Starting");
            inner.last_config = Some(config.clone());
        }
        self.report_state(self.state());

        match self.launch(config).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(error = %e, "failed to start application");
                self.set_state(Status::FAILED, e.to_string());
                Err(e)
            }
        }
    }

    async fn launch(&self, config: String) -> Result<()> {
        let srv_state = self.ensure_registered(config)?;

        let uid = nix::unistd::getuid().as_raw();
        let gid = nix::unistd::getgid().as_raw();
        self.monitor
            .prepare(&self.name, &self.pipeline_id, uid, gid)
            .await?;

        let run_id = {
            let mut inner = lock(&self.inner);
            let id = inner.next_run_id;
            inner.next_run_id += 1;
            id
        };

        let run = match self.mode {
            ExecMode::Process => {
                let args = self.monitor.enrich_args(
                    &self.name,
                    &self.pipeline_id,
                    self.descriptor.spec().args.clone(),
                    self.descriptor.is_sidecar(),
                );
                let log_path = self.monitor.log_path(&self.name, &self.pipeline_id);
                let mut child =
                    process::spawn(&self.descriptor.executable_path(), &args, log_path.as_deref())
                        .map_err(|e| Error::application(&self.id, e))?;
                let pid = child.id();

                if let Err(e) =
                    process::hand_over(&mut child, &srv_state, self.config.spawn_timeout).await
                {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    return Err(Error::application(&self.id, e));
                }

                info!(pid = ?pid, "worker process spawned");
                RunHandle::process(
                    run_id,
                    child,
                    self.events.clone(),
                    self.config.stop_timeout,
                )
            }
            ExecMode::Service { port } => {
                let listener =
                    CredentialsListener::bind(port, srv_state.clone(), self.config.spawn_timeout)
                        .await
                        .map_err(|e| Error::application(&self.id, e))?;
                info!(addr = %listener.local_addr(), "credentials listener opened");
                RunHandle::service(run_id, listener)
            }
        };

        let mut inner = lock(&self.inner);
        inner.state.process_info = run.pid().map(|pid| ProcessInfo { pid });
        inner.run = Some(run);
        Ok(())
    }

    /// Reuse the live registration after a restart, or register anew.
    fn ensure_registered(&self, config: String) -> Result<Arc<ApplicationState>> {
        let existing = lock(&self.inner)
            .srv_state
            .clone()
            .filter(|s| !s.is_destroyed());

        if let Some(state) = existing {
            // streams of the previous worker must not block the new one
            state.drop_sessions();
            state.update_config(config)?;
            state.set_status(StateObservedStatus::Starting, "Starting", None);
            return Ok(state);
        }

        let me: Arc<dyn std::any::Any + Send + Sync> = self
            .me
            .upgrade()
            .ok_or_else(|| Error::application(&self.id, "application dropped"))?;
        let state = self.srv.register(me, config)?;
        lock(&self.inner).srv_state = Some(state.clone());
        Ok(state)
    }

    async fn stop_locked(&self) -> Result<()> {
        let (srv_state, run) = {
            let mut inner = lock(&self.inner);
            if inner.state.status == Status::STOPPED {
                return Ok(());
            }
            inner.state.status = Status::STOPPING;
            inner.state.message = "Stopping".to_string();
            (inner.srv_state.take(), inner.run.take())
        };
        self.report_state(self.state());

        let mut errors = Vec::new();
        // a worker that never connected cannot be asked to stop
        let mut graceful = false;
        if let Some(srv_state) = srv_state {
            let connected = srv_state.is_connected();
            match srv_state.stop(self.config.stop_timeout).await {
                Ok(()) => graceful = connected,
                Err(e) => warn!(error = %e, "graceful stop failed, killing worker"),
            }
        }

        if let Some(run) = run
            && let Err(e) = run.shutdown(!graceful).await
        {
            errors.push(Error::application(&self.id, e));
        }

        if let Err(e) = self.monitor.cleanup(&self.name, &self.pipeline_id).await {
            errors.push(e);
        }

        let snapshot = {
            let mut inner = lock(&self.inner);
            inner.state = State::new(Status::STOPPED, "Stopped");
            inner.state.clone()
        };
        self.report_state(snapshot);
        info!("application stopped");

        Error::from_many(errors)
    }

    /// Start again with the last configuration. With `kill` the current run
    /// is killed first; without it an active run means someone else already
    /// started the worker.
    ///
    /// Skipped when the application was stopped in the meantime.
    async fn restart(&self, reason: &str, kill: bool) -> Result<()> {
        let _guard = self.lifecycle.lock().await;

        let (run, config) = {
            let mut inner = lock(&self.inner);
            if inner.state.status == Status::STOPPED {
                debug!("stopped before restart");
                return Ok(());
            }
            if !kill && inner.run.is_some() {
                debug!("already restarted");
                return Ok(());
            }
            inner.state = State::new(Status::RESTARTING, reason);
            (inner.run.take(), inner.last_config.clone())
        };
        self.report_state(self.state());

        if let Some(run) = run
            && let Err(e) = run.shutdown(true).await
        {
            warn!(error = %e, "failed to kill worker before restart");
        }
        self.spawn_cleanup();

        self.start_locked(config.unwrap_or_else(|| "null".to_string()))
            .await
    }

    /// Handle the exit of run `run_id`. Returns true when it was a crash that
    /// needs a respawn.
    async fn handle_exit(&self, run_id: u64, description: &str) -> bool {
        let _guard = self.lifecycle.lock().await;

        let (snapshot, srv_state) = {
            let mut inner = lock(&self.inner);
            if inner.run.as_ref().map(RunHandle::id) != Some(run_id) {
                return false;
            }
            inner.run = None;
            inner.state.process_info = None;

            let stopping = inner
                .srv_state
                .as_ref()
                .is_some_and(|s| s.expected() == StateExpectedState::Stopping);
            if stopping || inner.state.status == Status::STOPPED {
                return false;
            }
            inner.state.status = Status::CRASHED;
            inner.state.message = format!("Exited with {}", description);
            (inner.state.clone(), inner.srv_state.clone())
        };

        warn!(app_id = %self.id, exit = description, "worker crashed");
        if let Some(srv_state) = srv_state {
            srv_state.drop_sessions();
        }
        self.report_state(snapshot);
        self.report_failure(format!("worker exited with {}", description));
        true
    }

    fn spawn_cleanup(&self) {
        let monitor = self.monitor.clone();
        let name = self.name.clone();
        let pipeline_id = self.pipeline_id.clone();
        tokio::spawn(async move {
            if let Err(e) = monitor.cleanup(&name, &pipeline_id).await {
                warn!(app_name = %name, error = %e, "monitor cleanup failed");
            }
        });
    }

    fn report_state(&self, state: State) {
        self.reports.state(state);
    }

    fn report_failure(&self, message: String) {
        self.reports.failure(message);
    }
}
