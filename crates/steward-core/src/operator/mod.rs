// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Orchestration of applications.
//!
//! The [`Operator`] turns configuration requests into steps (through the
//! [`StateResolver`]) and every step into a flow of [`Operation`]s run
//! against the [`Application`] for the step's descriptor:
//!
//! | Flow      | Operations                                         |
//! |-----------|----------------------------------------------------|
//! | start     | retryable(fetch, verify, install), start, configure |
//! | stop      | stop                                               |
//! | uninstall | stop, uninstall, remove                            |
//!
//! Applications live in a registry keyed by [`Descriptor::id`]. Flows for
//! one id are serialized by a per-entry lock; an application that ends a
//! flow Stopped is dropped from the registry under that lock.

mod builder;
mod programs;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use steward_protocol::proto::StateObservedStatus;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::application::{Application, ProcessConfig};
use crate::artifact::{Downloader, InstallerChecker, Layout, Uninstaller, Verifier};
use crate::descriptor::Descriptor;
use crate::error::{Error, Result};
use crate::monitor::Monitor;
use crate::operation::{
    ConfigureOperation, FetchOperation, InstallOperation, Operation, RemoveOperation,
    RetryableOperations, StartOperation, StopOperation, UninstallOperation, VerifyOperation,
    run_operations,
};
use crate::reporter::Reporter;
use crate::resolver::{ConfigRequest, StateResolver, Step, StepId};
use crate::retry::RetryConfig;
use crate::server::Server;
use crate::state::{State, Status};
use crate::sync::lock;

pub use builder::OperatorBuilder;
pub use programs::ProgramRegistry;

/// Registry entry: the application plus the lock its flows run under.
struct Entry {
    app: Arc<Application>,
    flow: tokio::sync::Mutex<()>,
}

/// Runs applications to match the requested configuration.
pub struct Operator {
    server: Arc<Server>,
    layout: Layout,
    programs: ProgramRegistry,
    pipeline_id: String,
    retry: RetryConfig,
    process: ProcessConfig,
    downloader: Arc<dyn Downloader>,
    verifier: Arc<dyn Verifier>,
    installer: Arc<dyn InstallerChecker>,
    uninstaller: Arc<dyn Uninstaller>,
    monitor: Arc<dyn Monitor>,
    reporter: Arc<dyn Reporter>,
    resolver: StateResolver,
    apps: Mutex<HashMap<String, Arc<Entry>>>,
    status: Mutex<(StateObservedStatus, String)>,
    state_id: Mutex<Option<String>>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Operator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Operator")
            .field("pipeline_id", &self.pipeline_id)
            .field("programs", &self.programs)
            .field("apps", &lock(&self.apps).len())
            .finish_non_exhaustive()
    }
}

impl Operator {
    pub fn builder() -> OperatorBuilder {
        OperatorBuilder::new()
    }

    pub fn server(&self) -> &Arc<Server> {
        &self.server
    }

    pub fn programs(&self) -> &ProgramRegistry {
        &self.programs
    }

    /// Apply a configuration request.
    ///
    /// Every step is attempted; the resolved state is acknowledged only when
    /// all of them succeed, so failed steps are resolved again next time.
    #[instrument(skip(self, request), fields(request_id = %request.id))]
    pub async fn handle_config(&self, request: &ConfigRequest) -> Result<()> {
        let (id, steps, ack) = match self.resolver.resolve(request) {
            Ok(resolved) => resolved,
            Err(e) => {
                self.set_status(StateObservedStatus::Failed, e.to_string());
                return Err(e);
            }
        };
        *lock(&self.state_id) = Some(id);
        info!(steps = steps.len(), "applying configuration");

        let mut errors = Vec::new();
        for step in &steps {
            if let Err(e) = self.handle_step(step).await {
                error!(step = %step.id, program = %step.program, error = %e, "step failed");
                errors.push(e);
            }
        }

        match Error::from_many(errors) {
            Ok(()) => {
                ack.ack();
                self.set_status(StateObservedStatus::Healthy, "Running");
                Ok(())
            }
            Err(e) => {
                self.set_status(StateObservedStatus::Failed, e.to_string());
                Err(e)
            }
        }
    }

    async fn handle_step(&self, step: &Step) -> Result<()> {
        let descriptor = self.descriptor(&step.program, &step.version, &step.tags)?;
        debug!(step = %step.id, app_id = %descriptor.id(), "handling step");
        match step.id {
            StepId::Run => self.start(descriptor, step.config()).await,
            StepId::Remove if step.uninstall() => self.uninstall(descriptor).await,
            StepId::Remove => self.stop(descriptor).await,
        }
    }

    /// Descriptor of a registered program.
    pub fn descriptor<I, S>(&self, program: &str, version: &str, tags: I) -> Result<Descriptor>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let spec = self
            .programs
            .get(program)
            .ok_or_else(|| Error::application(program, "unknown program"))?;
        Ok(Descriptor::new(spec.clone(), version, tags, &self.layout))
    }

    /// Bring the application for `descriptor` up with `config`.
    pub async fn start(&self, descriptor: Descriptor, config: Value) -> Result<()> {
        let flow: Vec<Box<dyn Operation>> = vec![
            Box::new(RetryableOperations::new(
                self.retry.clone(),
                vec![
                    Box::new(FetchOperation::new(self.downloader.clone())),
                    Box::new(VerifyOperation::new(self.verifier.clone())),
                    Box::new(InstallOperation::new(self.installer.clone())),
                ],
            )),
            Box::new(StartOperation::new(config.clone())),
            Box::new(ConfigureOperation::new(config)),
        ];
        self.run_flow(descriptor, flow).await
    }

    /// Stop the application for `descriptor`.
    pub async fn stop(&self, descriptor: Descriptor) -> Result<()> {
        self.run_flow(descriptor, vec![Box::new(StopOperation::new())])
            .await
    }

    /// Stop the application for `descriptor` and remove its installation and
    /// artifact.
    pub async fn uninstall(&self, descriptor: Descriptor) -> Result<()> {
        let flow: Vec<Box<dyn Operation>> = vec![
            Box::new(StopOperation::new()),
            Box::new(UninstallOperation::new(self.uninstaller.clone())),
            Box::new(RemoveOperation::new()),
        ];
        self.run_flow(descriptor, flow).await
    }

    /// Push `config` to the running application for `descriptor`.
    pub async fn push_config(&self, descriptor: &Descriptor, config: Value) -> Result<()> {
        let Some(entry) = lock(&self.apps).get(descriptor.id()).cloned() else {
            return Err(Error::AppNotRunning(descriptor.id().to_string()));
        };
        let _flow = entry.flow.lock().await;
        if !self.is_registered(descriptor.id(), &entry) {
            return Err(Error::AppNotRunning(descriptor.id().to_string()));
        }
        let flow: Vec<Box<dyn Operation>> = vec![Box::new(ConfigureOperation::new(config))];
        run_operations(&self.cancel, &entry.app, &flow).await
    }

    /// Stop every live application.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> Result<()> {
        let descriptors: Vec<Descriptor> = lock(&self.apps)
            .values()
            .map(|e| e.app.descriptor().clone())
            .collect();
        info!(apps = descriptors.len(), "stopping all applications");

        let mut errors = Vec::new();
        for descriptor in descriptors {
            if let Err(e) = self.stop(descriptor).await {
                warn!(error = %e, "failed to stop application");
                errors.push(e);
            }
        }
        Error::from_many(errors)
    }

    /// Operator health: Healthy once a configuration was fully applied,
    /// Failed with the cause otherwise.
    pub fn status(&self) -> (StateObservedStatus, String) {
        lock(&self.status).clone()
    }

    /// Id of the last handled configuration request.
    pub fn state_id(&self) -> Option<String> {
        lock(&self.state_id).clone()
    }

    /// Snapshot of every live application's state, by application id.
    pub fn app_states(&self) -> HashMap<String, State> {
        lock(&self.apps)
            .iter()
            .map(|(id, entry)| (id.clone(), entry.app.state()))
            .collect()
    }

    /// Live application for `id`.
    pub fn app(&self, id: &str) -> Option<Arc<Application>> {
        lock(&self.apps).get(id).map(|e| e.app.clone())
    }

    fn set_status(&self, status: StateObservedStatus, message: impl Into<String>) {
        *lock(&self.status) = (status, message.into());
    }

    fn get_or_create(&self, descriptor: &Descriptor) -> Arc<Entry> {
        let mut apps = lock(&self.apps);
        if let Some(entry) = apps.get(descriptor.id()) {
            return entry.clone();
        }
        let app = Application::new(
            descriptor.clone(),
            self.pipeline_id.clone(),
            self.server.clone(),
            self.monitor.clone(),
            self.reporter.clone(),
            self.process.clone(),
            self.cancel.child_token(),
        );
        let entry = Arc::new(Entry {
            app,
            flow: tokio::sync::Mutex::new(()),
        });
        apps.insert(descriptor.id().to_string(), entry.clone());
        debug!(app_id = %descriptor.id(), "application registered");
        entry
    }

    fn is_registered(&self, id: &str, entry: &Arc<Entry>) -> bool {
        lock(&self.apps)
            .get(id)
            .is_some_and(|current| Arc::ptr_eq(current, entry))
    }

    /// Run `flow` under the entry's flow lock. An application left Stopped
    /// is removed from the registry before the lock is released.
    async fn run_flow(&self, descriptor: Descriptor, flow: Vec<Box<dyn Operation>>) -> Result<()> {
        loop {
            let entry = self.get_or_create(&descriptor);
            let _flow = entry.flow.lock().await;
            // removed while waiting for the lock
            if !self.is_registered(descriptor.id(), &entry) {
                continue;
            }

            let result = run_operations(&self.cancel, &entry.app, &flow).await;

            if entry.app.state().status == Status::STOPPED {
                let mut apps = lock(&self.apps);
                if apps
                    .get(descriptor.id())
                    .is_some_and(|current| Arc::ptr_eq(current, &entry))
                {
                    apps.remove(descriptor.id());
                    debug!(app_id = %descriptor.id(), "application removed");
                }
            }
            return result;
        }
    }
}
