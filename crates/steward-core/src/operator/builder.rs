// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Builder for [`Operator`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use steward_protocol::proto::StateObservedStatus;
use tokio_util::sync::CancellationToken;

use super::{Operator, ProgramRegistry};
use crate::application::ProcessConfig;
use crate::artifact::{Downloader, InstallerChecker, Layout, Uninstaller, Verifier};
use crate::error::{Error, Result};
use crate::monitor::{Monitor, NoopMonitor};
use crate::reporter::{LogReporter, Reporter};
use crate::resolver::StateResolver;
use crate::retry::RetryConfig;
use crate::server::Server;

/// Builder for creating an [`Operator`].
pub struct OperatorBuilder {
    server: Option<Arc<Server>>,
    layout: Option<Layout>,
    programs: ProgramRegistry,
    pipeline_id: String,
    retry: RetryConfig,
    process: ProcessConfig,
    downloader: Option<Arc<dyn Downloader>>,
    verifier: Option<Arc<dyn Verifier>>,
    installer: Option<Arc<dyn InstallerChecker>>,
    uninstaller: Option<Arc<dyn Uninstaller>>,
    monitor: Arc<dyn Monitor>,
    reporter: Arc<dyn Reporter>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for OperatorBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperatorBuilder")
            .field("layout", &self.layout)
            .field("programs", &self.programs)
            .field("pipeline_id", &self.pipeline_id)
            .field("retry", &self.retry)
            .field("process", &self.process)
            .finish_non_exhaustive()
    }
}

impl Default for OperatorBuilder {
    fn default() -> Self {
        Self {
            server: None,
            layout: None,
            programs: ProgramRegistry::new(),
            pipeline_id: "default".to_string(),
            retry: RetryConfig::default(),
            process: ProcessConfig::default(),
            downloader: None,
            verifier: None,
            installer: None,
            uninstaller: None,
            monitor: Arc::new(NoopMonitor),
            reporter: Arc::new(LogReporter),
            cancel: CancellationToken::new(),
        }
    }
}

impl OperatorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Control-plane server applications register with (required).
    pub fn server(mut self, server: Arc<Server>) -> Self {
        self.server = Some(server);
        self
    }

    /// Download and install layout (required).
    pub fn layout(mut self, layout: Layout) -> Self {
        self.layout = Some(layout);
        self
    }

    pub fn programs(mut self, programs: ProgramRegistry) -> Self {
        self.programs = programs;
        self
    }

    /// Default: `default`
    pub fn pipeline_id(mut self, pipeline_id: impl Into<String>) -> Self {
        self.pipeline_id = pipeline_id.into();
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn process(mut self, process: ProcessConfig) -> Self {
        self.process = process;
        self
    }

    pub fn downloader(mut self, downloader: Arc<dyn Downloader>) -> Self {
        self.downloader = Some(downloader);
        self
    }

    pub fn verifier(mut self, verifier: Arc<dyn Verifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    pub fn installer(mut self, installer: Arc<dyn InstallerChecker>) -> Self {
        self.installer = Some(installer);
        self
    }

    pub fn uninstaller(mut self, uninstaller: Arc<dyn Uninstaller>) -> Self {
        self.uninstaller = Some(uninstaller);
        self
    }

    /// Default: [`NoopMonitor`]
    pub fn monitor(mut self, monitor: Arc<dyn Monitor>) -> Self {
        self.monitor = monitor;
        self
    }

    /// Default: [`LogReporter`]
    pub fn reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Root token; cancelling it stops every application.
    pub fn cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Returns an error if a required collaborator is missing.
    pub fn build(self) -> Result<Arc<Operator>> {
        fn required<T>(value: Option<T>, name: &str) -> Result<T> {
            value.ok_or_else(|| Error::Config(format!("{} is required", name)))
        }

        Ok(Arc::new(Operator {
            server: required(self.server, "server")?,
            layout: required(self.layout, "layout")?,
            downloader: required(self.downloader, "downloader")?,
            verifier: required(self.verifier, "verifier")?,
            installer: required(self.installer, "installer")?,
            uninstaller: required(self.uninstaller, "uninstaller")?,
            programs: self.programs,
            pipeline_id: self.pipeline_id,
            retry: self.retry,
            process: self.process,
            monitor: self.monitor,
            reporter: self.reporter,
            resolver: StateResolver::new(),
            apps: Mutex::new(HashMap::new()),
            status: Mutex::new((
                StateObservedStatus::Starting,
                "Waiting for configuration".to_string(),
            )),
            state_id: Mutex::new(None),
            cancel: self.cancel,
        }))
    }
}
