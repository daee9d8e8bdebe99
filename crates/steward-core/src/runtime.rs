// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for steward.
//!
//! [`StewardRuntime`] wires the control-plane [`Server`] and the
//! [`Operator`] with filesystem collaborators, so steward can run inside an
//! existing tokio application instead of as the standalone binary.
//!
//! # Example
//!
//! ```rust,ignore
//! use steward_core::config::Config;
//! use steward_core::descriptor::ProgramSpec;
//! use steward_core::runtime::StewardRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = StewardRuntime::builder()
//!         .config(Config::from_env()?)
//!         .program(ProgramSpec::new("filebeat", "filebeat"))
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     // ... hand configuration requests to runtime.operator() ...
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::application::ApplicationStatusHandler;
use crate::artifact::{CopyInstaller, DirUninstaller, FsDownloader, Layout, Sha512Verifier};
use crate::config::Config;
use crate::descriptor::ProgramSpec;
use crate::monitor::{LogDirMonitor, Monitor};
use crate::operator::{Operator, ProgramRegistry};
use crate::reporter::{LogReporter, Reporter};
use crate::server::Server;

/// Builder for creating a [`StewardRuntime`].
pub struct StewardRuntimeBuilder {
    config: Option<Config>,
    programs: ProgramRegistry,
    monitor: Option<Arc<dyn Monitor>>,
    reporter: Arc<dyn Reporter>,
}

impl std::fmt::Debug for StewardRuntimeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StewardRuntimeBuilder")
            .field("config", &self.config)
            .field("programs", &self.programs)
            .field("monitor", &self.monitor.as_ref().map(|_| "..."))
            .finish()
    }
}

impl Default for StewardRuntimeBuilder {
    fn default() -> Self {
        Self {
            config: None,
            programs: ProgramRegistry::new(),
            monitor: None,
            reporter: Arc::new(LogReporter),
        }
    }
}

impl StewardRuntimeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the configuration (required).
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Add a supported program.
    pub fn program(mut self, spec: ProgramSpec) -> Self {
        self.programs.register(spec);
        self
    }

    pub fn programs(mut self, programs: ProgramRegistry) -> Self {
        self.programs = programs;
        self
    }

    /// Default: [`LogDirMonitor`] over `<data>/logs`
    pub fn monitor(mut self, monitor: Arc<dyn Monitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Default: [`LogReporter`]
    pub fn reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<StewardRuntimeConfig> {
        let config = self
            .config
            .ok_or_else(|| anyhow::anyhow!("config is required"))?;
        let monitor = self
            .monitor
            .unwrap_or_else(|| Arc::new(LogDirMonitor::new(config.logs_dir())));

        Ok(StewardRuntimeConfig {
            config,
            programs: self.programs,
            monitor,
            reporter: self.reporter,
        })
    }
}

/// Configuration for a [`StewardRuntime`].
pub struct StewardRuntimeConfig {
    config: Config,
    programs: ProgramRegistry,
    monitor: Arc<dyn Monitor>,
    reporter: Arc<dyn Reporter>,
}

impl std::fmt::Debug for StewardRuntimeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StewardRuntimeConfig")
            .field("config", &self.config)
            .field("programs", &self.programs)
            .finish_non_exhaustive()
    }
}

impl StewardRuntimeConfig {
    /// Start the control-plane server and build the operator on top of it.
    pub async fn start(self) -> Result<StewardRuntime> {
        let config = self.config;
        for dir in [config.downloads_dir(), config.install_dir(), config.logs_dir()] {
            tokio::fs::create_dir_all(&dir).await?;
        }

        let server = Server::new(config.server.clone(), Arc::new(ApplicationStatusHandler))?;
        let addr = server.start().await?;

        let cancel = CancellationToken::new();
        let operator = Operator::builder()
            .server(server.clone())
            .layout(Layout::host(config.downloads_dir(), config.install_dir()))
            .programs(self.programs)
            .pipeline_id(config.pipeline_id.clone())
            .retry(config.retry.clone())
            .process(config.process.clone())
            .downloader(Arc::new(FsDownloader::new(config.drop_dir.clone())))
            .verifier(Arc::new(Sha512Verifier))
            .installer(Arc::new(CopyInstaller))
            .uninstaller(Arc::new(DirUninstaller))
            .monitor(self.monitor)
            .reporter(self.reporter)
            .cancellation(cancel.clone())
            .build()?;

        info!(%addr, programs = operator.programs().len(), "StewardRuntime started");

        Ok(StewardRuntime {
            server,
            operator,
            cancel,
            addr,
        })
    }
}

/// A running steward instance.
///
/// The runtime manages:
/// - the control-plane server workers check in with
/// - the operator and the applications it supervises
///
/// Call [`shutdown`](Self::shutdown) to stop every application and close the
/// server.
pub struct StewardRuntime {
    server: Arc<Server>,
    operator: Arc<Operator>,
    cancel: CancellationToken,
    addr: SocketAddr,
}

impl StewardRuntime {
    pub fn builder() -> StewardRuntimeBuilder {
        StewardRuntimeBuilder::new()
    }

    /// Address the control-plane server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn operator(&self) -> &Arc<Operator> {
        &self.operator
    }

    pub fn server(&self) -> &Arc<Server> {
        &self.server
    }

    /// Stop every application, then the supervisors and the server.
    pub async fn shutdown(self) -> Result<()> {
        info!("StewardRuntime shutting down...");

        let result = self.operator.shutdown().await;
        self.cancel.cancel();
        self.server.stop();

        match result {
            Ok(()) => {
                info!("StewardRuntime shutdown complete");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "StewardRuntime stopped with errors");
                Err(e.into())
            }
        }
    }

    /// False once [`shutdown`](Self::shutdown) started.
    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
    }
}
