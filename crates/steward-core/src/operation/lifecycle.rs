// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Operations driving the worker itself.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::Operation;
use crate::application::Application;
use crate::error::{Error, Result};
use crate::state::Status;

/// Starts the worker. Skipped while a run is active.
pub struct StartOperation {
    config: Value,
}

impl StartOperation {
    pub fn new(config: Value) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Operation for StartOperation {
    fn name(&self) -> &str {
        "start"
    }

    async fn check(&self, _: &CancellationToken, app: &Arc<Application>) -> Result<bool> {
        Ok(!app.is_running())
    }

    async fn run(&self, _: &CancellationToken, app: &Arc<Application>) -> Result<()> {
        // a failed start already left the application Failed
        app.start(&self.config).await
    }
}

/// Pushes the latest configuration. Always runs.
///
/// A rejected push degrades a running application; pushing to a worker that
/// is not running fails it.
pub struct ConfigureOperation {
    config: Value,
}

impl ConfigureOperation {
    pub fn new(config: Value) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Operation for ConfigureOperation {
    fn name(&self) -> &str {
        "configure"
    }

    async fn check(&self, _: &CancellationToken, _: &Arc<Application>) -> Result<bool> {
        Ok(true)
    }

    async fn run(&self, _: &CancellationToken, app: &Arc<Application>) -> Result<()> {
        match app.configure(&self.config).await {
            Ok(()) => Ok(()),
            Err(e @ Error::AppNotRunning(_)) => {
                app.set_state(Status::FAILED, e.to_string());
                Err(e)
            }
            Err(e) => {
                warn!(app_id = %app.id(), error = %e, "configuration push failed");
                app.set_state(Status::DEGRADED, e.to_string());
                Err(e)
            }
        }
    }
}

/// Stops the worker. Skipped when already stopped.
#[derive(Debug, Clone, Default)]
pub struct StopOperation;

impl StopOperation {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Operation for StopOperation {
    fn name(&self) -> &str {
        "stop"
    }

    async fn check(&self, _: &CancellationToken, app: &Arc<Application>) -> Result<bool> {
        Ok(app.state().status != Status::STOPPED)
    }

    async fn run(&self, _: &CancellationToken, app: &Arc<Application>) -> Result<()> {
        app.stop().await
    }
}
