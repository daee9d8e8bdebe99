// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Control-plane status changes applied to applications.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use steward_protocol::proto::{StateExpectedState, StateObservedStatus};
use tracing::{debug, warn};

use super::Application;
use super::supervisor::SupervisorEvent;
use crate::server::{ApplicationState, Handler};
use crate::state::Status;
use crate::sync::lock;

/// Server [`Handler`] forwarding status changes to the registered
/// [`Application`].
///
/// # Panics
///
/// When a registration belongs to anything other than an `Application`.
#[derive(Debug, Clone, Default)]
pub struct ApplicationStatusHandler;

#[async_trait]
impl Handler for ApplicationStatusHandler {
    async fn on_status_change(
        &self,
        state: &Arc<ApplicationState>,
        status: StateObservedStatus,
        message: &str,
        payload: Option<&Map<String, Value>>,
    ) {
        let Some(app) = state.app() else {
            debug!(token = %state.token(), "status change for dropped application");
            return;
        };
        let Ok(app) = app.downcast::<Application>() else {
            panic!(
                "registration {} does not belong to an Application",
                state.token()
            );
        };
        app.on_status_change(status, message, payload);
    }
}

impl Application {
    /// Mirror a status reported over the control plane.
    ///
    /// Ignored once the application is Stopped. A Failed status while the
    /// server still expects the worker to run is treated as a crash.
    pub fn on_status_change(
        &self,
        status: StateObservedStatus,
        message: &str,
        payload: Option<&Map<String, Value>>,
    ) {
        let (snapshot, stopping) = {
            let mut inner = lock(&self.inner);
            if inner.state.status == Status::STOPPED {
                debug!(app_id = %self.id, status = status.as_str_name(), "ignoring status of stopped application");
                return;
            }
            inner.state.status = status.into();
            inner.state.message = message.to_string();
            inner.state.payload = payload.cloned();
            let stopping = inner
                .srv_state
                .as_ref()
                .is_some_and(|s| s.expected() == StateExpectedState::Stopping);
            (inner.state.clone(), stopping)
        };
        self.report_state(snapshot);

        if status == StateObservedStatus::Failed && !stopping {
            warn!(app_id = %self.id, message, "worker reported failure");
            self.report_failure(message.to_string());
            // no supervisor after shutdown
            let _ = self.events.send(SupervisorEvent::Restart {
                reason: format!("Restarting after failure: {}", message),
            });
        }
    }
}
