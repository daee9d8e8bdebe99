// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Observers of application state changes and crashes.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::state::State;

/// Receives every application state change and every crash.
///
/// Calls for one application arrive in order, from a task of its own, and
/// never block the application.
#[async_trait]
pub trait Reporter: Send + Sync {
    async fn on_state_change(&self, app_id: &str, app_name: &str, state: &State);

    async fn report_failure(&self, app_id: &str, app_name: &str, message: &str);
}

/// Reporter that writes to the tracing subscriber.
#[derive(Debug, Clone, Default)]
pub struct LogReporter;

#[async_trait]
impl Reporter for LogReporter {
    async fn on_state_change(&self, app_id: &str, app_name: &str, state: &State) {
        info!(
            app_id,
            app_name,
            status = %state.status,
            pid = state.process_info.as_ref().map(|p| p.pid),
            message = %state.message,
            "application state changed"
        );
    }

    async fn report_failure(&self, app_id: &str, app_name: &str, message: &str) {
        error!(app_id, app_name, message, "application failure");
    }
}

/// Reporter that discards everything.
#[derive(Debug, Clone, Default)]
pub struct NoopReporter;

#[async_trait]
impl Reporter for NoopReporter {
    async fn on_state_change(&self, _: &str, _: &str, _: &State) {}

    async fn report_failure(&self, _: &str, _: &str, _: &str) {}
}

enum Report {
    State(State),
    Failure(String),
}

/// Ordered delivery of one application's reports. The delivery task ends
/// once every queue handle is dropped.
#[derive(Debug, Clone)]
pub(crate) struct ReportQueue {
    tx: mpsc::UnboundedSender<Report>,
}

impl ReportQueue {
    pub(crate) fn spawn(reporter: Arc<dyn Reporter>, app_id: String, app_name: String) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(deliver(reporter, app_id, app_name, rx));
        Self { tx }
    }

    pub(crate) fn state(&self, state: State) {
        let _ = self.tx.send(Report::State(state));
    }

    pub(crate) fn failure(&self, message: String) {
        let _ = self.tx.send(Report::Failure(message));
    }
}

async fn deliver(
    reporter: Arc<dyn Reporter>,
    app_id: String,
    app_name: String,
    mut rx: mpsc::UnboundedReceiver<Report>,
) {
    while let Some(report) = rx.recv().await {
        match report {
            Report::State(state) => reporter.on_state_change(&app_id, &app_name, &state).await,
            Report::Failure(message) => {
                reporter.report_failure(&app_id, &app_name, &message).await
            }
        }
    }
    debug!(app_id = %app_id, "report queue closed");
}
