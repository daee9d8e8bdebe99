// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for steward-core integration tests.

#![allow(dead_code)]

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use steward_core::application::ProcessConfig;
use steward_core::reporter::Reporter;
use steward_core::server::{ApplicationState, Handler, Server, ServerConfig};
use steward_core::state::{State, Status};
use steward_protocol::EndpointConfig;
use steward_protocol::proto::StateObservedStatus;
use tokio::sync::mpsc;

/// Server config bound to an ephemeral loopback port. The background
/// watchdog is slowed down so tests drive it with `watchdog_tick`.
pub fn server_config() -> ServerConfig {
    ServerConfig {
        endpoint: EndpointConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            ..Default::default()
        },
        watchdog_interval: Duration::from_secs(3600),
        ..Default::default()
    }
}

/// Process tuning that keeps tests fast.
pub fn process_config() -> ProcessConfig {
    ProcessConfig {
        stop_timeout: Duration::from_secs(2),
        spawn_timeout: Duration::from_secs(5),
        restart_burst: 5,
        restart_refill: Duration::from_millis(100),
    }
}

/// Start a server with `handler`.
pub async fn start_server(config: ServerConfig, handler: Arc<dyn Handler>) -> Arc<Server> {
    let server = Server::new(config, handler).unwrap();
    server.start().await.unwrap();
    server
}

/// Handler that forwards every status change into a channel.
pub struct RecordingHandler {
    tx: mpsc::UnboundedSender<(StateObservedStatus, String)>,
}

impl RecordingHandler {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<(StateObservedStatus, String)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

#[async_trait]
impl Handler for RecordingHandler {
    async fn on_status_change(
        &self,
        _state: &Arc<ApplicationState>,
        status: StateObservedStatus,
        message: &str,
        _payload: Option<&Map<String, Value>>,
    ) {
        let _ = self.tx.send((status, message.to_string()));
    }
}

/// Reporter that keeps every call.
#[derive(Default)]
pub struct RecordingReporter {
    pub states: Mutex<Vec<(String, State)>>,
    pub failures: Mutex<Vec<(String, String)>>,
}

impl RecordingReporter {
    pub fn saw_status(&self, status: Status) -> bool {
        self.states
            .lock()
            .unwrap()
            .iter()
            .any(|(_, s)| s.status == status)
    }

    pub fn failures(&self) -> Vec<String> {
        self.failures
            .lock()
            .unwrap()
            .iter()
            .map(|(_, m)| m.clone())
            .collect()
    }
}

#[async_trait]
impl Reporter for RecordingReporter {
    async fn on_state_change(&self, app_id: &str, _app_name: &str, state: &State) {
        self.states
            .lock()
            .unwrap()
            .push((app_id.to_string(), state.clone()));
    }

    async fn report_failure(&self, app_id: &str, _app_name: &str, message: &str) {
        self.failures
            .lock()
            .unwrap()
            .push((app_id.to_string(), message.to_string()));
    }
}

/// Poll `condition` every 20ms until it holds or `timeout` passes.
pub async fn wait_until<F: FnMut() -> bool>(timeout: Duration, mut condition: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Write an executable `/bin/sh` script with `body` as `<dir>/<cmd>`.
#[cfg(unix)]
pub fn install_script(dir: &Path, cmd: &str, body: &str) {
    use std::os::unix::fs::PermissionsExt;

    std::fs::create_dir_all(dir).unwrap();
    let path = dir.join(cmd);
    std::fs::write(&path, script(body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

/// Contents of a `/bin/sh` script running `body`.
pub fn script(body: &str) -> String {
    format!("#!/bin/sh\n{}\n", body)
}
