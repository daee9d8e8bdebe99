// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Server-side record of one registered application.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use prost::Message;
use serde_json::{Map, Value};
use steward_protocol::proto::{ConnInfo, StateExpected, StateExpectedState, StateObservedStatus};
use steward_protocol::tls::IssuedCredentials;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{Notify, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Server, ServerError};
use crate::sync::lock;

static SESSION_IDS: AtomicU64 = AtomicU64::new(1);

pub(super) fn next_session_id() -> u64 {
    SESSION_IDS.fetch_add(1, Ordering::Relaxed)
}

/// A live stream attached to an application. At most one per stream kind.
#[derive(Debug)]
pub(super) struct Session {
    pub(super) id: u64,
    pub(super) done: CancellationToken,
}

#[derive(Debug)]
pub(super) struct CheckinState {
    pub(super) expected: StateExpectedState,
    pub(super) expected_config_idx: u64,
    pub(super) expected_config: String,
    pub(super) status: StateObservedStatus,
    pub(super) message: String,
    pub(super) payload: Option<Map<String, Value>>,
    pub(super) config_idx: u64,
    pub(super) status_time: Instant,
    pub(super) session: Option<Session>,
    /// Latest expected state for the session's send loop. Only the newest
    /// value matters, so an unread value is simply replaced.
    pub(super) expected_tx: watch::Sender<Option<StateExpected>>,
}

impl CheckinState {
    pub(super) fn expected_message(&self) -> StateExpected {
        StateExpected {
            state: self.expected as i32,
            config_state_idx: self.expected_config_idx,
            config: self.expected_config.clone(),
        }
    }

    /// Hand the current expected state to the connected worker, if any.
    pub(super) fn push_expected(&self) {
        if self.session.is_some() {
            self.expected_tx.send_replace(Some(self.expected_message()));
        }
    }
}

/// An action waiting to be sent, or sent and waiting for its response.
pub(super) struct PendingAction {
    pub(super) id: String,
    pub(super) name: String,
    pub(super) params: Vec<u8>,
    pub(super) expires_at: Instant,
    pub(super) responder: oneshot::Sender<Result<Value, ServerError>>,
}

impl PendingAction {
    pub(super) fn respond(self, result: Result<Value, ServerError>) {
        // the caller may have given up already
        let _ = self.responder.send(result);
    }
}

#[derive(Default)]
pub(super) struct ActionQueues {
    pub(super) pending: VecDeque<PendingAction>,
    pub(super) sent: HashMap<String, PendingAction>,
    pub(super) session: Option<Session>,
}

/// A status change made by the watchdog.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusChange {
    pub status: StateObservedStatus,
    pub message: &'static str,
    pub payload: Option<Map<String, Value>>,
}

/// Control-plane session state of one registered application.
pub struct ApplicationState {
    token: String,
    credentials: IssuedCredentials,
    ca_pem: Vec<u8>,
    app: Weak<dyn Any + Send + Sync>,
    server: Weak<Server>,
    destroyed: AtomicBool,
    pub(super) checkin: Mutex<CheckinState>,
    pub(super) actions: Mutex<ActionQueues>,
    pub(super) actions_notify: Notify,
}

impl std::fmt::Debug for ApplicationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApplicationState")
            .field("token", &self.token)
            .field("server_name", &self.credentials.server_name)
            .field("destroyed", &self.is_destroyed())
            .finish_non_exhaustive()
    }
}

impl ApplicationState {
    pub(super) fn new(
        token: String,
        credentials: IssuedCredentials,
        ca_pem: Vec<u8>,
        app: Weak<dyn Any + Send + Sync>,
        server: Weak<Server>,
        initial_config: String,
    ) -> Self {
        let (expected_tx, _) = watch::channel(None);
        Self {
            token,
            credentials,
            ca_pem,
            app,
            server,
            destroyed: AtomicBool::new(false),
            checkin: Mutex::new(CheckinState {
                expected: StateExpectedState::Running,
                expected_config_idx: 1,
                expected_config: initial_config,
                status: StateObservedStatus::Starting,
                message: "Starting".to_string(),
                payload: None,
                config_idx: 0,
                status_time: Instant::now(),
                session: None,
                expected_tx,
            }),
            actions: Mutex::new(ActionQueues::default()),
            actions_notify: Notify::new(),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// SNI name the worker must connect with.
    pub fn server_name(&self) -> &str {
        &self.credentials.server_name
    }

    /// The registered application, while it is alive.
    pub fn app(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.app.upgrade()
    }

    pub(super) fn server(&self) -> Option<Arc<Server>> {
        self.server.upgrade()
    }

    pub(super) fn belongs_to(&self, app: &Arc<dyn Any + Send + Sync>) -> bool {
        std::ptr::addr_eq(self.app.as_ptr(), Arc::as_ptr(app))
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Connection info for the worker, to be written to its stdin or handed
    /// over the credentials listener.
    pub fn conn_info(&self) -> Result<ConnInfo, ServerError> {
        let addr = self
            .server
            .upgrade()
            .and_then(|s| s.dial_addr())
            .ok_or(ServerError::NotStarted)?;
        Ok(ConnInfo {
            addr: addr.to_string(),
            server_name: self.credentials.server_name.clone(),
            token: self.token.clone(),
            ca_cert: self.ca_pem.clone(),
            peer_cert: self.credentials.client.cert_pem.clone(),
            peer_key: self.credentials.client.key_pem.clone(),
        })
    }

    /// Write the encoded connection info to `writer`.
    pub async fn write_conn_info<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
    ) -> Result<(), std::io::Error> {
        let info = self
            .conn_info()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::NotConnected, e.to_string()))?;
        writer.write_all(&info.encode_to_vec()).await?;
        writer.flush().await
    }

    /// Last reported status and message.
    pub fn status(&self) -> (StateObservedStatus, String) {
        let cs = lock(&self.checkin);
        (cs.status, cs.message.clone())
    }

    /// Last reported payload.
    pub fn payload(&self) -> Option<Map<String, Value>> {
        lock(&self.checkin).payload.clone()
    }

    /// State the server currently demands.
    pub fn expected(&self) -> StateExpectedState {
        lock(&self.checkin).expected
    }

    /// Configuration currently pushed to the worker.
    pub fn config(&self) -> String {
        lock(&self.checkin).expected_config.clone()
    }

    pub fn expected_config_idx(&self) -> u64 {
        lock(&self.checkin).expected_config_idx
    }

    /// Config index the worker last reported.
    pub fn observed_config_idx(&self) -> u64 {
        lock(&self.checkin).config_idx
    }

    /// Whether a Checkin stream is attached.
    pub fn is_connected(&self) -> bool {
        lock(&self.checkin).session.is_some()
    }

    /// Overwrite the status without notifying the handler.
    pub fn set_status(
        &self,
        status: StateObservedStatus,
        message: impl Into<String>,
        payload: Option<Map<String, Value>>,
    ) {
        let mut cs = lock(&self.checkin);
        cs.status = status;
        cs.message = message.into();
        cs.payload = payload;
        cs.status_time = Instant::now();
    }

    /// Push a new configuration.
    ///
    /// The index only moves when the configuration differs from the one
    /// already expected.
    pub fn update_config(&self, config: impl Into<String>) -> Result<(), ServerError> {
        let config = config.into();
        let mut cs = lock(&self.checkin);
        if cs.expected == StateExpectedState::Stopping {
            return Err(ServerError::ApplicationStopping);
        }
        if cs.expected_config == config {
            return Ok(());
        }
        cs.expected_config = config;
        cs.expected_config_idx += 1;
        debug!(token = %self.token, idx = cs.expected_config_idx, "configuration updated");
        cs.push_expected();
        Ok(())
    }

    /// Ask the worker to stop and wait until it disconnects.
    ///
    /// The registration is destroyed either way; on timeout the error is
    /// [`ServerError::ApplicationStopTimedOut`].
    pub async fn stop(&self, timeout: Duration) -> Result<(), ServerError> {
        {
            let mut cs = lock(&self.checkin);
            cs.expected = StateExpectedState::Stopping;
            cs.push_expected();
        }

        let deadline = Instant::now() + timeout;
        let mut tick = tokio::time::interval(Duration::from_millis(50));
        loop {
            tick.tick().await;
            if !self.is_connected() {
                break;
            }
            if Instant::now() >= deadline {
                warn!(token = %self.token, "worker did not disconnect in time");
                self.destroy();
                return Err(ServerError::ApplicationStopTimedOut);
            }
        }

        self.destroy();
        Ok(())
    }

    /// Tear the registration down: cancel every action, close both streams
    /// and forget the token and certificate. Idempotent.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.drop_sessions();

        let cancelled: Vec<PendingAction> = {
            let mut queues = lock(&self.actions);
            let mut drained: Vec<PendingAction> = queues.pending.drain(..).collect();
            drained.extend(queues.sent.drain().map(|(_, a)| a));
            drained
        };
        for action in cancelled {
            action.respond(Err(ServerError::ActionCancelled));
        }
        self.actions_notify.notify_waiters();

        if let Some(server) = self.server.upgrade() {
            server.unregister(&self.token, &self.credentials.server_name);
        }
        info!(token = %self.token, "application state destroyed");
    }

    /// Close both attached streams and keep the registration.
    ///
    /// A killed worker never closes its connection, so its sessions would
    /// stay attached until the idle timeout and lock out the next worker.
    pub(crate) fn drop_sessions(&self) {
        let checkin = lock(&self.checkin).session.take();
        let actions = lock(&self.actions).session.take();
        for session in checkin.into_iter().chain(actions) {
            debug!(token = %self.token, session_id = session.id, "dropping session");
            session.done.cancel();
        }
        self.actions_notify.notify_waiters();
    }

    /// Attach a Checkin stream. Fails when one is already attached.
    pub(super) fn attach_checkin(
        &self,
    ) -> Option<(u64, CancellationToken, watch::Receiver<Option<StateExpected>>)> {
        let mut cs = lock(&self.checkin);
        if cs.session.is_some() || self.is_destroyed() {
            return None;
        }
        let session = Session {
            id: next_session_id(),
            done: CancellationToken::new(),
        };
        let result = (session.id, session.done.clone(), cs.expected_tx.subscribe());
        cs.session = Some(session);
        Some(result)
    }

    pub(super) fn detach_checkin(&self, id: u64) {
        let mut cs = lock(&self.checkin);
        if cs.session.as_ref().is_some_and(|s| s.id == id) {
            cs.session = None;
        }
    }

    /// Apply the watchdog rules for a stale check-in.
    pub(super) fn demote_if_stale(&self, now: Instant, min_timeout: Duration) -> Option<StatusChange> {
        let mut cs = lock(&self.checkin);
        if now.saturating_duration_since(cs.status_time) <= min_timeout {
            return None;
        }
        let (status, message) = super::watchdog::demote(cs.status)?;
        cs.status = status;
        cs.message = message.to_string();
        cs.status_time = now;
        Some(StatusChange {
            status,
            message,
            payload: cs.payload.clone(),
        })
    }

    /// Record an observed state. Returns the change to report, if any.
    pub(super) fn record_observed(
        &self,
        status: StateObservedStatus,
        message: String,
        payload: Option<Map<String, Value>>,
        config_idx: u64,
    ) -> Option<(StateObservedStatus, String, Option<Map<String, Value>>)> {
        let mut cs = lock(&self.checkin);
        let changed = cs.status != status || cs.message != message || cs.payload != payload;

        cs.status = status;
        cs.message = message;
        cs.payload = payload;
        cs.config_idx = config_idx;
        cs.status_time = Instant::now();

        let stale = config_idx != cs.expected_config_idx;
        let must_stop =
            cs.expected == StateExpectedState::Stopping && status != StateObservedStatus::Stopping;
        if stale || must_stop {
            cs.push_expected();
        }

        changed.then(|| (cs.status, cs.message.clone(), cs.payload.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use steward_protocol::tls::CertificateAuthority;

    fn state(config: &str) -> ApplicationState {
        let ca = CertificateAuthority::generate().unwrap();
        let creds = ca.issue("wtest").unwrap();
        ApplicationState::new(
            "tok".to_string(),
            creds,
            ca.cert_pem().to_vec(),
            Weak::<()>::new(),
            Weak::new(),
            config.to_string(),
        )
    }

    #[test]
    fn test_config_index_only_moves_on_change() {
        let s = state("cfg1");
        assert_eq!(s.expected_config_idx(), 1);

        s.update_config("cfg1").unwrap();
        assert_eq!(s.expected_config_idx(), 1);

        s.update_config("cfg2").unwrap();
        assert_eq!(s.expected_config_idx(), 2);
        assert_eq!(s.config(), "cfg2");

        s.update_config("cfg2").unwrap();
        s.update_config("cfg3").unwrap();
        assert_eq!(s.expected_config_idx(), 3);
    }

    #[tokio::test]
    async fn test_update_config_while_stopping() {
        let s = state("cfg1");
        // no worker attached: stop returns right away
        s.stop(Duration::from_millis(200)).await.unwrap();
        assert!(s.is_destroyed());
        assert_eq!(s.expected(), StateExpectedState::Stopping);
        assert!(matches!(
            s.update_config("cfg2"),
            Err(ServerError::ApplicationStopping)
        ));
        assert_eq!(s.expected_config_idx(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_times_out_with_attached_worker() {
        let s = state("");
        let (_, done, _rx) = s.attach_checkin().unwrap();

        let err = s.stop(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, ServerError::ApplicationStopTimedOut));
        assert!(s.is_destroyed());
        assert!(done.is_cancelled());
    }

    #[test]
    fn test_single_checkin_session() {
        let s = state("");
        let (id, _, _) = s.attach_checkin().unwrap();
        assert!(s.attach_checkin().is_none());

        s.detach_checkin(id + 1000);
        assert!(s.is_connected());
        s.detach_checkin(id);
        assert!(!s.is_connected());
        assert!(s.attach_checkin().is_some());
    }

    #[test]
    fn test_drop_sessions_frees_the_slot() {
        let s = state("cfg1");
        let (id, done, _rx) = s.attach_checkin().unwrap();

        s.drop_sessions();
        assert!(done.is_cancelled());
        assert!(!s.is_connected());
        assert!(!s.is_destroyed());

        // the old stream detaching late leaves the new one alone
        let (_, next, _rx) = s.attach_checkin().unwrap();
        s.detach_checkin(id);
        assert!(s.is_connected());
        assert!(!next.is_cancelled());
    }

    #[test]
    fn test_record_observed_reports_only_changes() {
        let s = state("cfg1");
        let change = s.record_observed(StateObservedStatus::Healthy, "Running".into(), None, 1);
        assert_eq!(change.unwrap().0, StateObservedStatus::Healthy);

        let again = s.record_observed(StateObservedStatus::Healthy, "Running".into(), None, 1);
        assert!(again.is_none());

        let degraded = s.record_observed(StateObservedStatus::Degraded, "slow".into(), None, 1);
        assert_eq!(degraded.unwrap().1, "slow");
    }

    #[test]
    fn test_record_observed_pushes_stale_config() {
        let s = state("cfg1");
        let (_, _, mut rx) = s.attach_checkin().unwrap();

        s.record_observed(StateObservedStatus::Healthy, "Running".into(), None, 1);
        assert!(!rx.has_changed().unwrap());

        s.update_config("cfg2").unwrap();
        assert!(rx.has_changed().unwrap());
        let expected = rx.borrow_and_update().clone().unwrap();
        assert_eq!(expected.config_state_idx, 2);
        assert_eq!(expected.config, "cfg2");

        // worker still on 1: pushed again
        s.record_observed(StateObservedStatus::Healthy, "Running".into(), None, 1);
        assert!(rx.has_changed().unwrap());
        let _ = rx.borrow_and_update();

        // caught up: nothing more to send
        s.record_observed(StateObservedStatus::Healthy, "Running".into(), None, 2);
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn test_demotion_sequence() {
        let s = state("");
        let min = Duration::from_secs(10);
        s.set_status(StateObservedStatus::Healthy, "Running", None);
        let start = Instant::now();

        assert!(s.demote_if_stale(start + Duration::from_secs(5), min).is_none());

        let first = s.demote_if_stale(start + Duration::from_secs(11), min).unwrap();
        assert_eq!(first.status, StateObservedStatus::Degraded);
        assert_eq!(first.message, "Missed last check-in");

        // the clock was reset by the demotion
        assert!(s.demote_if_stale(start + Duration::from_secs(15), min).is_none());

        let second = s.demote_if_stale(start + Duration::from_secs(22), min).unwrap();
        assert_eq!(second.status, StateObservedStatus::Failed);
        assert_eq!(second.message, "Missed two check-ins");

        assert!(s.demote_if_stale(start + Duration::from_secs(100), min).is_none());
        assert_eq!(s.status().0, StateObservedStatus::Failed);
    }

    #[test]
    fn test_destroy_is_idempotent() {
        let s = state("");
        s.destroy();
        s.destroy();
        assert!(s.is_destroyed());
        assert!(s.attach_checkin().is_none());
    }
}
