// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Actions stream: requests out, responses in, matched by id.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use steward_protocol::StreamHandler;
use steward_protocol::frame::{FramedStream, MessageType};
use steward_protocol::proto::{
    ACTION_RESPONSE_INIT_ID, ActionRequest, ActionResponse, ActionResponseStatus, StreamErrorCode,
};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use super::app_state::{PendingAction, Session};
use super::{ApplicationState, ServerError};
use crate::sync::lock;

impl ApplicationState {
    /// Run an action on the worker and wait for its result.
    ///
    /// The action is queued until a worker is connected; it expires after
    /// `timeout` with [`ServerError::ActionTimedOut`]. Destroying the state
    /// cancels it with [`ServerError::ActionCancelled`].
    #[instrument(skip(self, params), fields(token = %self.token()))]
    pub async fn perform_action(
        &self,
        name: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, ServerError> {
        if self.is_destroyed() {
            return Err(ServerError::ActionCancelled);
        }
        let params = serde_json::to_vec(&params)?;
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();

        {
            let mut queues = lock(&self.actions);
            // destroy sets the flag before it drains the queues
            if self.is_destroyed() {
                return Err(ServerError::ActionCancelled);
            }
            queues.pending.push_back(PendingAction {
                id: id.clone(),
                name: name.to_string(),
                params,
                expires_at: Instant::now() + timeout,
                responder: tx,
            });
        }
        self.actions_notify.notify_one();

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ServerError::ActionCancelled),
            Err(_) => {
                let mut queues = lock(&self.actions);
                queues.pending.retain(|a| a.id != id);
                queues.sent.remove(&id);
                debug!(action_id = %id, action = name, "action timed out");
                Err(ServerError::ActionTimedOut)
            }
        }
    }

    /// Fail every pending or sent action whose expiry has passed.
    pub fn flush_expired_actions(&self, now: Instant) {
        let expired: Vec<PendingAction> = {
            let mut queues = lock(&self.actions);
            let mut expired = Vec::new();

            let mut kept = std::collections::VecDeque::with_capacity(queues.pending.len());
            for action in queues.pending.drain(..) {
                if action.expires_at <= now {
                    expired.push(action);
                } else {
                    kept.push_back(action);
                }
            }
            queues.pending = kept;

            let ids: Vec<String> = queues
                .sent
                .iter()
                .filter(|(_, a)| a.expires_at <= now)
                .map(|(id, _)| id.clone())
                .collect();
            for id in ids {
                if let Some(action) = queues.sent.remove(&id) {
                    expired.push(action);
                }
            }
            expired
        };

        for action in expired {
            debug!(action_id = %action.id, action = %action.name, "flushing expired action");
            action.respond(Err(ServerError::ActionTimedOut));
        }
    }

    /// Number of actions queued or awaiting a response.
    pub fn actions_in_flight(&self) -> usize {
        let queues = lock(&self.actions);
        queues.pending.len() + queues.sent.len()
    }

    fn attach_actions(&self) -> Option<(u64, CancellationToken)> {
        let mut queues = lock(&self.actions);
        if queues.session.is_some() || self.is_destroyed() {
            return None;
        }
        let session = Session {
            id: super::app_state::next_session_id(),
            done: CancellationToken::new(),
        };
        let result = (session.id, session.done.clone());
        queues.session = Some(session);
        Some(result)
    }

    fn detach_actions(&self, id: u64) {
        let mut queues = lock(&self.actions);
        if queues.session.as_ref().is_some_and(|s| s.id == id) {
            queues.session = None;
        }
    }

    /// Move the next live action from pending to sent and return the request
    /// to write. Expired actions met on the way are failed.
    fn next_action(&self, now: Instant) -> Option<ActionRequest> {
        let mut expired = Vec::new();
        let request = {
            let mut queues = lock(&self.actions);
            loop {
                let Some(action) = queues.pending.pop_front() else {
                    break None;
                };
                if action.expires_at <= now {
                    expired.push(action);
                    continue;
                }
                let request = ActionRequest {
                    id: action.id.clone(),
                    name: action.name.clone(),
                    params: action.params.clone(),
                };
                queues.sent.insert(action.id.clone(), action);
                break Some(request);
            }
        };
        for action in expired {
            action.respond(Err(ServerError::ActionTimedOut));
        }
        request
    }

    /// Put an action that could not be written back at the head of the queue.
    fn requeue(&self, id: &str) {
        let mut queues = lock(&self.actions);
        if let Some(action) = queues.sent.remove(id) {
            queues.pending.push_front(action);
        }
    }

    /// Resolve the caller waiting on `response.id`.
    fn complete_action(&self, response: ActionResponse) {
        if response.id == ACTION_RESPONSE_INIT_ID {
            return;
        }
        let Some(action) = lock(&self.actions).sent.remove(&response.id) else {
            debug!(action_id = %response.id, "response for unknown or expired action");
            return;
        };
        action.respond(action_result(&response));
    }
}

fn action_result(response: &ActionResponse) -> Result<Value, ServerError> {
    let result: Value = if response.result.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&response.result)
            .map_err(|e| ServerError::ActionFailed(format!("invalid action result: {}", e)))?
    };

    match ActionResponseStatus::try_from(response.status) {
        Ok(ActionResponseStatus::Success) => Ok(result),
        _ => {
            let message = result
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            Err(ServerError::ActionFailed(message.to_string()))
        }
    }
}

/// Serve an authorized Actions stream whose `init` message was consumed.
#[instrument(skip_all, fields(token = %state.token()))]
pub(super) async fn serve(state: Arc<ApplicationState>, stream: StreamHandler) {
    let Some((session_id, done)) = state.attach_actions() else {
        super::reject(
            stream,
            StreamErrorCode::AlreadyExists,
            "application already connected",
        )
        .await;
        return;
    };
    debug!(session_id, "actions stream attached");

    let (send, recv) = stream.into_parts();
    let mut send = FramedStream::new(send);
    let mut recv = FramedStream::new(recv);

    let recv_state = state.clone();
    let recv_done = done.clone();
    let receiver = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;

                _ = recv_done.cancelled() => break,

                response = recv.read_message::<ActionResponse>(MessageType::ActionResponse) => {
                    match response {
                        Ok(response) => recv_state.complete_action(response),
                        Err(e) => {
                            if e.is_disconnect() {
                                debug!("actions stream closed by worker");
                            } else {
                                warn!(error = %e, "actions stream failed");
                            }
                            break;
                        }
                    }
                }
            }
        }
        recv_done.cancel();
    });

    loop {
        if done.is_cancelled() {
            break;
        }
        match state.next_action(Instant::now()) {
            Some(request) => {
                debug!(action_id = %request.id, action = %request.name, "sending action");
                if let Err(e) = send.write_message(MessageType::ActionRequest, &request).await {
                    state.requeue(&request.id);
                    if !e.is_disconnect() {
                        warn!(error = %e, "failed to send action");
                    }
                    break;
                }
            }
            None => {
                tokio::select! {
                    biased;

                    _ = done.cancelled() => break,
                    _ = state.actions_notify.notified() => {}
                }
            }
        }
    }

    done.cancel();
    state.detach_actions(session_id);
    let _ = send.get_mut().finish();
    let _ = receiver.await;
    debug!(session_id, "actions stream detached");
}
