// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Checkin stream: observed state in, expected state out.

use std::sync::Arc;

use serde_json::{Map, Value};
use steward_protocol::StreamHandler;
use steward_protocol::frame::{FramedStream, MessageType};
use steward_protocol::proto::{StateObserved, StateObservedStatus, StreamErrorCode};
use tracing::{debug, instrument, warn};

use super::ApplicationState;

/// Serve an authorized Checkin stream whose first message was `first`.
#[instrument(skip_all, fields(token = %state.token()))]
pub(super) async fn serve(state: Arc<ApplicationState>, stream: StreamHandler, first: StateObserved) {
    let Some((session_id, done, mut expected_rx)) = state.attach_checkin() else {
        super::reject(
            stream,
            StreamErrorCode::AlreadyExists,
            "application already connected",
        )
        .await;
        return;
    };
    debug!(session_id, "checkin stream attached");

    let (send, recv) = stream.into_parts();
    let mut send = FramedStream::new(send);
    let mut recv = FramedStream::new(recv);

    let send_done = done.clone();
    let sender = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;

                _ = send_done.cancelled() => break,

                changed = expected_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let expected = expected_rx.borrow_and_update().clone();
                    let Some(expected) = expected else { continue };
                    if let Err(e) = send.write_message(MessageType::Expected, &expected).await {
                        if !e.is_disconnect() {
                            warn!(error = %e, "failed to send expected state");
                        }
                        send_done.cancel();
                        break;
                    }
                }
            }
        }
        let _ = send.get_mut().finish();
    });

    update_status(&state, first).await;

    loop {
        tokio::select! {
            biased;

            _ = done.cancelled() => break,

            observed = recv.read_message::<StateObserved>(MessageType::Observed) => {
                match observed {
                    Ok(observed) => update_status(&state, observed).await,
                    Err(e) => {
                        if e.is_disconnect() {
                            debug!("checkin stream closed by worker");
                        } else {
                            warn!(error = %e, "checkin stream failed");
                        }
                        break;
                    }
                }
            }
        }
    }

    done.cancel();
    state.detach_checkin(session_id);
    let _ = sender.await;
    debug!(session_id, "checkin stream detached");
}

/// Record one observed message and notify the handler when the status,
/// message or payload actually changed.
async fn update_status(state: &Arc<ApplicationState>, observed: StateObserved) {
    let (status, message, payload) = interpret(observed.status, observed.message, &observed.payload);

    let Some((status, message, payload)) =
        state.record_observed(status, message, payload, observed.config_state_idx)
    else {
        return;
    };

    let Some(server) = state.server() else {
        return;
    };
    server
        .handler()
        .on_status_change(state, status, &message, payload.as_ref())
        .await;
}

/// Decode the wire status and JSON payload. Undecodable input turns into a
/// Failed status describing the problem.
fn interpret(
    raw_status: i32,
    message: String,
    raw_payload: &str,
) -> (StateObservedStatus, String, Option<Map<String, Value>>) {
    let Ok(status) = StateObservedStatus::try_from(raw_status) else {
        return (
            StateObservedStatus::Failed,
            format!("Unknown status {}", raw_status),
            None,
        );
    };

    if raw_payload.is_empty() {
        return (status, message, None);
    }
    match serde_json::from_str::<Map<String, Value>>(raw_payload) {
        Ok(payload) => (status, message, Some(payload)),
        Err(e) => (
            StateObservedStatus::Failed,
            format!("Failed to parse payload: {}", e),
            None,
        ),
    }
}
