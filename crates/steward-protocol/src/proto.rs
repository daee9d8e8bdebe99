// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Protobuf messages of the control-plane contract.
//!
//! Declared directly with `prost` derives so the crate builds without `protoc`.
//! Tags are part of the wire contract and must never be renumbered.

/// Reserved id of the first message a worker sends on its Actions stream.
pub const ACTION_RESPONSE_INIT_ID: &str = "init";

/// Status a worker reports about itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum StateObservedStatus {
    Starting = 0,
    Configuring = 1,
    Healthy = 2,
    Degraded = 3,
    Failed = 4,
    Stopping = 5,
}

impl StateObservedStatus {
    pub fn as_str_name(&self) -> &'static str {
        match self {
            StateObservedStatus::Starting => "STARTING",
            StateObservedStatus::Configuring => "CONFIGURING",
            StateObservedStatus::Healthy => "HEALTHY",
            StateObservedStatus::Degraded => "DEGRADED",
            StateObservedStatus::Failed => "FAILED",
            StateObservedStatus::Stopping => "STOPPING",
        }
    }
}

/// State the supervisor expects a worker to be in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum StateExpectedState {
    Running = 0,
    Stopping = 1,
}

/// Outcome of an action.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ActionResponseStatus {
    Success = 0,
    Failed = 1,
}

/// Why the server refused a stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum StreamErrorCode {
    Unknown = 0,
    PermissionDenied = 1,
    Unavailable = 2,
    AlreadyExists = 3,
    DeadlineExceeded = 4,
    InvalidArgument = 5,
}

/// Worker -> server on the Checkin stream.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StateObserved {
    #[prost(string, tag = "1")]
    pub token: String,
    #[prost(enumeration = "StateObservedStatus", tag = "2")]
    pub status: i32,
    #[prost(string, tag = "3")]
    pub message: String,
    /// JSON object, empty when the worker has nothing to add.
    #[prost(string, tag = "4")]
    pub payload: String,
    #[prost(uint64, tag = "5")]
    pub config_state_idx: u64,
}

/// Server -> worker on the Checkin stream.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StateExpected {
    #[prost(enumeration = "StateExpectedState", tag = "1")]
    pub state: i32,
    #[prost(uint64, tag = "2")]
    pub config_state_idx: u64,
    #[prost(string, tag = "3")]
    pub config: String,
}

/// Server -> worker on the Actions stream.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ActionRequest {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub name: String,
    /// JSON encoded parameters.
    #[prost(bytes = "vec", tag = "3")]
    pub params: Vec<u8>,
}

/// Worker -> server on the Actions stream.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ActionResponse {
    #[prost(string, tag = "1")]
    pub token: String,
    #[prost(string, tag = "2")]
    pub id: String,
    #[prost(enumeration = "ActionResponseStatus", tag = "3")]
    pub status: i32,
    /// JSON encoded result. A failed action carries `{"error": "..."}`.
    #[prost(bytes = "vec", tag = "4")]
    pub result: Vec<u8>,
}

/// Sent in an `Error` frame right before the server finishes a refused stream.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StreamError {
    #[prost(enumeration = "StreamErrorCode", tag = "1")]
    pub code: i32,
    #[prost(string, tag = "2")]
    pub message: String,
}

/// Credentials handed to a worker out of band (stdin or the loopback listener).
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConnInfo {
    #[prost(string, tag = "1")]
    pub addr: String,
    #[prost(string, tag = "2")]
    pub server_name: String,
    #[prost(string, tag = "3")]
    pub token: String,
    /// PEM encoded CA certificate.
    #[prost(bytes = "vec", tag = "4")]
    pub ca_cert: Vec<u8>,
    /// PEM encoded client certificate.
    #[prost(bytes = "vec", tag = "5")]
    pub peer_cert: Vec<u8>,
    /// PEM encoded client private key.
    #[prost(bytes = "vec", tag = "6")]
    pub peer_key: Vec<u8>,
}

impl ActionResponse {
    /// The `init` message a worker opens its Actions stream with.
    pub fn init(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            id: ACTION_RESPONSE_INIT_ID.to_string(),
            status: ActionResponseStatus::Success as i32,
            result: b"{}".to_vec(),
        }
    }
}
