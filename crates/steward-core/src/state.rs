// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Application status and state.

use std::cmp::Ordering;
use std::fmt;

use serde::{Serialize, Serializer};
use serde_json::{Map, Value};
use steward_protocol::proto::StateObservedStatus;

/// Statuses that only exist inside the supervisor and are never sent
/// over the wire as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InternalStatus {
    Stopped,
    Crashed,
    Restarting,
    Updating,
}

/// Status of one application.
///
/// Ordered by severity rank: the internal statuses sort below every wire
/// status (Stopped < Crashed < Restarting < Updating < Starting < ... < Stopping).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// Reported by (or demanded of) the worker over the control plane.
    Wire(StateObservedStatus),
    Internal(InternalStatus),
}

impl Status {
    pub const STOPPED: Status = Status::Internal(InternalStatus::Stopped);
    pub const CRASHED: Status = Status::Internal(InternalStatus::Crashed);
    pub const RESTARTING: Status = Status::Internal(InternalStatus::Restarting);
    pub const UPDATING: Status = Status::Internal(InternalStatus::Updating);
    pub const STARTING: Status = Status::Wire(StateObservedStatus::Starting);
    pub const CONFIGURING: Status = Status::Wire(StateObservedStatus::Configuring);
    pub const HEALTHY: Status = Status::Wire(StateObservedStatus::Healthy);
    pub const DEGRADED: Status = Status::Wire(StateObservedStatus::Degraded);
    pub const FAILED: Status = Status::Wire(StateObservedStatus::Failed);
    pub const STOPPING: Status = Status::Wire(StateObservedStatus::Stopping);

    /// Severity rank. Internal statuses are negative.
    pub fn rank(&self) -> i32 {
        match self {
            Status::Internal(InternalStatus::Stopped) => -4,
            Status::Internal(InternalStatus::Crashed) => -3,
            Status::Internal(InternalStatus::Restarting) => -2,
            Status::Internal(InternalStatus::Updating) => -1,
            Status::Wire(s) => *s as i32,
        }
    }

    /// The status a worker would see for this one.
    pub fn to_wire(&self) -> StateObservedStatus {
        match self {
            Status::Wire(s) => *s,
            Status::Internal(InternalStatus::Stopped) => StateObservedStatus::Stopping,
            Status::Internal(InternalStatus::Crashed) => StateObservedStatus::Failed,
            Status::Internal(InternalStatus::Restarting) => StateObservedStatus::Starting,
            Status::Internal(InternalStatus::Updating) => StateObservedStatus::Starting,
        }
    }

    pub fn is_internal(&self) -> bool {
        matches!(self, Status::Internal(_))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Wire(s) => s.as_str_name(),
            Status::Internal(InternalStatus::Stopped) => "STOPPED",
            Status::Internal(InternalStatus::Crashed) => "CRASHED",
            Status::Internal(InternalStatus::Restarting) => "RESTARTING",
            Status::Internal(InternalStatus::Updating) => "UPDATING",
        }
    }
}

impl From<StateObservedStatus> for Status {
    fn from(s: StateObservedStatus) -> Self {
        Status::Wire(s)
    }
}

impl From<InternalStatus> for Status {
    fn from(s: InternalStatus) -> Self {
        Status::Internal(s)
    }
}

impl PartialOrd for Status {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Status {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank().cmp(&other.rank())
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Status {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Handle of a running worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProcessInfo {
    pub pid: u32,
}

/// State of one application.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct State {
    pub process_info: Option<ProcessInfo>,
    pub status: Status,
    pub message: String,
    pub payload: Option<Map<String, Value>>,
}

impl State {
    pub fn new(status: Status, message: impl Into<String>) -> Self {
        Self {
            process_info: None,
            status,
            message: message.into(),
            payload: None,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.process_info.map(|p| p.pid)
    }
}

impl Default for State {
    fn default() -> Self {
        Self::new(Status::STOPPED, "")
    }
}
