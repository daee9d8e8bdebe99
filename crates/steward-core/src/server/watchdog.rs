// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker demoting applications that stop checking in.
//!
//! Every tick the watchdog looks at each registration's last check-in. A
//! worker that missed one check-in window is marked Degraded, one that missed
//! two is marked Failed. Expired actions are flushed on the same tick.

use std::sync::Weak;
use std::time::Duration;

use steward_protocol::proto::StateObservedStatus;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::Server;

/// Status a silent worker is demoted to, with the message recorded for it.
///
/// Returns `None` for statuses the watchdog leaves alone.
pub fn demote(status: StateObservedStatus) -> Option<(StateObservedStatus, &'static str)> {
    match status {
        StateObservedStatus::Degraded => Some((StateObservedStatus::Failed, "Missed two check-ins")),
        StateObservedStatus::Starting
        | StateObservedStatus::Configuring
        | StateObservedStatus::Healthy => {
            Some((StateObservedStatus::Degraded, "Missed last check-in"))
        }
        StateObservedStatus::Failed | StateObservedStatus::Stopping => None,
    }
}

/// Run the watchdog loop until `shutdown` fires or the server is dropped.
pub(super) async fn run(server: Weak<Server>, interval: Duration, shutdown: CancellationToken) {
    info!(interval_ms = interval.as_millis() as u64, "Watchdog started");

    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                info!("Watchdog received shutdown signal");
                break;
            }

            _ = tokio::time::sleep(interval) => {
                let Some(server) = server.upgrade() else {
                    debug!("server dropped");
                    break;
                };
                server.watchdog_tick(Instant::now()).await;
            }
        }
    }

    info!("Watchdog stopped");
}
