// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Steward Core - local worker supervisor
//!
//! This crate installs, runs and watches worker processes on one host. A
//! desired configuration comes in, the resolver turns it into steps, and the
//! operator runs each step as a flow of retryable operations against the
//! application that owns the worker.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Desired configuration (ConfigRequest)                │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                    │
//!                                    ▼
//! ┌──────────────────────┐   steps   ┌──────────────────────────────────────┐
//! │    StateResolver     │──────────►│              Operator                │
//! │  (converge + ack)    │           │  fetch → verify → install → start    │
//! └──────────────────────┘           │  → configure, stop, uninstall        │
//!                                    └──────────────────────────────────────┘
//!                                                     │ one per descriptor
//!                                                     ▼
//! ┌──────────────────────┐ register  ┌──────────────────────────────────────┐
//! │   Control plane      │◄──────────│            Application               │
//! │  Server (QUIC mTLS)  │  status   │  spawn, stop, crash auto-restart     │
//! │  Checkin / Actions   │──────────►│                                      │
//! │  Watchdog            │           └──────────────────────────────────────┘
//! └──────────────────────┘                            │ spawns, conn info on stdin
//!           ▲                                         ▼
//!           │        Checkin / Actions   ┌──────────────────────────────────┐
//!           └────────────────────────────│          Worker process          │
//!                                        └──────────────────────────────────┘
//! ```
//!
//! # Application status
//!
//! | Status      | Meaning                                               |
//! |-------------|-------------------------------------------------------|
//! | Stopped     | No worker; the terminal state                         |
//! | Starting    | Spawned, waiting for the first check-in               |
//! | Configuring | Worker is applying configuration                      |
//! | Healthy     | Worker reports healthy                                |
//! | Degraded    | Worker reports degraded, or one check-in was missed   |
//! | Failed      | Worker reports failure, or two check-ins were missed  |
//! | Crashed     | Worker exited while expected to run                   |
//! | Restarting  | A new worker is being spawned after a crash           |
//! | Stopping    | Stop requested, waiting for the worker to leave       |
//!
//! # Modules
//!
//! - [`operator`]: applies configuration requests, owns the application registry
//! - [`operation`]: the steps a flow is made of, and the retryable block
//! - [`application`]: lifecycle of one worker
//! - [`server`]: control-plane server the workers check in with
//! - [`resolver`]: diffs desired configuration against the acknowledged one
//! - [`artifact`]: artifact layout and fetch/verify/install collaborators
//! - [`runtime`]: wires everything for embedding or the `steward` binary

pub mod application;
pub mod artifact;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod monitor;
pub mod operation;
pub mod operator;
pub mod reporter;
pub mod resolver;
pub mod retry;
pub mod runtime;
pub mod server;
pub mod state;

mod sync;

pub use application::{Application, ApplicationStatusHandler};
pub use config::Config;
pub use descriptor::{Descriptor, ProgramSpec};
pub use error::{Error, ErrorKind, Result};
pub use operator::{Operator, OperatorBuilder, ProgramRegistry};
pub use resolver::{ConfigRequest, ProgramConfig, StateResolver};
pub use runtime::StewardRuntime;
pub use server::{ApplicationState, Server, ServerConfig, ServerError};
pub use state::{State, Status};
