// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Steward Protocol - control-plane wire layer
//!
//! This crate provides everything that travels between the supervisor and the
//! worker processes it supervises.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    steward-protocol                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Streams: Checkin (observed/expected), Actions (req/resp)   │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Serialization: Protobuf (prost) in length-prefixed frames  │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Security: mutual TLS, per-worker certs selected by SNI     │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Transport: QUIC (quinn)                                    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Streams
//!
//! A worker opens one QUIC connection and two bidirectional streams on it.
//!
//! | Stream  | Worker sends                 | Supervisor sends          |
//! |---------|------------------------------|---------------------------|
//! | Checkin | `StateObserved` (`Observed`) | `StateExpected` (`Expected`) |
//! | Actions | `ActionResponse`, `init` first | `ActionRequest`         |
//!
//! A refused stream receives a single `Error` frame carrying a `StreamError`.
//!
//! # Usage (worker side)
//!
//! ```ignore
//! use steward_protocol::{ControlClient, client::read_conn_info, proto};
//!
//! let info = read_conn_info(&mut tokio::io::stdin()).await?;
//! let client = ControlClient::from_conn_info(&info)?;
//!
//! let mut checkin = client.open_checkin().await?;
//! checkin
//!     .send(proto::StateObserved {
//!         status: proto::StateObservedStatus::Healthy as i32,
//!         message: "Running".to_string(),
//!         config_state_idx: 1,
//!         ..Default::default()
//!     })
//!     .await?;
//! let expected = checkin.recv().await?;
//! ```

pub mod client;
pub mod frame;
pub mod proto;
pub mod server;
pub mod tls;

/// ALPN protocol id negotiated on every control-plane connection.
pub const ALPN: &[u8] = b"steward-control/1";

pub use client::{ActionsStream, CheckinStream, ClientError, ControlClient, ControlClientConfig};
pub use frame::{Frame, FrameError, FramedStream, MessageType};
pub use server::{
    ConnectionHandler, ControlEndpoint, EndpointConfig, EndpointError, StreamHandler,
};
pub use tls::{CertificateAuthority, IssuedCredentials, Pair, SniCertResolver, TlsError};
