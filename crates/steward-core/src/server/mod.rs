// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Control-plane server.
//!
//! Workers connect over mutually authenticated QUIC and open two streams:
//!
//! - **Checkin**: the worker reports `StateObserved`, the server answers with
//!   `StateExpected` whenever the worker is behind.
//! - **Actions**: the server sends `ActionRequest`s, the worker answers with
//!   `ActionResponse`s matched by id.
//!
//! Each registered application gets an [`ApplicationState`] holding a random
//! token and its own server certificate, selected by SNI during the handshake.
//! A [`watchdog`] demotes workers that stop checking in.

mod actions;
mod app_state;
mod checkin;
pub mod watchdog;

use std::any::Any;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use steward_protocol::frame::MessageType;
use steward_protocol::proto::{
    ACTION_RESPONSE_INIT_ID, ActionResponse, StateObserved, StateObservedStatus, StreamErrorCode,
};
use steward_protocol::tls::{CertificateAuthority, SniCertResolver, provider, server_crypto};
use steward_protocol::{
    ConnectionHandler, ControlEndpoint, EndpointConfig, EndpointError, StreamHandler, TlsError,
};
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::error::ErrorKind;
use crate::sync::{lock, read, write};

pub use app_state::ApplicationState;

/// Control-plane errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("application already registered")]
    ApplicationAlreadyRegistered,

    #[error("application is stopping")]
    ApplicationStopping,

    #[error("application stop timed out")]
    ApplicationStopTimedOut,

    #[error("action timed out")]
    ActionTimedOut,

    #[error("action cancelled")]
    ActionCancelled,

    #[error("action failed: {0}")]
    ActionFailed(String),

    #[error("server is not started")]
    NotStarted,

    #[error("invalid action payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("endpoint error: {0}")]
    Endpoint(#[from] EndpointError),

    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),
}

impl ServerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ServerError::Tls(_) => ErrorKind::Security,
            _ => ErrorKind::Application,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            ServerError::ApplicationAlreadyRegistered => "APPLICATION_ALREADY_REGISTERED",
            ServerError::ApplicationStopping => "APPLICATION_STOPPING",
            ServerError::ApplicationStopTimedOut => "APPLICATION_STOP_TIMED_OUT",
            ServerError::ActionTimedOut => "ACTION_TIMED_OUT",
            ServerError::ActionCancelled => "ACTION_CANCELLED",
            ServerError::ActionFailed(_) => "ACTION_FAILED",
            ServerError::NotStarted => "SERVER_NOT_STARTED",
            ServerError::Payload(_) => "INVALID_PAYLOAD",
            ServerError::Endpoint(_) => "ENDPOINT_ERROR",
            ServerError::Tls(_) => "TLS_ERROR",
        }
    }
}

/// Server tuning
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// QUIC endpoint settings, including the bind address
    pub endpoint: EndpointConfig,
    /// How long a new stream may stay silent before its first message
    pub checkin_initial_timeout: Duration,
    /// Age of the last check-in after which the watchdog demotes a worker
    pub checkin_min_timeout: Duration,
    /// Watchdog tick interval
    pub watchdog_interval: Duration,
    /// Default timeout for [`ApplicationState::perform_action`]
    pub action_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            endpoint: EndpointConfig::default(),
            checkin_initial_timeout: Duration::from_secs(5),
            checkin_min_timeout: Duration::from_secs(40),
            watchdog_interval: Duration::from_secs(5),
            action_timeout: Duration::from_secs(15),
        }
    }
}

/// Receives status changes of registered applications.
///
/// Called once per actual change, either from a worker's check-in or from
/// the watchdog. Never called with locks held.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn on_status_change(
        &self,
        state: &Arc<ApplicationState>,
        status: StateObservedStatus,
        message: &str,
        payload: Option<&Map<String, Value>>,
    );
}

/// Control-plane server
pub struct Server {
    config: ServerConfig,
    ca: CertificateAuthority,
    resolver: Arc<SniCertResolver>,
    handler: Arc<dyn Handler>,
    apps: RwLock<HashMap<String, Arc<ApplicationState>>>,
    endpoint: Mutex<Option<Arc<ControlEndpoint>>>,
    shutdown: CancellationToken,
    me: Weak<Server>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("config", &self.config)
            .field("apps", &self.len())
            .finish()
    }
}

impl Server {
    /// Create a server with a fresh certificate authority. Nothing is bound
    /// until [`Server::start`].
    pub fn new(config: ServerConfig, handler: Arc<dyn Handler>) -> Result<Arc<Self>, ServerError> {
        let ca = CertificateAuthority::generate()?;
        Ok(Arc::new_cyclic(|me| Self {
            config,
            ca,
            resolver: Arc::new(SniCertResolver::new(provider())),
            handler,
            apps: RwLock::new(HashMap::new()),
            endpoint: Mutex::new(None),
            shutdown: CancellationToken::new(),
            me: me.clone(),
        }))
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Register `app` with its initial configuration.
    ///
    /// Issues a random token and a per-application server certificate; the
    /// returned state carries the worker's connection info.
    #[instrument(skip(self, app, initial_config))]
    pub fn register(
        &self,
        app: Arc<dyn Any + Send + Sync>,
        initial_config: impl Into<String>,
    ) -> Result<Arc<ApplicationState>, ServerError> {
        let mut apps = write(&self.apps);
        if apps.values().any(|s| !s.is_destroyed() && s.belongs_to(&app)) {
            return Err(ServerError::ApplicationAlreadyRegistered);
        }

        let token = Uuid::new_v4().to_string();
        let server_name = format!("w{}", Uuid::new_v4().simple());
        let credentials = self.ca.issue(&server_name)?;
        self.resolver.insert(&server_name, &credentials.server)?;

        let state = Arc::new(ApplicationState::new(
            token.clone(),
            credentials,
            self.ca.cert_pem().to_vec(),
            Arc::downgrade(&app),
            self.me.clone(),
            initial_config.into(),
        ));
        apps.insert(token.clone(), state.clone());

        debug!(token = %token, server_name = %state.server_name(), "application registered");
        Ok(state)
    }

    /// Look up a registration by token.
    pub fn get(&self, token: &str) -> Option<Arc<ApplicationState>> {
        read(&self.apps).get(token).cloned()
    }

    /// Number of live registrations.
    pub fn len(&self) -> usize {
        read(&self.apps).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bind the endpoint and spawn the accept loop and the watchdog.
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<SocketAddr, ServerError> {
        let crypto = server_crypto(&self.ca, self.resolver.clone())?;
        let endpoint = Arc::new(ControlEndpoint::new(self.config.endpoint.clone(), crypto)?);
        let addr = endpoint.local_addr()?;
        *lock(&self.endpoint) = Some(endpoint.clone());

        let weak = self.me.clone();
        tokio::spawn(async move {
            let result = endpoint
                .run(move |conn: ConnectionHandler| {
                    let weak = weak.clone();
                    async move {
                        if let Some(server) = weak.upgrade() {
                            server.handle_connection(conn).await;
                        }
                    }
                })
                .await;
            if let Err(e) = result {
                warn!(error = %e, "control-plane accept loop ended");
            }
        });

        tokio::spawn(watchdog::run(
            self.me.clone(),
            self.config.watchdog_interval,
            self.shutdown.clone(),
        ));

        info!(%addr, "control-plane server started");
        Ok(addr)
    }

    /// Stop the watchdog and close the endpoint with every connection on it.
    pub fn stop(&self) {
        self.shutdown.cancel();
        if let Some(endpoint) = lock(&self.endpoint).take() {
            endpoint.close();
        }
        info!("control-plane server stopped");
    }

    /// Address the endpoint is bound to.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        lock(&self.endpoint)
            .as_ref()
            .and_then(|e| e.local_addr().ok())
    }

    /// Address a local worker should dial: the bound address, with an
    /// unspecified IP replaced by loopback.
    pub(crate) fn dial_addr(&self) -> Option<SocketAddr> {
        let mut addr = self.local_addr()?;
        if addr.ip().is_unspecified() {
            let loopback = match addr.ip() {
                IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
                IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::LOCALHOST),
            };
            addr.set_ip(loopback);
        }
        Some(addr)
    }

    /// One watchdog pass: flush expired actions everywhere and demote every
    /// application whose last check-in is older than `checkin_min_timeout`.
    pub async fn watchdog_tick(&self, now: Instant) {
        let states: Vec<Arc<ApplicationState>> = read(&self.apps).values().cloned().collect();
        for state in states {
            state.flush_expired_actions(now);
            if let Some(change) = state.demote_if_stale(now, self.config.checkin_min_timeout) {
                info!(
                    token = %state.token(),
                    status = change.status.as_str_name(),
                    message = change.message,
                    "watchdog changed application status"
                );
                self.handler
                    .on_status_change(&state, change.status, change.message, change.payload.as_ref())
                    .await;
            }
        }
    }

    pub(crate) fn handler(&self) -> &Arc<dyn Handler> {
        &self.handler
    }

    /// Drop a registration and its certificate.
    pub(crate) fn unregister(&self, token: &str, server_name: &str) {
        write(&self.apps).remove(token);
        self.resolver.remove(server_name);
    }

    async fn handle_connection(self: Arc<Self>, conn: ConnectionHandler) {
        let sni = conn.server_name();
        let weak = self.me.clone();
        conn.run(move |stream: StreamHandler| {
            let weak = weak.clone();
            let sni = sni.clone();
            async move {
                if let Some(server) = weak.upgrade() {
                    server.handle_stream(stream, sni).await;
                }
            }
        })
        .await;
    }

    /// Route a new stream by its first frame.
    async fn handle_stream(&self, mut stream: StreamHandler, sni: Option<String>) {
        let first = match tokio::time::timeout(
            self.config.checkin_initial_timeout,
            stream.read_frame(),
        )
        .await
        {
            Ok(Ok(frame)) => frame,
            Ok(Err(e)) => {
                if !e.is_disconnect() {
                    warn!(error = %e, "failed to read initial message");
                }
                return;
            }
            Err(_) => {
                reject(
                    stream,
                    StreamErrorCode::DeadlineExceeded,
                    "did not receive initial message within timeout",
                )
                .await;
                return;
            }
        };

        match first.message_type {
            MessageType::Observed => {
                let observed: StateObserved = match first.decode() {
                    Ok(observed) => observed,
                    Err(e) => {
                        reject(stream, StreamErrorCode::InvalidArgument, &e.to_string()).await;
                        return;
                    }
                };
                match self.authorize(&observed.token, sni.as_deref()) {
                    Ok(state) => checkin::serve(state, stream, observed).await,
                    Err((code, message)) => reject(stream, code, message).await,
                }
            }
            MessageType::ActionResponse => {
                let init: ActionResponse = match first.decode() {
                    Ok(init) => init,
                    Err(e) => {
                        reject(stream, StreamErrorCode::InvalidArgument, &e.to_string()).await;
                        return;
                    }
                };
                if init.id != ACTION_RESPONSE_INIT_ID {
                    reject(
                        stream,
                        StreamErrorCode::InvalidArgument,
                        "initial response must be an init message",
                    )
                    .await;
                    return;
                }
                match self.authorize(&init.token, sni.as_deref()) {
                    Ok(state) => actions::serve(state, stream).await,
                    Err((code, message)) => reject(stream, code, message).await,
                }
            }
            other => {
                debug!(message_type = ?other, "unexpected initial message");
                reject(
                    stream,
                    StreamErrorCode::InvalidArgument,
                    "unexpected initial message",
                )
                .await;
            }
        }
    }

    /// The token must belong to a live registration whose server name is the
    /// one this connection's handshake asked for.
    fn authorize(
        &self,
        token: &str,
        sni: Option<&str>,
    ) -> Result<Arc<ApplicationState>, (StreamErrorCode, &'static str)> {
        let Some(state) = self.get(token) else {
            debug!(token, "unknown token");
            return Err((StreamErrorCode::PermissionDenied, "invalid token"));
        };
        if state.is_destroyed() {
            return Err((StreamErrorCode::Unavailable, "application cannot connect"));
        }
        if sni != Some(state.server_name()) {
            warn!(token, sni = ?sni, "server name does not match token");
            return Err((StreamErrorCode::PermissionDenied, "invalid server name"));
        }
        Ok(state)
    }
}

async fn reject(stream: StreamHandler, code: StreamErrorCode, message: &str) {
    if let Err(e) = stream.reject(code, message).await
        && !e.is_disconnect()
    {
        warn!(error = %e, "failed to send stream rejection");
    }
}
