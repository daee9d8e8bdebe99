// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker-side client for the control plane.
//!
//! A supervised process reads its [`ConnInfo`] (stdin or the loopback
//! credentials listener), connects with it and opens the two streams.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use prost::Message;
use quinn::{ClientConfig, Connection, Endpoint, RecvStream, SendStream, TransportConfig};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

use crate::frame::{FrameError, FramedStream, MessageType};
use crate::proto::{
    ActionRequest, ActionResponse, ConnInfo, StateExpected, StateObserved, StreamError,
    StreamErrorCode,
};
use crate::tls::{Pair, TlsError, client_crypto};

/// Errors that can occur in the worker client
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connection error: {0}")]
    Connection(#[from] quinn::ConnectionError),

    #[error("connect error: {0}")]
    Connect(#[from] quinn::ConnectError),

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),

    #[error("invalid connection info: {0}")]
    InvalidConnInfo(String),

    #[error("stream rejected ({code:?}): {message}")]
    Rejected {
        code: StreamErrorCode,
        message: String,
    },

    #[error("no connection established")]
    NotConnected,

    #[error("connection timed out after {0}ms")]
    Timeout(u64),
}

impl From<StreamError> for ClientError {
    fn from(e: StreamError) -> Self {
        ClientError::Rejected {
            code: e.code(),
            message: e.message,
        }
    }
}

/// Transport tuning for the worker client
#[derive(Debug, Clone)]
pub struct ControlClientConfig {
    /// Keep-alive interval in milliseconds (0 to disable)
    pub keep_alive_interval_ms: u64,
    /// Idle timeout in milliseconds
    pub idle_timeout_ms: u64,
    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,
}

impl Default for ControlClientConfig {
    fn default() -> Self {
        Self {
            keep_alive_interval_ms: 10_000,
            idle_timeout_ms: 120_000,
            connect_timeout_ms: 10_000,
        }
    }
}

/// Read a `ConnInfo` blob until EOF, e.g. from the process's stdin.
pub async fn read_conn_info<R: AsyncRead + Unpin>(reader: &mut R) -> Result<ConnInfo, ClientError> {
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf).await?;
    ConnInfo::decode(buf.as_slice()).map_err(|e| ClientError::InvalidConnInfo(e.to_string()))
}

/// Control-plane client for one worker
pub struct ControlClient {
    endpoint: Endpoint,
    connection: Mutex<Option<Connection>>,
    server_addr: SocketAddr,
    server_name: String,
    token: String,
    config: ControlClientConfig,
}

impl ControlClient {
    /// Build a client from the credentials the supervisor handed over
    pub fn from_conn_info(info: &ConnInfo) -> Result<Self, ClientError> {
        Self::with_config(info, ControlClientConfig::default())
    }

    pub fn with_config(info: &ConnInfo, config: ControlClientConfig) -> Result<Self, ClientError> {
        let server_addr: SocketAddr = info
            .addr
            .parse()
            .map_err(|_| ClientError::InvalidConnInfo(format!("bad address {:?}", info.addr)))?;
        if info.token.is_empty() {
            return Err(ClientError::InvalidConnInfo("missing token".to_string()));
        }

        let bind: SocketAddr = if server_addr.is_ipv6() {
            SocketAddr::from(([0u16; 8], 0))
        } else {
            SocketAddr::from(([0, 0, 0, 0], 0))
        };
        let mut endpoint = Endpoint::client(bind)?;

        let peer = Pair {
            cert_pem: info.peer_cert.clone(),
            key_pem: info.peer_key.clone(),
        };
        endpoint.set_default_client_config(Self::build_client_config(
            &config,
            &info.ca_cert,
            &peer,
        )?);

        Ok(Self {
            endpoint,
            connection: Mutex::new(None),
            server_addr,
            server_name: info.server_name.clone(),
            token: info.token.clone(),
            config,
        })
    }

    fn build_client_config(
        config: &ControlClientConfig,
        ca_pem: &[u8],
        peer: &Pair,
    ) -> Result<ClientConfig, ClientError> {
        let crypto = client_crypto(ca_pem, peer)?;

        let mut transport = TransportConfig::default();
        if config.keep_alive_interval_ms > 0 {
            transport.keep_alive_interval(Some(Duration::from_millis(
                config.keep_alive_interval_ms,
            )));
        }
        let idle = Duration::from_millis(config.idle_timeout_ms)
            .try_into()
            .map_err(|_| ClientError::InvalidConnInfo("idle timeout out of range".to_string()))?;
        transport.max_idle_timeout(Some(idle));

        let quic = quinn::crypto::rustls::QuicClientConfig::try_from(crypto)
            .map_err(|e| ClientError::Tls(TlsError::Pem(e.to_string())))?;
        let mut client_config = ClientConfig::new(Arc::new(quic));
        client_config.transport_config(Arc::new(transport));

        Ok(client_config)
    }

    /// The token this worker authenticates with
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Connect to the supervisor, reusing a live connection
    #[instrument(skip(self), fields(server_name = %self.server_name))]
    pub async fn connect(&self) -> Result<(), ClientError> {
        let mut conn_guard = self.connection.lock().await;

        if let Some(ref conn) = *conn_guard
            && conn.close_reason().is_none()
        {
            debug!("reusing existing connection");
            return Ok(());
        }

        info!(addr = %self.server_addr, "connecting to supervisor");

        let timeout = Duration::from_millis(self.config.connect_timeout_ms);
        let connecting = self.endpoint.connect(self.server_addr, &self.server_name)?;

        let connection = tokio::time::timeout(timeout, connecting)
            .await
            .map_err(|_| ClientError::Timeout(self.config.connect_timeout_ms))??;

        info!("connected to supervisor");
        *conn_guard = Some(connection);
        Ok(())
    }

    async fn get_connection(&self) -> Result<Connection, ClientError> {
        self.connect().await?;
        let conn_guard = self.connection.lock().await;
        conn_guard.clone().ok_or(ClientError::NotConnected)
    }

    /// Open the Checkin stream. Nothing is sent until the first [`CheckinStream::send`].
    pub async fn open_checkin(&self) -> Result<CheckinStream, ClientError> {
        let conn = self.get_connection().await?;
        let (send, recv) = conn.open_bi().await?;
        Ok(CheckinStream {
            token: self.token.clone(),
            send: FramedStream::new(send),
            recv: FramedStream::new(recv),
        })
    }

    /// Open the Actions stream and send the reserved `init` response.
    pub async fn open_actions(&self) -> Result<ActionsStream, ClientError> {
        let conn = self.get_connection().await?;
        let (send, recv) = conn.open_bi().await?;
        let mut stream = ActionsStream {
            token: self.token.clone(),
            send: FramedStream::new(send),
            recv: FramedStream::new(recv),
        };
        stream
            .send
            .write_message(MessageType::ActionResponse, &ActionResponse::init(&self.token))
            .await?;
        Ok(stream)
    }

    /// Close the connection gracefully
    pub async fn close(&self) {
        let mut conn_guard = self.connection.lock().await;
        if let Some(conn) = conn_guard.take() {
            conn.close(0u32.into(), b"worker closing");
        }
    }

    /// Check if the client is currently connected
    pub async fn is_connected(&self) -> bool {
        let conn_guard = self.connection.lock().await;
        if let Some(ref conn) = *conn_guard {
            conn.close_reason().is_none()
        } else {
            false
        }
    }
}

impl Drop for ControlClient {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.connection.try_lock()
            && let Some(conn) = guard.take()
        {
            conn.close(0u32.into(), b"worker dropped");
        }
    }
}

async fn read_server_message<M: Message + Default>(
    recv: &mut FramedStream<RecvStream>,
    expected: MessageType,
) -> Result<M, ClientError> {
    let frame = recv.read_frame().await?;
    if frame.message_type == MessageType::Error {
        let err: StreamError = frame.decode()?;
        return Err(err.into());
    }
    Ok(frame.decode_as(expected)?)
}

/// Worker half of a Checkin stream
pub struct CheckinStream {
    token: String,
    send: FramedStream<SendStream>,
    recv: FramedStream<RecvStream>,
}

impl CheckinStream {
    /// Report observed state. An empty token is filled in with the client's token.
    pub async fn send(&mut self, mut observed: StateObserved) -> Result<(), ClientError> {
        if observed.token.is_empty() {
            observed.token = self.token.clone();
        }
        self.send
            .write_message(MessageType::Observed, &observed)
            .await?;
        Ok(())
    }

    /// Wait for the next expected state from the supervisor
    pub async fn recv(&mut self) -> Result<StateExpected, ClientError> {
        read_server_message(&mut self.recv, MessageType::Expected).await
    }

    /// Close the worker's side of the stream
    pub fn finish(&mut self) -> Result<(), ClientError> {
        self.send
            .get_mut()
            .finish()
            .map_err(|e| ClientError::Io(std::io::Error::other(e)))
    }
}

/// Worker half of an Actions stream
pub struct ActionsStream {
    token: String,
    send: FramedStream<SendStream>,
    recv: FramedStream<RecvStream>,
}

impl ActionsStream {
    /// Wait for the next action request
    pub async fn recv(&mut self) -> Result<ActionRequest, ClientError> {
        read_server_message(&mut self.recv, MessageType::ActionRequest).await
    }

    /// Send the result of an action
    pub async fn respond(&mut self, mut response: ActionResponse) -> Result<(), ClientError> {
        if response.token.is_empty() {
            response.token = self.token.clone();
        }
        self.send
            .write_message(MessageType::ActionResponse, &response)
            .await?;
        Ok(())
    }

    /// Close the worker's side of the stream
    pub fn finish(&mut self) -> Result<(), ClientError> {
        self.send
            .get_mut()
            .finish()
            .map_err(|e| ClientError::Io(std::io::Error::other(e)))
    }
}
