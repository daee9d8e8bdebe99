// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! QUIC endpoint the supervisor's control plane listens on.

use std::net::SocketAddr;
use std::sync::Arc;

use quinn::{Endpoint, Incoming, RecvStream, SendStream, ServerConfig, TransportConfig};
use rustls::pki_types::CertificateDer;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use crate::frame::{Frame, FrameError, MessageType, read_frame, write_frame};
use crate::proto::{StreamError, StreamErrorCode};
use crate::tls::TlsError;

/// Errors that can occur in the QUIC endpoint
#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("bind error: {0}")]
    Bind(#[from] std::io::Error),

    #[error("connection error: {0}")]
    Connection(#[from] quinn::ConnectionError),

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("endpoint closed")]
    Closed,
}

impl From<TlsError> for EndpointError {
    fn from(e: TlsError) -> Self {
        EndpointError::Tls(e.to_string())
    }
}

impl EndpointError {
    /// Whether this error is a routine disconnect
    pub fn is_disconnect(&self) -> bool {
        match self {
            EndpointError::Connection(e) => matches!(
                e,
                quinn::ConnectionError::ApplicationClosed(_)
                    | quinn::ConnectionError::LocallyClosed
                    | quinn::ConnectionError::ConnectionClosed(_)
                    | quinn::ConnectionError::TimedOut
                    | quinn::ConnectionError::Reset
            ),
            EndpointError::Frame(e) => e.is_disconnect(),
            EndpointError::Closed => true,
            _ => false,
        }
    }
}

/// Configuration for the QUIC endpoint
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// Address to bind to
    pub bind_addr: SocketAddr,
    /// Maximum pending incoming connections (handshakes in progress)
    pub max_incoming: u32,
    /// Maximum concurrent bidirectional streams per connection
    pub max_bi_streams: u32,
    /// Idle timeout in milliseconds
    pub idle_timeout_ms: u64,
    /// Server-side keep-alive interval in milliseconds (0 to disable)
    pub keep_alive_interval_ms: u64,
    /// UDP receive buffer size in bytes (0 for OS default)
    pub udp_receive_buffer_size: usize,
    /// UDP send buffer size in bytes (0 for OS default)
    pub udp_send_buffer_size: usize,
    /// Maximum concurrent connection handlers (0 for unlimited)
    pub max_concurrent_handlers: u32,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 6789)),
            max_incoming: 256,
            // a worker needs two (checkin + actions); headroom for reconnects
            max_bi_streams: 8,
            idle_timeout_ms: 120_000,
            keep_alive_interval_ms: 15_000,
            udp_receive_buffer_size: 0,
            udp_send_buffer_size: 0,
            max_concurrent_handlers: 0,
        }
    }
}

impl EndpointConfig {
    /// Create a configuration from environment variables with defaults.
    ///
    /// Environment variables:
    /// - `STEWARD_QUIC_MAX_INCOMING`: Max pending handshakes (default: 256)
    /// - `STEWARD_QUIC_MAX_BI_STREAMS`: Max bidirectional streams per connection (default: 8)
    /// - `STEWARD_QUIC_IDLE_TIMEOUT_MS`: Idle timeout in ms (default: 120000)
    /// - `STEWARD_QUIC_KEEP_ALIVE_MS`: Keep-alive interval in ms, 0 to disable (default: 15000)
    /// - `STEWARD_QUIC_UDP_RECV_BUFFER`: UDP receive buffer size in bytes (default: OS)
    /// - `STEWARD_QUIC_UDP_SEND_BUFFER`: UDP send buffer size in bytes (default: OS)
    /// - `STEWARD_QUIC_MAX_HANDLERS`: Max concurrent connection handlers, 0 for unlimited (default: 0)
    pub fn from_env() -> Self {
        let default = Self::default();

        Self {
            bind_addr: default.bind_addr,
            max_incoming: env_or("STEWARD_QUIC_MAX_INCOMING", default.max_incoming),
            max_bi_streams: env_or("STEWARD_QUIC_MAX_BI_STREAMS", default.max_bi_streams),
            idle_timeout_ms: env_or("STEWARD_QUIC_IDLE_TIMEOUT_MS", default.idle_timeout_ms),
            keep_alive_interval_ms: env_or(
                "STEWARD_QUIC_KEEP_ALIVE_MS",
                default.keep_alive_interval_ms,
            ),
            udp_receive_buffer_size: env_or(
                "STEWARD_QUIC_UDP_RECV_BUFFER",
                default.udp_receive_buffer_size,
            ),
            udp_send_buffer_size: env_or(
                "STEWARD_QUIC_UDP_SEND_BUFFER",
                default.udp_send_buffer_size,
            ),
            max_concurrent_handlers: env_or(
                "STEWARD_QUIC_MAX_HANDLERS",
                default.max_concurrent_handlers,
            ),
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// QUIC endpoint for the control plane
pub struct ControlEndpoint {
    endpoint: Endpoint,
    config: EndpointConfig,
}

impl ControlEndpoint {
    /// Bind a new endpoint presenting `crypto` to connecting workers
    pub fn new(config: EndpointConfig, crypto: rustls::ServerConfig) -> Result<Self, EndpointError> {
        use socket2::{Domain, Protocol, Socket, Type};

        let server_config = Self::build_server_config(&config, crypto)?;

        let domain = if config.bind_addr.is_ipv6() {
            Domain::IPV6
        } else {
            Domain::IPV4
        };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;

        if config.udp_receive_buffer_size > 0
            && let Err(e) = socket.set_recv_buffer_size(config.udp_receive_buffer_size)
        {
            warn!(
                size = config.udp_receive_buffer_size,
                error = %e,
                "Failed to set UDP receive buffer size"
            );
        }
        if config.udp_send_buffer_size > 0
            && let Err(e) = socket.set_send_buffer_size(config.udp_send_buffer_size)
        {
            warn!(
                size = config.udp_send_buffer_size,
                error = %e,
                "Failed to set UDP send buffer size"
            );
        }

        socket.bind(&config.bind_addr.into())?;
        let std_socket: std::net::UdpSocket = socket.into();

        let runtime = quinn::default_runtime()
            .ok_or_else(|| EndpointError::Bind(std::io::Error::other("no async runtime found")))?;
        let endpoint = Endpoint::new_with_abstract_socket(
            quinn::EndpointConfig::default(),
            Some(server_config),
            runtime.wrap_udp_socket(std_socket)?,
            runtime,
        )?;

        info!(
            addr = %endpoint.local_addr()?,
            max_incoming = config.max_incoming,
            max_bi_streams = config.max_bi_streams,
            idle_timeout_ms = config.idle_timeout_ms,
            keep_alive_ms = config.keep_alive_interval_ms,
            max_handlers = config.max_concurrent_handlers,
            "control-plane endpoint bound"
        );

        Ok(Self { endpoint, config })
    }

    /// Get the endpoint configuration
    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    fn build_server_config(
        config: &EndpointConfig,
        crypto: rustls::ServerConfig,
    ) -> Result<ServerConfig, EndpointError> {
        let mut transport = TransportConfig::default();
        let idle = std::time::Duration::from_millis(config.idle_timeout_ms)
            .try_into()
            .map_err(|_| EndpointError::Tls("idle timeout out of range".to_string()))?;
        transport.max_idle_timeout(Some(idle));
        transport.max_concurrent_bidi_streams(config.max_bi_streams.into());
        transport.max_concurrent_uni_streams(0u32.into());

        if config.keep_alive_interval_ms > 0 {
            transport.keep_alive_interval(Some(std::time::Duration::from_millis(
                config.keep_alive_interval_ms,
            )));
        }

        let mut server_config = ServerConfig::with_crypto(Arc::new(
            quinn::crypto::rustls::QuicServerConfig::try_from(crypto)
                .map_err(|e| EndpointError::Tls(e.to_string()))?,
        ));
        server_config.transport_config(Arc::new(transport));
        server_config.max_incoming(config.max_incoming as usize);

        Ok(server_config)
    }

    /// Accept the next incoming connection
    pub async fn accept(&self) -> Option<Incoming> {
        self.endpoint.accept().await
    }

    /// Get the local address the endpoint is bound to
    pub fn local_addr(&self) -> Result<SocketAddr, EndpointError> {
        Ok(self.endpoint.local_addr()?)
    }

    /// Close the endpoint and every connection on it
    pub fn close(&self) {
        self.endpoint.close(0u32.into(), b"supervisor closing");
    }

    /// Run the accept loop with a connection handler until the endpoint is closed
    #[instrument(skip(self, handler))]
    pub async fn run<H, Fut>(&self, handler: H) -> Result<(), EndpointError>
    where
        H: Fn(ConnectionHandler) -> Fut + Send + Sync + Clone + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        use tokio::sync::Semaphore;

        info!("control-plane endpoint running");

        let semaphore = if self.config.max_concurrent_handlers > 0 {
            Some(Arc::new(Semaphore::new(
                self.config.max_concurrent_handlers as usize,
            )))
        } else {
            None
        };

        while let Some(incoming) = self.accept().await {
            let handler = handler.clone();
            let semaphore = semaphore.clone();

            tokio::spawn(async move {
                let _permit = if let Some(ref sem) = semaphore {
                    match sem.clone().acquire_owned().await {
                        Ok(permit) => Some(permit),
                        Err(_) => {
                            warn!("semaphore closed, dropping connection");
                            return;
                        }
                    }
                } else {
                    None
                };

                match incoming.await {
                    Ok(connection) => {
                        let remote_addr = connection.remote_address();
                        debug!(%remote_addr, "accepted connection");
                        handler(ConnectionHandler::new(connection)).await;
                    }
                    Err(e) => {
                        // failed handshakes land here, e.g. unknown SNI or a foreign client cert
                        warn!("failed to accept connection: {}", e);
                    }
                }
            });
        }

        Ok(())
    }
}

/// Handler for an individual worker connection
pub struct ConnectionHandler {
    connection: quinn::Connection,
}

impl ConnectionHandler {
    pub fn new(connection: quinn::Connection) -> Self {
        Self { connection }
    }

    /// Get the remote address of the connection
    pub fn remote_address(&self) -> SocketAddr {
        self.connection.remote_address()
    }

    /// The SNI name the worker asked for during the handshake
    pub fn server_name(&self) -> Option<String> {
        self.connection
            .handshake_data()?
            .downcast::<quinn::crypto::rustls::HandshakeData>()
            .ok()?
            .server_name
    }

    /// The certificate chain the worker authenticated with
    pub fn peer_certificates(&self) -> Option<Vec<CertificateDer<'static>>> {
        self.connection
            .peer_identity()?
            .downcast::<Vec<CertificateDer<'static>>>()
            .ok()
            .map(|certs| *certs)
    }

    /// Accept the next bidirectional stream
    pub async fn accept_bi(&self) -> Result<(SendStream, RecvStream), EndpointError> {
        Ok(self.connection.accept_bi().await?)
    }

    /// Run the connection with a stream handler until the worker goes away
    #[instrument(skip(self, handler), fields(remote = %self.remote_address()))]
    pub async fn run<H, Fut>(&self, handler: H)
    where
        H: Fn(StreamHandler) -> Fut + Send + Sync + Clone + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        loop {
            match self.accept_bi().await {
                Ok((send, recv)) => {
                    let handler = handler.clone();
                    tokio::spawn(async move {
                        handler(StreamHandler::new(send, recv)).await;
                    });
                }
                Err(e) => {
                    if e.is_disconnect() {
                        debug!("connection closed");
                    } else {
                        error!("error accepting stream: {}", e);
                    }
                    break;
                }
            }
        }
    }

    /// Check if the connection is still open
    pub fn is_open(&self) -> bool {
        self.connection.close_reason().is_none()
    }

    /// Close the connection
    pub fn close(&self, code: u32, reason: &[u8]) {
        self.connection.close(code.into(), reason);
    }
}

/// Handler for an individual bidirectional stream
pub struct StreamHandler {
    send: SendStream,
    recv: RecvStream,
}

impl StreamHandler {
    pub fn new(send: SendStream, recv: RecvStream) -> Self {
        Self { send, recv }
    }

    /// Read the next frame from the stream
    pub async fn read_frame(&mut self) -> Result<Frame, EndpointError> {
        Ok(read_frame(&mut self.recv).await?)
    }

    /// Write a frame to the stream
    pub async fn write_frame(&mut self, frame: &Frame) -> Result<(), EndpointError> {
        Ok(write_frame(&mut self.send, frame).await?)
    }

    /// Refuse the stream: send a `StreamError` and finish
    pub async fn reject(
        mut self,
        code: StreamErrorCode,
        message: &str,
    ) -> Result<(), EndpointError> {
        debug!(code = ?code, message, "rejecting stream");
        let err = StreamError {
            code: code as i32,
            message: message.to_string(),
        };
        let frame = Frame::new(MessageType::Error, &err)?;
        self.write_frame(&frame).await?;
        self.finish()
    }

    /// Finish the send stream (signal no more data)
    pub fn finish(&mut self) -> Result<(), EndpointError> {
        self.send
            .finish()
            .map_err(|e| EndpointError::Frame(FrameError::Io(std::io::Error::other(e))))?;
        Ok(())
    }

    /// Split into the send and receive halves so they can be driven by separate tasks
    pub fn into_parts(self) -> (SendStream, RecvStream) {
        (self.send, self.recv)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::{CertificateAuthority, SniCertResolver, provider, server_crypto};

    fn crypto() -> rustls::ServerConfig {
        let ca = CertificateAuthority::generate().unwrap();
        let resolver = Arc::new(SniCertResolver::new(provider()));
        server_crypto(&ca, resolver).unwrap()
    }

    #[test]
    fn test_default_config() {
        let config = EndpointConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:6789".parse().unwrap());
        assert_eq!(config.max_incoming, 256);
        assert_eq!(config.max_bi_streams, 8);
        assert_eq!(config.idle_timeout_ms, 120_000);
        assert_eq!(config.keep_alive_interval_ms, 15_000);
        assert_eq!(config.max_concurrent_handlers, 0);
    }

    #[tokio::test]
    async fn test_endpoint_binds_ephemeral_port() {
        let config = EndpointConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            ..Default::default()
        };
        let endpoint = ControlEndpoint::new(config, crypto()).unwrap();
        assert!(endpoint.local_addr().unwrap().port() > 0);
    }

    #[tokio::test]
    async fn test_accept_after_close() {
        let config = EndpointConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            ..Default::default()
        };
        let endpoint = ControlEndpoint::new(config, crypto()).unwrap();
        endpoint.close();
        assert!(endpoint.accept().await.is_none());
    }

    #[test]
    fn test_error_display() {
        let err = EndpointError::Tls("bad certificate".to_string());
        assert_eq!(format!("{}", err), "TLS error: bad certificate");
        assert_eq!(format!("{}", EndpointError::Closed), "endpoint closed");
    }

    #[test]
    fn test_disconnect_classification() {
        assert!(EndpointError::Closed.is_disconnect());
        assert!(EndpointError::Connection(quinn::ConnectionError::LocallyClosed).is_disconnect());
        assert!(!EndpointError::Tls("x".to_string()).is_disconnect());
    }
}
