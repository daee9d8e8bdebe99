// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! End-to-end mutual TLS tests: CA, SNI selection and framed streams over QUIC.

use std::net::SocketAddr;
use std::sync::Arc;

use steward_protocol::client::{ClientError, ControlClient};
use steward_protocol::frame::{Frame, MessageType};
use steward_protocol::proto::{
    ConnInfo, StateExpected, StateExpectedState, StateObserved, StateObservedStatus,
    StreamErrorCode,
};
use steward_protocol::server::{ConnectionHandler, ControlEndpoint, EndpointConfig, StreamHandler};
use steward_protocol::tls::{
    CertificateAuthority, IssuedCredentials, SniCertResolver, provider, server_crypto,
};

struct Harness {
    ca: Arc<CertificateAuthority>,
    resolver: Arc<SniCertResolver>,
    endpoint: Arc<ControlEndpoint>,
    addr: SocketAddr,
}

impl Harness {
    /// Endpoint that echoes every Observed message back as an Expected message
    /// whose config is the observed message text. A message of "reject" gets
    /// an AlreadyExists rejection instead.
    fn start() -> Self {
        let ca = Arc::new(CertificateAuthority::generate().unwrap());
        let resolver = Arc::new(SniCertResolver::new(provider()));
        let crypto = server_crypto(&ca, resolver.clone()).unwrap();
        let config = EndpointConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            ..Default::default()
        };
        let endpoint = Arc::new(ControlEndpoint::new(config, crypto).unwrap());
        let addr = endpoint.local_addr().unwrap();

        let runner = endpoint.clone();
        tokio::spawn(async move {
            let _ = runner
                .run(|conn: ConnectionHandler| async move {
                    let sni = conn.server_name().unwrap_or_default();
                    assert!(conn.peer_certificates().is_some());
                    conn.run(move |stream: StreamHandler| {
                        let sni = sni.clone();
                        async move { echo(stream, sni).await }
                    })
                    .await;
                })
                .await;
        });

        Self {
            ca,
            resolver,
            endpoint,
            addr,
        }
    }

    fn register(&self, server_name: &str) -> IssuedCredentials {
        let creds = self.ca.issue(server_name).unwrap();
        self.resolver.insert(server_name, &creds.server).unwrap();
        creds
    }

    fn conn_info(&self, creds: &IssuedCredentials, ca_pem: &[u8]) -> ConnInfo {
        ConnInfo {
            addr: self.addr.to_string(),
            server_name: creds.server_name.clone(),
            token: format!("token-{}", creds.server_name),
            ca_cert: ca_pem.to_vec(),
            peer_cert: creds.client.cert_pem.clone(),
            peer_key: creds.client.key_pem.clone(),
        }
    }
}

async fn echo(mut stream: StreamHandler, sni: String) {
    loop {
        let Ok(frame) = stream.read_frame().await else {
            return;
        };
        let observed: StateObserved = frame.decode_as(MessageType::Observed).unwrap();
        if observed.message == "reject" {
            let _ = stream
                .reject(StreamErrorCode::AlreadyExists, "application already connected")
                .await;
            return;
        }
        let expected = StateExpected {
            state: StateExpectedState::Running as i32,
            config_state_idx: observed.config_state_idx + 1,
            config: format!("{}:{}", sni, observed.message),
        };
        let frame = Frame::new(MessageType::Expected, &expected).unwrap();
        if stream.write_frame(&frame).await.is_err() {
            return;
        }
    }
}

fn observed(message: &str, idx: u64) -> StateObserved {
    StateObserved {
        status: StateObservedStatus::Healthy as i32,
        message: message.to_string(),
        config_state_idx: idx,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_checkin_round_trip_over_mtls() {
    let harness = Harness::start();
    let creds = harness.register("wroundtrip");
    let info = harness.conn_info(&creds, harness.ca.cert_pem());

    let client = ControlClient::from_conn_info(&info).unwrap();
    let mut checkin = client.open_checkin().await.unwrap();
    checkin.send(observed("hello", 1)).await.unwrap();

    let expected = checkin.recv().await.unwrap();
    assert_eq!(expected.config_state_idx, 2);
    // the server saw the SNI name the worker was issued
    assert_eq!(expected.config, "wroundtrip:hello");
    assert!(client.is_connected().await);

    client.close().await;
    harness.endpoint.close();
}

#[tokio::test]
async fn test_unknown_server_name_fails_handshake() {
    let harness = Harness::start();
    let creds = harness.ca.issue("wunregistered").unwrap();
    let info = harness.conn_info(&creds, harness.ca.cert_pem());

    let client = ControlClient::from_conn_info(&info).unwrap();
    assert!(client.connect().await.is_err());
    harness.endpoint.close();
}

#[tokio::test]
async fn test_foreign_ca_is_rejected() {
    let harness = Harness::start();
    harness.register("wforeign");

    // same server name, but credentials from an unrelated authority
    let other = CertificateAuthority::generate().unwrap();
    let forged = other.issue("wforeign").unwrap();
    let info = harness.conn_info(&forged, harness.ca.cert_pem());

    let client = ControlClient::from_conn_info(&info).unwrap();
    let result = async {
        let mut checkin = client.open_checkin().await?;
        checkin.send(observed("hello", 1)).await?;
        checkin.recv().await
    }
    .await;
    assert!(result.is_err());
    harness.endpoint.close();
}

#[tokio::test]
async fn test_rejection_surfaces_as_client_error() {
    let harness = Harness::start();
    let creds = harness.register("wrejected");
    let info = harness.conn_info(&creds, harness.ca.cert_pem());

    let client = ControlClient::from_conn_info(&info).unwrap();
    let mut checkin = client.open_checkin().await.unwrap();
    checkin.send(observed("reject", 1)).await.unwrap();

    match checkin.recv().await {
        Err(ClientError::Rejected { code, message }) => {
            assert_eq!(code, StreamErrorCode::AlreadyExists);
            assert_eq!(message, "application already connected");
        }
        other => panic!("expected rejection, got {:?}", other.map(|_| ())),
    }
    harness.endpoint.close();
}
