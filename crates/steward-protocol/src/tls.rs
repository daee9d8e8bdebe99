// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mutual TLS for the control plane.
//!
//! The supervisor runs its own certificate authority. Every registration gets a
//! random server name and a certificate pair signed by that CA: the server half
//! is presented when a worker asks for that name via SNI, the client half is
//! what the worker authenticates with.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    IsCa, KeyPair, KeyUsagePurpose,
};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert, WebPkiClientVerifier};
use rustls::sign::CertifiedKey;
use thiserror::Error;
use tracing::debug;

/// Errors produced while issuing certificates or building TLS configurations
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("certificate generation failed: {0}")]
    Generate(#[from] rcgen::Error),

    #[error("rustls error: {0}")]
    Rustls(#[from] rustls::Error),

    #[error("client verifier error: {0}")]
    Verifier(#[from] rustls::server::VerifierBuilderError),

    #[error("invalid PEM: {0}")]
    Pem(String),
}

/// A PEM certificate and its PEM private key.
#[derive(Clone)]
pub struct Pair {
    pub cert_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
}

impl std::fmt::Debug for Pair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pair")
            .field("cert_pem", &String::from_utf8_lossy(&self.cert_pem))
            .field("key_pem", &"<redacted>")
            .finish()
    }
}

impl Pair {
    /// Parse the certificate chain.
    pub fn certs(&self) -> Result<Vec<CertificateDer<'static>>, TlsError> {
        rustls_pemfile::certs(&mut self.cert_pem.as_slice())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| TlsError::Pem(format!("failed to parse certificates: {}", e)))
    }

    /// Parse the private key.
    pub fn key(&self) -> Result<PrivateKeyDer<'static>, TlsError> {
        rustls_pemfile::private_key(&mut self.key_pem.as_slice())
            .map_err(|e| TlsError::Pem(format!("failed to parse private key: {}", e)))?
            .ok_or_else(|| TlsError::Pem("no private key found".to_string()))
    }
}

/// Credentials issued for one registration.
#[derive(Debug, Clone)]
pub struct IssuedCredentials {
    pub server_name: String,
    /// Presented by the server when SNI equals `server_name`.
    pub server: Pair,
    /// Handed to the worker for client authentication.
    pub client: Pair,
}

/// In-process certificate authority.
pub struct CertificateAuthority {
    cert: rcgen::Certificate,
    key: KeyPair,
    cert_pem: Vec<u8>,
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority").finish_non_exhaustive()
    }
}

impl CertificateAuthority {
    /// Generate a fresh self-signed CA.
    pub fn generate() -> Result<Self, TlsError> {
        let mut params = CertificateParams::new(Vec::<String>::new())?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "steward control plane CA");
        dn.push(DnType::OrganizationName, "steward");
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let key = KeyPair::generate()?;
        let cert = params.self_signed(&key)?;
        let cert_pem = cert.pem().into_bytes();

        Ok(Self {
            cert,
            key,
            cert_pem,
        })
    }

    /// PEM encoded CA certificate.
    pub fn cert_pem(&self) -> &[u8] {
        &self.cert_pem
    }

    /// DER encoded CA certificate.
    pub fn cert_der(&self) -> CertificateDer<'static> {
        self.cert.der().clone()
    }

    /// Issue the server/client pair for `server_name`.
    pub fn issue(&self, server_name: &str) -> Result<IssuedCredentials, TlsError> {
        let server = self.sign_leaf(server_name, ExtendedKeyUsagePurpose::ServerAuth)?;
        let client = self.sign_leaf(server_name, ExtendedKeyUsagePurpose::ClientAuth)?;
        debug!(server_name, "issued control-plane credentials");
        Ok(IssuedCredentials {
            server_name: server_name.to_string(),
            server,
            client,
        })
    }

    fn sign_leaf(&self, name: &str, usage: ExtendedKeyUsagePurpose) -> Result<Pair, TlsError> {
        let mut params = CertificateParams::new(vec![name.to_string()])?;
        params.distinguished_name.push(DnType::CommonName, name);
        params.is_ca = IsCa::ExplicitNoCa;
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.extended_key_usages = vec![usage];

        let key = KeyPair::generate()?;
        let cert = params.signed_by(&key, &self.cert, &self.key)?;

        Ok(Pair {
            cert_pem: cert.pem().into_bytes(),
            key_pem: key.serialize_pem().into_bytes(),
        })
    }
}

/// The crypto provider used on both ends.
pub fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Picks the server certificate by the SNI name the worker asks for.
///
/// Unknown or missing names get no certificate, which aborts the handshake.
#[derive(Debug)]
pub struct SniCertResolver {
    provider: Arc<CryptoProvider>,
    certs: RwLock<HashMap<String, Arc<CertifiedKey>>>,
}

impl SniCertResolver {
    pub fn new(provider: Arc<CryptoProvider>) -> Self {
        Self {
            provider,
            certs: RwLock::new(HashMap::new()),
        }
    }

    /// Make `pair` available under `server_name`.
    pub fn insert(&self, server_name: &str, pair: &Pair) -> Result<(), TlsError> {
        let signing_key = self.provider.key_provider.load_private_key(pair.key()?)?;
        let certified = Arc::new(CertifiedKey::new(pair.certs()?, signing_key));
        let mut certs = self
            .certs
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        certs.insert(server_name.to_string(), certified);
        Ok(())
    }

    /// Forget `server_name`; later handshakes for it fail.
    pub fn remove(&self, server_name: &str) {
        let mut certs = self
            .certs
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        certs.remove(server_name);
    }

    pub fn len(&self) -> usize {
        self.certs
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ResolvesServerCert for SniCertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let name = client_hello.server_name()?;
        let certs = self
            .certs
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let found = certs.get(name).cloned();
        if found.is_none() {
            debug!(server_name = name, "no certificate registered for server name");
        }
        found
    }
}

/// Server side: TLS 1.3, client certificates required and chained to `ca`,
/// server certificate chosen by `resolver`.
pub fn server_crypto(
    ca: &CertificateAuthority,
    resolver: Arc<SniCertResolver>,
) -> Result<rustls::ServerConfig, TlsError> {
    let provider = provider();
    let mut roots = rustls::RootCertStore::empty();
    roots.add(ca.cert_der())?;

    let verifier =
        WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider.clone()).build()?;

    let mut config = rustls::ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13])?
        .with_client_cert_verifier(verifier)
        .with_cert_resolver(resolver);
    config.alpn_protocols = vec![crate::ALPN.to_vec()];
    Ok(config)
}

/// Client side: trusts only the supervisor CA and authenticates with `client`.
pub fn client_crypto(ca_pem: &[u8], client: &Pair) -> Result<rustls::ClientConfig, TlsError> {
    let mut roots = rustls::RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut &ca_pem[..]) {
        let cert = cert.map_err(|e| TlsError::Pem(format!("failed to parse CA: {}", e)))?;
        roots.add(cert)?;
    }
    if roots.is_empty() {
        return Err(TlsError::Pem("no CA certificate found".to_string()));
    }

    let mut config = rustls::ClientConfig::builder_with_provider(provider())
        .with_protocol_versions(&[&rustls::version::TLS13])?
        .with_root_certificates(roots)
        .with_client_auth_cert(client.certs()?, client.key()?)?;
    config.alpn_protocols = vec![crate::ALPN.to_vec()];
    Ok(config)
}
