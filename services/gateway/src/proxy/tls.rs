//! TLS configuration for the terminating mode.
//!
//! The inbound leg is a server-role session using the certificate and key
//! from configuration. The outbound leg is a client-role session toward the
//! backend whose certificate check is chosen by [`BackendVerification`].

use std::io::BufReader;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, Error as RustlsError, RootCertStore, ServerConfig, SignatureScheme};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::warn;

use crate::error::ProxyError;

/// How the backend certificate is checked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendVerification {
    /// Accept any certificate. Appliances behind the gateway commonly serve
    /// self-signed certificates.
    Insecure,
    /// Mozilla root store.
    WebPki,
    /// Trust only the certificates in this PEM bundle.
    CaPem(Vec<u8>),
}

/// Certificate material for the terminating mode.
#[derive(Clone)]
pub struct TerminationConfig {
    /// Server certificate chain (PEM) presented to clients.
    pub cert_pem: Vec<u8>,
    /// Private key (PEM) for `cert_pem`.
    pub key_pem: Vec<u8>,
    pub backend_verification: BackendVerification,
    /// Name used for SNI and verification toward the backend.
    pub backend_server_name: String,
}

impl std::fmt::Debug for TerminationConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerminationConfig")
            .field("cert_pem_len", &self.cert_pem.len())
            .field("key_pem", &"<redacted>")
            .field("backend_verification", &self.backend_verification)
            .field("backend_server_name", &self.backend_server_name)
            .finish()
    }
}

/// Ready-to-use acceptor/connector pair.
#[derive(Clone)]
pub struct TlsTermination {
    pub acceptor: TlsAcceptor,
    pub connector: TlsConnector,
    pub server_name: ServerName<'static>,
}

impl std::fmt::Debug for TlsTermination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsTermination")
            .field("server_name", &self.server_name)
            .finish_non_exhaustive()
    }
}

impl TlsTermination {
    pub fn from_config(config: &TerminationConfig) -> Result<Self, ProxyError> {
        let server = server_config(&config.cert_pem, &config.key_pem)?;
        let client = client_config(&config.backend_verification)?;
        let server_name = ServerName::try_from(config.backend_server_name.clone()).map_err(|e| {
            ProxyError::TlsConfig(format!(
                "invalid backend server name {}: {e}",
                config.backend_server_name
            ))
        })?;

        if config.backend_verification == BackendVerification::Insecure {
            warn!("Backend certificate verification disabled");
        }

        Ok(Self {
            acceptor: TlsAcceptor::from(Arc::new(server)),
            connector: TlsConnector::from(Arc::new(client)),
            server_name,
        })
    }
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Parse a PEM certificate chain.
pub fn parse_certs(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, ProxyError> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(pem))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ProxyError::TlsConfig(format!("certificate PEM: {e}")))?;
    if certs.is_empty() {
        return Err(ProxyError::TlsConfig("no certificate in PEM".to_string()));
    }
    Ok(certs)
}

/// Parse the first private key in a PEM document.
pub fn parse_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>, ProxyError> {
    rustls_pemfile::private_key(&mut BufReader::new(pem))
        .map_err(|e| ProxyError::TlsConfig(format!("private key PEM: {e}")))?
        .ok_or_else(|| ProxyError::TlsConfig("no private key in PEM".to_string()))
}

/// Server-role configuration for the inbound leg.
pub fn server_config(cert_pem: &[u8], key_pem: &[u8]) -> Result<ServerConfig, ProxyError> {
    let certs = parse_certs(cert_pem)?;
    let key = parse_key(key_pem)?;

    ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| ProxyError::TlsConfig(e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ProxyError::TlsConfig(e.to_string()))
}

/// Client-role configuration for the backend leg.
pub fn client_config(verification: &BackendVerification) -> Result<ClientConfig, ProxyError> {
    let provider = provider();
    let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .map_err(|e| ProxyError::TlsConfig(e.to_string()))?;

    let config = match verification {
        BackendVerification::Insecure => builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(InsecureServerCertVerifier { provider }))
            .with_no_client_auth(),
        BackendVerification::WebPki => {
            let roots = RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            builder.with_root_certificates(roots).with_no_client_auth()
        }
        BackendVerification::CaPem(pem) => {
            let mut roots = RootCertStore::empty();
            for cert in parse_certs(pem)? {
                roots
                    .add(cert)
                    .map_err(|e| ProxyError::TlsConfig(format!("CA certificate: {e}")))?;
            }
            builder.with_root_certificates(roots).with_no_client_auth()
        }
    };

    Ok(config)
}

/// Accepts any backend certificate but still checks handshake signatures.
#[derive(Debug)]
struct InsecureServerCertVerifier {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for InsecureServerCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, RustlsError> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, RustlsError> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, RustlsError> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
