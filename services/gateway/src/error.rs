//! Error types for the gateway engine.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

use crate::proxy::ExchangeResult;

/// Per-connection errors with standardized reason codes.
///
/// None of these ever leave the worker that produced them; the acceptor and
/// the other workers are unaffected.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Buffer pool exhausted, connection refused.
    #[error("admission_rejected: buffer pool exhausted")]
    AdmissionRejected,

    /// Outbound connect to the backend failed or timed out.
    #[error("backend_unreachable: {addr}: {source}")]
    BackendUnreachable {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// Read/write failure on either leg.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// No activity within the idle window.
    #[error("idle_timeout: no activity for {0:?}")]
    IdleTimeout(Duration),

    /// Peer did not become writable within the write budget.
    #[error("write_timeout: peer not writable within {0:?}")]
    WriteTimeout(Duration),

    /// Buffered HTTP message exceeds the per-message limit.
    #[error("framing_overflow: message exceeds {limit} bytes")]
    FramingOverflow { limit: usize },

    /// TLS handshake failed or did not complete in time.
    #[error("tls_handshake_failed: {0}")]
    TlsHandshake(String),

    /// TLS material could not be turned into a usable configuration.
    #[error("tls_config_invalid: {0}")]
    TlsConfig(String),
}

impl ProxyError {
    /// Get the standardized reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            ProxyError::AdmissionRejected => "admission_rejected",
            ProxyError::BackendUnreachable { .. } => "backend_unreachable",
            ProxyError::Io(_) => "io_error",
            ProxyError::IdleTimeout(_) => "idle_timeout",
            ProxyError::WriteTimeout(_) => "write_timeout",
            ProxyError::FramingOverflow { .. } => "framing_overflow",
            ProxyError::TlsHandshake(_) => "tls_handshake_failed",
            ProxyError::TlsConfig(_) => "tls_config_invalid",
        }
    }

    /// Result recorded in telemetry when a connection ends with this error.
    pub fn exchange_result(&self) -> ExchangeResult {
        match self {
            ProxyError::IdleTimeout(_) => ExchangeResult::Timeout,
            _ => ExchangeResult::Error,
        }
    }
}
