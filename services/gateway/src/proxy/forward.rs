//! Forwarding strategy selection and shared I/O helpers.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::lifecycle::{ConnectionContext, ConnectionState, Termination};
use super::telemetry::TelemetryLog;
use super::tls::TlsTermination;
use super::{passthrough, terminating};
use crate::error::ProxyError;

/// Default readiness slice between idle checks.
pub const DEFAULT_POLL_SLICE: Duration = Duration::from_millis(100);

/// Default budget for a peer to accept a whole write.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Buffered HTTP messages may grow to this many I/O chunks.
pub const MESSAGE_LIMIT_FACTOR: usize = 4;

/// Timing knobs shared by both strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwardSettings {
    /// Granularity of idle-timeout checks.
    pub poll_slice: Duration,
    /// Bound on a single write-all to either peer.
    pub write_timeout: Duration,
    /// Bound on each TLS handshake (terminating mode).
    pub handshake_timeout: Duration,
}

impl Default for ForwardSettings {
    fn default() -> Self {
        Self {
            poll_slice: DEFAULT_POLL_SLICE,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            handshake_timeout: super::backend::DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

/// How bytes travel between client and backend.
#[derive(Debug, Clone)]
pub enum ForwardingStrategy {
    /// Relay the encrypted byte stream untouched.
    Passthrough,
    /// Terminate TLS, forward whole HTTP messages, re-encrypt.
    Terminating(Arc<TlsTermination>),
}

impl ForwardingStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            ForwardingStrategy::Passthrough => "passthrough",
            ForwardingStrategy::Terminating(_) => "terminating",
        }
    }

    /// Forward between two connected sockets until a peer closes or an
    /// error or idle timeout ends the connection.
    ///
    /// Both sockets are dropped (closed) before this returns.
    pub async fn forward(
        &self,
        ctx: &mut ConnectionContext,
        mut client: TcpStream,
        mut backend: TcpStream,
        settings: &ForwardSettings,
        telemetry: &TelemetryLog,
    ) -> Termination {
        let result = match self {
            ForwardingStrategy::Passthrough => {
                ctx.transition(ConnectionState::Forwarding);
                passthrough::relay(ctx, &mut client, &mut backend, settings, telemetry).await
            }
            ForwardingStrategy::Terminating(tls) => {
                terminating::run(tls, ctx, client, backend, settings, telemetry).await
            }
        };

        match result {
            Ok(()) => Termination::PeerClosed,
            Err(e) => Termination::Failed(e),
        }
    }
}

/// Write all of `data` and flush, giving up after `limit`.
pub async fn write_all_bounded<W>(writer: &mut W, data: &[u8], limit: Duration) -> Result<(), ProxyError>
where
    W: AsyncWrite + Unpin,
{
    let write = async {
        writer.write_all(data).await?;
        writer.flush().await
    };

    match timeout(limit, write).await {
        Ok(result) => result.map_err(ProxyError::from),
        Err(_) => Err(ProxyError::WriteTimeout(limit)),
    }
}
