//! Opaque relay: encrypted bytes pass through unchanged in both directions.
//!
//! The gateway cannot see HTTP boundaries here, so exchanges are inferred
//! from traffic direction: client bytes arriving after the backend has
//! answered start a new exchange and close the previous one.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::time::sleep;
use tracing::{debug, trace};

use super::forward::{write_all_bounded, ForwardSettings};
use super::lifecycle::{record_exchange, ConnectionContext};
use super::telemetry::TelemetryLog;
use crate::error::ProxyError;

/// Bytes shown in trace-level previews.
const PREVIEW_LEN: usize = 64;

/// Relay between `client` and `backend` until either side closes.
///
/// `Ok(())` means an orderly close; idle expiry, I/O failures and stalled
/// writes come back as errors.
pub async fn relay<C, B>(
    ctx: &mut ConnectionContext,
    client: &mut C,
    backend: &mut B,
    settings: &ForwardSettings,
    telemetry: &TelemetryLog,
) -> Result<(), ProxyError>
where
    C: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let peer_ip = ctx.peer_addr.ip();
    let (client_buf, backend_buf) = ctx.lease.split_mut();
    let activity = &mut ctx.activity;

    loop {
        tokio::select! {
            read = client.read(client_buf) => {
                let n = read?;
                if n == 0 {
                    debug!("Client closed connection");
                    return Ok(());
                }
                trace!(bytes = n, preview = ?&client_buf[..n.min(PREVIEW_LEN)], "Client -> backend");

                write_all_bounded(backend, &client_buf[..n], settings.write_timeout).await?;
                activity.touch();
                if let Some(done) = activity.exchange.on_request_bytes(n) {
                    record_exchange(telemetry, peer_ip, done).await;
                }
            }
            read = backend.read(backend_buf) => {
                let n = read?;
                if n == 0 {
                    debug!("Backend closed connection");
                    return Ok(());
                }
                trace!(bytes = n, preview = ?&backend_buf[..n.min(PREVIEW_LEN)], "Backend -> client");

                activity.exchange.on_response_bytes(n);
                write_all_bounded(client, &backend_buf[..n], settings.write_timeout).await?;
                activity.touch();
            }
            _ = sleep(settings.poll_slice) => {
                if let Some(window) = activity.idle_expired() {
                    return Err(ProxyError::IdleTimeout(window));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::io::{duplex, AsyncWriteExt, DuplexStream};

    use super::*;
    use crate::proxy::buffer_pool::BufferPool;
    use crate::proxy::lifecycle::IdlePolicy;
    use crate::proxy::telemetry::ExchangeResult;

    struct Rig {
        client: DuplexStream,
        backend: DuplexStream,
        telemetry: Arc<TelemetryLog>,
        task: tokio::task::JoinHandle<Result<(), ProxyError>>,
    }

    fn spawn_relay(idle: Duration) -> Rig {
        let pool = Arc::new(BufferPool::new(1, 64));
        let telemetry = Arc::new(TelemetryLog::new(10));
        let (client, mut gw_client) = duplex(1024);
        let (backend, mut gw_backend) = duplex(1024);
        let peer: SocketAddr = "192.0.2.10:40000".parse().unwrap();

        let log = Arc::clone(&telemetry);
        let task = tokio::spawn(async move {
            let mut ctx = ConnectionContext::admit(peer, pool.acquire().await.unwrap(), IdlePolicy::new(idle));
            relay(&mut ctx, &mut gw_client, &mut gw_backend, &ForwardSettings::default(), &log).await
        });

        Rig {
            client,
            backend,
            telemetry,
            task,
        }
    }

    async fn read_n(stream: &mut DuplexStream, n: usize) -> Vec<u8> {
        let mut buf = vec![0u8; n];
        stream.read_exact(&mut buf).await.unwrap();
        buf
    }

    #[tokio::test]
    async fn test_bytes_relayed_unchanged_and_exchanges_split() {
        let mut rig = spawn_relay(Duration::from_secs(30));

        // Larger than one buffer chunk, arbitrary binary content.
        let request: Vec<u8> = (0..200u8).collect();
        rig.client.write_all(&request).await.unwrap();
        assert_eq!(read_n(&mut rig.backend, request.len()).await, request);

        rig.backend.write_all(b"\x17\x03\x03response").await.unwrap();
        assert_eq!(read_n(&mut rig.client, 11).await, b"\x17\x03\x03response");

        // A second request closes the first exchange.
        rig.client.write_all(b"next").await.unwrap();
        assert_eq!(read_n(&mut rig.backend, 4).await, b"next");

        drop(rig.client);
        assert!(rig.task.await.unwrap().is_ok());

        // The open exchange is logged by the lifecycle on close, not here.
        let entries = rig.telemetry.recent().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].bytes_in, 200);
        assert_eq!(entries[0].bytes_out, 11);
        assert_eq!(entries[0].result, ExchangeResult::Success);
    }

    #[tokio::test]
    async fn test_backend_close_ends_relay() {
        let rig = spawn_relay(Duration::from_secs(30));
        drop(rig.backend);
        assert!(rig.task.await.unwrap().is_ok());
        drop(rig.client);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_connection_times_out() {
        let rig = spawn_relay(Duration::from_millis(500));

        let err = rig.task.await.unwrap().unwrap_err();
        assert!(matches!(err, ProxyError::IdleTimeout(window) if window == Duration::from_millis(500)));
        drop((rig.client, rig.backend));
    }
}
