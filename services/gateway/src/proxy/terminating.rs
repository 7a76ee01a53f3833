//! TLS-terminating reframer.
//!
//! Decrypts client traffic, forwards whole HTTP/1.1 messages in each
//! direction and re-encrypts toward the backend. Requests lose their
//! `Accept-Encoding` headers so responses come back uncompressed.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, trace};

use super::forward::{write_all_bounded, ForwardSettings, MESSAGE_LIMIT_FACTOR};
use super::http_frame::{MessageBuffer, MessageKind};
use super::lifecycle::{record_exchange, ConnectionContext, ConnectionState};
use super::telemetry::TelemetryLog;
use super::tls::TlsTermination;
use crate::error::ProxyError;

/// Request header removed before forwarding.
pub const STRIPPED_REQUEST_HEADER: &str = "accept-encoding";

async fn bounded<F, T, E>(limit: Duration, leg: &str, handshake: F) -> Result<T, ProxyError>
where
    F: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    match timeout(limit, handshake).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(ProxyError::TlsHandshake(format!("{leg}: {e}"))),
        Err(_) => Err(ProxyError::TlsHandshake(format!(
            "{leg}: timed out after {}ms",
            limit.as_millis()
        ))),
    }
}

/// Establish both TLS sessions, then reframe until a peer closes.
pub async fn run<C, B>(
    tls: &TlsTermination,
    ctx: &mut ConnectionContext,
    client: C,
    backend: B,
    settings: &ForwardSettings,
    telemetry: &TelemetryLog,
) -> Result<(), ProxyError>
where
    C: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let mut client = bounded(settings.handshake_timeout, "client", tls.acceptor.accept(client)).await?;
    debug!("Client TLS session established");

    let mut backend = bounded(
        settings.handshake_timeout,
        "backend",
        tls.connector.connect(tls.server_name.clone(), backend),
    )
    .await?;
    debug!("Backend TLS session established");

    ctx.transition(ConnectionState::Forwarding);
    let result = reframe(ctx, &mut client, &mut backend, settings, telemetry).await;

    if result.is_ok() {
        // close_notify on both legs; the peers may already be gone.
        let _ = timeout(settings.write_timeout, client.shutdown()).await;
        let _ = timeout(settings.write_timeout, backend.shutdown()).await;
    }
    result
}

/// Forward complete HTTP messages between two plaintext streams.
pub async fn reframe<C, B>(
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

    let mut requests = MessageBuffer::new(MessageKind::Request, client_buf.len() * MESSAGE_LIMIT_FACTOR);
    let mut responses = MessageBuffer::new(MessageKind::Response, backend_buf.len() * MESSAGE_LIMIT_FACTOR);

    // HTTP/1.1 connections are persistent unless told otherwise.
    activity.set_keep_alive(true);

    loop {
        tokio::select! {
            read = client.read(client_buf) => {
                let n = read?;
                if n == 0 {
                    debug!("Client closed connection");
                    return Ok(());
                }
                activity.touch();
                if requests.is_empty() {
                    activity.exchange.begin_request();
                }
                requests.push(&client_buf[..n])?;

                while let Some(mut msg) = requests.complete() {
                    info!(request = %msg.start_line, "Request");
                    if msg.connection_close {
                        activity.set_keep_alive(false);
                    }
                    let stripped = requests.strip_header(&mut msg, STRIPPED_REQUEST_HEADER);
                    if stripped > 0 {
                        trace!(bytes = stripped, "Stripped Accept-Encoding");
                    }

                    write_all_bounded(backend, requests.message_bytes(&msg), settings.write_timeout).await?;
                    activity.exchange.add_request_bytes(msg.len);
                    requests.consume(&msg);
                }
            }
            read = backend.read(backend_buf) => {
                let n = read?;
                if n == 0 {
                    if !responses.is_empty() {
                        let residual = responses.take_remaining();
                        debug!(bytes = residual.len(), "Flushing partial response");
                        write_all_bounded(client, &residual, settings.write_timeout).await?;
                        activity.exchange.add_response_bytes(residual.len());
                    }
                    debug!("Backend closed connection");
                    return Ok(());
                }
                activity.touch();
                activity.exchange.on_response_read(n);
                responses.push(&backend_buf[..n])?;

                while let Some(msg) = responses.complete() {
                    info!(status = msg.status, response = %msg.start_line, "Response");
                    if msg.connection_close {
                        activity.set_keep_alive(false);
                    }

                    write_all_bounded(client, responses.message_bytes(&msg), settings.write_timeout).await?;
                    activity.exchange.add_response_bytes(msg.len);
                    responses.consume(&msg);

                    if let Some(done) = activity.exchange.finish() {
                        record_exchange(telemetry, peer_ip, done).await;
                    }
                }
            }
            _ = sleep(settings.poll_slice) => {
                if let Some(window) = activity.idle_expired() {
                    return Err(ProxyError::IdleTimeout(window));
                }
            }
        }
    }
}
