//! TCP listener and connection handling.
//!
//! The acceptor admits a connection only when the buffer pool grants a
//! lease; otherwise the socket is closed straight away and no backend
//! connection is made. Each admitted connection runs on its own task:
//!
//! ```text
//! accept -> acquire lease -> connect backend (TTL, nodelay) -> forward -> close
//! ```

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn, Instrument};

use super::backend::Backend;
use super::buffer_pool::{BufferLease, BufferPool};
use super::forward::{ForwardSettings, ForwardingStrategy};
use super::lifecycle::{ConnectionContext, ConnectionState, IdlePolicy, Termination};
use super::telemetry::TelemetryLog;
use super::tls::{TerminationConfig, TlsTermination};
use crate::error::ProxyError;

/// Pause after a failed `accept` before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Forwarding mode chosen at startup.
#[derive(Debug, Clone)]
pub enum ForwardingMode {
    Passthrough,
    Terminating(TerminationConfig),
}

/// Configuration for the gateway listener.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    pub backend: Backend,
    pub mode: ForwardingMode,
    pub idle: IdlePolicy,
    pub forward: ForwardSettings,
}

impl ProxyConfig {
    /// Passthrough configuration with default timeouts.
    pub fn new(bind_addr: SocketAddr, backend_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            backend: Backend::new(backend_addr),
            mode: ForwardingMode::Passthrough,
            idle: IdlePolicy::default(),
            forward: ForwardSettings::default(),
        }
    }
}

/// Statistics for a listener.
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Connections currently forwarding.
    pub connections_active: AtomicU64,
    pub connections_closed: AtomicU64,
    /// Connections refused because the buffer pool was exhausted.
    pub connections_rejected: AtomicU64,
    pub backend_connected: AtomicU64,
    pub backend_failed: AtomicU64,
    pub completed: AtomicU64,
    pub timed_out: AtomicU64,
    pub errored: AtomicU64,
    /// Bytes proxied to backend.
    pub bytes_to_backend: AtomicU64,
    /// Bytes proxied from backend.
    pub bytes_from_backend: AtomicU64,
}

/// Point-in-time copy of [`ListenerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub connections_accepted: u64,
    pub connections_active: u64,
    pub connections_closed: u64,
    pub connections_rejected: u64,
    pub backend_connected: u64,
    pub backend_failed: u64,
    pub completed: u64,
    pub timed_out: u64,
    pub errored: u64,
    pub bytes_to_backend: u64,
    pub bytes_from_backend: u64,
}

impl ListenerStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        StatsSnapshot {
            connections_accepted: load(&self.connections_accepted),
            connections_active: load(&self.connections_active),
            connections_closed: load(&self.connections_closed),
            connections_rejected: load(&self.connections_rejected),
            backend_connected: load(&self.backend_connected),
            backend_failed: load(&self.backend_failed),
            completed: load(&self.completed),
            timed_out: load(&self.timed_out),
            errored: load(&self.errored),
            bytes_to_backend: load(&self.bytes_to_backend),
            bytes_from_backend: load(&self.bytes_from_backend),
        }
    }

    fn record_outcome(&self, state: ConnectionState) {
        let counter = match state {
            ConnectionState::Completed => &self.completed,
            ConnectionState::TimedOut => &self.timed_out,
            _ => &self.errored,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Block until the link-readiness signal is raised.
///
/// Returns immediately if it already is. A dropped sender counts as ready.
pub async fn wait_for_link(mut ready: watch::Receiver<bool>) {
    if *ready.borrow() {
        return;
    }
    info!("Waiting for backend link");
    if ready.wait_for(|up| *up).await.is_err() {
        warn!("Link readiness signal dropped, continuing");
        return;
    }
    info!("Backend link ready");
}

/// The gateway's TCP acceptor.
pub struct Listener {
    config: ProxyConfig,
    /// The TCP listener.
    listener: TcpListener,
    strategy: ForwardingStrategy,
    pool: Arc<BufferPool>,
    telemetry: Arc<TelemetryLog>,
    stats: Arc<ListenerStats>,
}

impl Listener {
    /// Bind the listening socket and prepare the forwarding strategy.
    pub async fn bind(
        config: ProxyConfig,
        pool: Arc<BufferPool>,
        telemetry: Arc<TelemetryLog>,
    ) -> Result<Self, ProxyError> {
        let strategy = match &config.mode {
            ForwardingMode::Passthrough => ForwardingStrategy::Passthrough,
            ForwardingMode::Terminating(tls) => {
                ForwardingStrategy::Terminating(Arc::new(TlsTermination::from_config(tls)?))
            }
        };

        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;

        info!(
            bind_addr = %local_addr,
            backend_addr = %config.backend.addr,
            mode = strategy.name(),
            max_clients = pool.capacity(),
            buffer_size = pool.buffer_size(),
            "Listener bound"
        );

        Ok(Self {
            config,
            listener,
            strategy,
            pool,
            telemetry,
            stats: Arc::new(ListenerStats::default()),
        })
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Get listener statistics.
    pub fn stats(&self) -> Arc<ListenerStats> {
        Arc::clone(&self.stats)
    }

    /// Run the listener, accepting and handling connections.
    pub async fn run(self: Arc<Self>) -> io::Result<()> {
        let local_addr = self.listener.local_addr()?;
        info!(bind_addr = %local_addr, "Listener started");

        loop {
            match self.listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let Some(lease) = self.pool.acquire().await else {
                        self.stats
                            .connections_rejected
                            .fetch_add(1, Ordering::Relaxed);
                        let err = ProxyError::AdmissionRejected;
                        warn!(
                            peer_addr = %peer_addr,
                            reason = err.reason_code(),
                            "Connection rejected: pool exhausted"
                        );
                        drop(stream);
                        continue;
                    };

                    self.stats
                        .connections_accepted
                        .fetch_add(1, Ordering::Relaxed);
                    self.stats
                        .connections_active
                        .fetch_add(1, Ordering::Relaxed);

                    let listener = Arc::clone(&self);
                    tokio::spawn(
                        async move {
                            let state = listener.handle_connection(stream, peer_addr, lease).await;

                            let stats = &listener.stats;
                            stats.record_outcome(state);
                            stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                            stats.connections_closed.fetch_add(1, Ordering::Relaxed);
                        }
                        .instrument(tracing::info_span!("connection", peer = %peer_addr)),
                    );
                }
                Err(e) => {
                    error!(error = %e, "Accept error");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
    }

    /// Handle a single admitted connection through to its terminal state.
    async fn handle_connection(
        &self,
        client: TcpStream,
        peer_addr: SocketAddr,
        lease: BufferLease,
    ) -> ConnectionState {
        let mut ctx = ConnectionContext::admit(peer_addr, lease, self.config.idle);

        if let Err(e) = client.set_nodelay(true) {
            warn!(error = %e, "Failed to set TCP_NODELAY on client socket");
        }

        let backend = match self.config.backend.connect().await {
            Ok(stream) => {
                self.stats.backend_connected.fetch_add(1, Ordering::Relaxed);
                stream
            }
            Err(source) => {
                self.stats.backend_failed.fetch_add(1, Ordering::Relaxed);
                let err = ProxyError::BackendUnreachable {
                    addr: self.config.backend.addr,
                    source,
                };
                return ctx.close(Termination::Failed(err), &self.telemetry).await;
            }
        };

        ctx.transition(ConnectionState::Connected);
        debug!(backend_addr = %self.config.backend.addr, "Connected to backend");

        let termination = self
            .strategy
            .forward(&mut ctx, client, backend, &self.config.forward, &self.telemetry)
            .await;

        let (to_backend, from_backend) = ctx.activity.exchange.totals();
        self.stats
            .bytes_to_backend
            .fetch_add(to_backend, Ordering::Relaxed);
        self.stats
            .bytes_from_backend
            .fetch_add(from_backend, Ordering::Relaxed);
        debug!(
            bytes_to_backend = to_backend,
            bytes_from_backend = from_backend,
            "Connection closed"
        );

        ctx.close(termination, &self.telemetry).await
    }
}
