//! The fixed backend: outbound connects and reachability monitoring.
//!
//! Outbound sockets get the configured TTL (IPv4) or unicast hop limit
//! (IPv6) before connecting, so forwarded traffic leaves with the hop count
//! of a local host. Connects are bounded by a timeout (2s default).

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use socket2::SockRef;
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::{watch, RwLock};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Default connect timeout for backend connections.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Default outgoing TTL (the usual Linux/Unix default).
pub const DEFAULT_TTL: u32 = 64;

/// Default interval between reachability probes.
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(30);

/// The single endpoint every connection is forwarded to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backend {
    pub addr: SocketAddr,
    /// TTL / hop limit for outbound sockets, `None` keeps the OS default.
    pub ttl: Option<u32>,
    pub connect_timeout: Duration,
}

impl Backend {
    /// Create a backend endpoint with default TTL and connect timeout.
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            ttl: Some(DEFAULT_TTL),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_ttl(mut self, ttl: Option<u32>) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// Open a TCP connection to the backend with TTL and `TCP_NODELAY` set.
    pub async fn connect(&self) -> io::Result<TcpStream> {
        let socket = if self.addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };

        if let Some(ttl) = self.ttl {
            match set_hop_limit(&socket, self.addr, ttl) {
                Ok(()) => debug!(ttl, "Set TTL on outgoing connection"),
                Err(e) => warn!(ttl, error = %e, "Failed to set TTL on outgoing socket"),
            }
        }

        debug!(backend_addr = %self.addr, "Connecting to backend");
        let stream = match timeout(self.connect_timeout, socket.connect(self.addr)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "connect timeout",
                ))
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            warn!(error = %e, "Failed to set TCP_NODELAY on backend socket");
        }

        Ok(stream)
    }
}

fn set_hop_limit(socket: &TcpSocket, addr: SocketAddr, ttl: u32) -> io::Result<()> {
    let sock = SockRef::from(socket);
    if addr.is_ipv4() {
        sock.set_ttl(ttl)
    } else {
        sock.set_unicast_hops_v6(ttl)
    }
}

/// Check whether a TCP connection to `addr` can be established.
pub async fn probe(addr: SocketAddr, connect_timeout: Duration) -> bool {
    matches!(
        timeout(connect_timeout, TcpStream::connect(addr)).await,
        Ok(Ok(_))
    )
}

/// Health status of the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// Last probe connected.
    Healthy,
    /// Last probe failed.
    Unhealthy,
    /// Not yet probed.
    Unknown,
}

/// Snapshot of the monitor state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendHealth {
    pub status: HealthStatus,
    pub last_check: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
}

/// Periodic reachability probe of the backend.
pub struct BackendMonitor {
    addr: SocketAddr,
    probe_timeout: Duration,
    state: RwLock<BackendHealth>,
}

impl BackendMonitor {
    pub fn new(addr: SocketAddr, probe_timeout: Duration) -> Self {
        Self {
            addr,
            probe_timeout,
            state: RwLock::new(BackendHealth {
                status: HealthStatus::Unknown,
                last_check: None,
                consecutive_failures: 0,
            }),
        }
    }

    pub async fn health(&self) -> BackendHealth {
        *self.state.read().await
    }

    /// Probe once and record the result.
    pub async fn check(&self) -> HealthStatus {
        let reachable = probe(self.addr, self.probe_timeout).await;

        let mut state = self.state.write().await;
        let previous = state.status;
        state.last_check = Some(Utc::now());
        if reachable {
            state.status = HealthStatus::Healthy;
            state.consecutive_failures = 0;
        } else {
            state.status = HealthStatus::Unhealthy;
            state.consecutive_failures += 1;
        }

        if previous != state.status {
            info!(
                backend_addr = %self.addr,
                status = ?state.status,
                "Backend reachability changed"
            );
        }
        state.status
    }

    /// Probe forever at `interval`.
    ///
    /// When `ready` is given it is set to `true` after the first successful
    /// probe; the acceptor waits on it before binding.
    pub async fn run(self: Arc<Self>, interval: Duration, ready: Option<watch::Sender<bool>>) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let status = self.check().await;
            if status == HealthStatus::Healthy {
                if let Some(tx) = &ready {
                    tx.send_if_modified(|ready| !std::mem::replace(ready, true));
                }
            }
        }
    }
}
