//! TLS gateway engine.
//!
//! This module provides:
//! - A fixed pool of per-connection buffer pairs (admission control)
//! - The TCP acceptor and per-connection workers
//! - Two forwarding strategies: opaque passthrough and TLS-terminating reframing
//! - Connection lifecycle with idle and keep-alive timeouts
//! - A bounded telemetry ring with a running TTFB average
//!
//! ## Architecture
//!
//! ```text
//! Client -> Listener -> BufferPool lease -> Backend connect -> Strategy -> Backend
//!                                                                 |
//!                                                          TelemetryLog
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use proxy::{BufferPool, Listener, ProxyConfig, TelemetryLog};
//!
//! let pool = Arc::new(BufferPool::new(4, 2048));
//! let telemetry = Arc::new(TelemetryLog::new(10));
//!
//! let config = ProxyConfig::new("0.0.0.0:443".parse()?, "192.168.91.1:443".parse()?);
//! let listener = Arc::new(Listener::bind(config, pool, telemetry).await?);
//! listener.run().await?;
//! ```

mod backend;
mod buffer_pool;
mod forward;
pub mod http_frame;
mod lifecycle;
mod listener;
mod passthrough;
mod telemetry;
mod terminating;
mod tls;

pub use backend::{
    probe, Backend, BackendHealth, BackendMonitor, HealthStatus, DEFAULT_CONNECT_TIMEOUT,
    DEFAULT_PROBE_INTERVAL, DEFAULT_TTL,
};
pub use buffer_pool::{
    BufferLease, BufferPool, ACQUIRE_LOCK_WAIT, DEFAULT_BUFFER_SIZE, DEFAULT_MAX_CLIENTS,
};
pub use forward::{
    ForwardSettings, ForwardingStrategy, DEFAULT_POLL_SLICE, DEFAULT_WRITE_TIMEOUT,
    MESSAGE_LIMIT_FACTOR,
};
pub use lifecycle::{
    record_exchange, ConnectionContext, ConnectionState, Exchange, IdlePolicy, Termination,
    DEFAULT_IDLE_TIMEOUT, KEEP_ALIVE_FACTOR,
};
pub use listener::{
    wait_for_link, ForwardingMode, Listener, ListenerStats, ProxyConfig, StatsSnapshot,
};
pub use telemetry::{
    ExchangeResult, RequestLogEntry, RunningAverage, TelemetryLog, TelemetrySnapshot,
    DEFAULT_LOCK_WAIT, DEFAULT_TELEMETRY_CAPACITY,
};
pub use tls::{BackendVerification, TerminationConfig, TlsTermination};
