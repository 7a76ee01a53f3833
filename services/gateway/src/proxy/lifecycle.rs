//! Per-connection lifecycle, idle policy and exchange accounting.
//!
//! ```text
//! Accepted -> Admitted -> Connected -> Forwarding -> Completed
//!                                                 -> TimedOut
//!                                                 -> Error
//! ```
//!
//! A [`ConnectionContext`] owns the buffer lease for the whole connection,
//! so the slot goes back to the pool whenever the context is dropped,
//! whichever path the worker leaves by.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::buffer_pool::BufferLease;
use super::telemetry::{ExchangeResult, TelemetryLog};
use crate::error::ProxyError;

/// Default base idle timeout.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Idle window multiplier while a connection is in keep-alive.
pub const KEEP_ALIVE_FACTOR: u32 = 3;

/// Lifecycle states of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Accepted,
    /// Buffer slot granted.
    Admitted,
    /// Backend reachable.
    Connected,
    Forwarding,
    /// A peer closed in an orderly way.
    Completed,
    TimedOut,
    Error,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ConnectionState::Completed | ConnectionState::TimedOut | ConnectionState::Error
        )
    }
}

/// How a forwarding run ended.
#[derive(Debug)]
pub enum Termination {
    /// Orderly close by the client or the backend.
    PeerClosed,
    Failed(ProxyError),
}

impl Termination {
    pub fn state(&self) -> ConnectionState {
        match self {
            Termination::PeerClosed => ConnectionState::Completed,
            Termination::Failed(ProxyError::IdleTimeout(_)) => ConnectionState::TimedOut,
            Termination::Failed(_) => ConnectionState::Error,
        }
    }

    pub fn exchange_result(&self) -> ExchangeResult {
        match self {
            Termination::PeerClosed => ExchangeResult::Success,
            Termination::Failed(e) => e.exchange_result(),
        }
    }
}

impl From<ProxyError> for Termination {
    fn from(e: ProxyError) -> Self {
        Termination::Failed(e)
    }
}

impl From<std::io::Error> for Termination {
    fn from(e: std::io::Error) -> Self {
        Termination::Failed(ProxyError::Io(e))
    }
}

/// Idle timeout policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdlePolicy {
    /// Window when the connection is not in keep-alive.
    pub base: Duration,
}

impl IdlePolicy {
    pub fn new(base: Duration) -> Self {
        Self { base }
    }

    /// Allowed inactivity for the given keep-alive state.
    pub fn window(&self, keep_alive: bool) -> Duration {
        if keep_alive {
            self.base * KEEP_ALIVE_FACTOR
        } else {
            self.base
        }
    }
}

impl Default for IdlePolicy {
    fn default() -> Self {
        Self::new(DEFAULT_IDLE_TIMEOUT)
    }
}

/// Byte and timing counters of one request/response exchange.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Exchange {
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub ttfb_ms: u16,
}

/// Tracks the exchange currently in flight on a connection.
#[derive(Debug, Default)]
pub struct ExchangeTracker {
    current: Exchange,
    /// Connection totals across all exchanges.
    totals: (u64, u64),
    request_started: Option<Instant>,
    awaiting_first_byte: bool,
}

impl ExchangeTracker {
    /// Mark the start of a request if none is being timed.
    pub fn begin_request(&mut self) {
        if !self.awaiting_first_byte {
            self.request_started = Some(Instant::now());
            self.awaiting_first_byte = true;
        }
    }

    /// Account client bytes.
    ///
    /// If the backend has already answered the previous request, that
    /// exchange is over: it is returned for logging and a new one starts.
    pub fn on_request_bytes(&mut self, n: usize) -> Option<Exchange> {
        let finished = if self.current.bytes_out > 0 && !self.awaiting_first_byte {
            Some(std::mem::take(&mut self.current))
        } else {
            None
        };

        self.begin_request();
        self.add_request_bytes(n);
        finished
    }

    /// Account forwarded client bytes without closing any exchange.
    pub fn add_request_bytes(&mut self, n: usize) {
        self.current.bytes_in += n as u64;
        self.totals.0 += n as u64;
    }

    /// Account backend bytes, measuring TTFB on the first ones.
    pub fn on_response_bytes(&mut self, n: usize) {
        self.on_response_read(n);
        self.add_response_bytes(n);
    }

    /// Note `n` bytes read from the backend without charging them to the
    /// current exchange. Measures TTFB if a request is waiting.
    pub fn on_response_read(&mut self, n: usize) {
        if self.awaiting_first_byte {
            if let Some(started) = self.request_started {
                self.current.ttfb_ms = clamp_ms(started.elapsed());
            }
            self.awaiting_first_byte = false;
        }
        self.totals.1 += n as u64;
    }

    /// Charge response bytes to the current exchange.
    pub fn add_response_bytes(&mut self, n: usize) {
        self.current.bytes_out += n as u64;
    }

    /// Close the current exchange, if it carried any bytes.
    pub fn finish(&mut self) -> Option<Exchange> {
        self.awaiting_first_byte = false;
        self.request_started = None;
        let exchange = std::mem::take(&mut self.current);
        (exchange.bytes_in > 0 || exchange.bytes_out > 0).then_some(exchange)
    }

    pub fn current(&self) -> Exchange {
        self.current
    }

    /// `(bytes_in, bytes_out)` over the whole connection.
    pub fn totals(&self) -> (u64, u64) {
        self.totals
    }
}

/// Milliseconds clamped to the 16-bit telemetry range.
pub fn clamp_ms(elapsed: Duration) -> u16 {
    u16::try_from(elapsed.as_millis()).unwrap_or(u16::MAX)
}

/// Activity bookkeeping, kept apart from the lease so forwarding loops can
/// borrow the buffers and the counters at the same time.
#[derive(Debug)]
pub struct Activity {
    policy: IdlePolicy,
    last_activity: Instant,
    keep_alive: bool,
    pub exchange: ExchangeTracker,
}

impl Activity {
    fn new(policy: IdlePolicy) -> Self {
        Self {
            policy,
            last_activity: Instant::now(),
            keep_alive: false,
            exchange: ExchangeTracker::default(),
        }
    }

    /// Reset the idle clock.
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    pub fn set_keep_alive(&mut self, keep_alive: bool) {
        if self.keep_alive != keep_alive {
            debug!(keep_alive, "Keep-alive changed");
        }
        self.keep_alive = keep_alive;
    }

    /// Idle window currently in force.
    pub fn idle_window(&self) -> Duration {
        self.policy.window(self.keep_alive)
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    /// `Some(window)` once inactivity exceeds the current window.
    pub fn idle_expired(&self) -> Option<Duration> {
        let window = self.idle_window();
        (self.idle_for() > window).then_some(window)
    }
}

/// Log an exchange that finished successfully while the connection stays open.
pub async fn record_exchange(telemetry: &TelemetryLog, peer: IpAddr, exchange: Exchange) {
    log_exchange(telemetry, peer, exchange, ExchangeResult::Success).await;
}

async fn log_exchange(telemetry: &TelemetryLog, peer: IpAddr, exchange: Exchange, result: ExchangeResult) {
    telemetry
        .log_request(peer, exchange.bytes_in, exchange.bytes_out, exchange.ttfb_ms, result)
        .await;
}

/// State of one admitted connection, owned by its worker.
#[derive(Debug)]
pub struct ConnectionContext {
    pub peer_addr: SocketAddr,
    pub lease: BufferLease,
    pub activity: Activity,
    state: ConnectionState,
}

impl ConnectionContext {
    /// Create the context for an accepted connection that was granted `lease`.
    pub fn admit(peer_addr: SocketAddr, lease: BufferLease, policy: IdlePolicy) -> Self {
        debug!(slot = lease.index(), "Connection admitted");
        let mut ctx = Self {
            peer_addr,
            lease,
            activity: Activity::new(policy),
            state: ConnectionState::Accepted,
        };
        ctx.transition(ConnectionState::Admitted);
        ctx
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Move to a later state. Terminal states are final.
    pub fn transition(&mut self, next: ConnectionState) {
        if self.state.is_terminal() {
            return;
        }
        debug!(from = ?self.state, to = ?next, "Connection state");
        self.state = next;
        if !next.is_terminal() {
            self.activity.touch();
        }
    }

    /// Enter the terminal state for `termination` and log the last exchange.
    ///
    /// Consumes the context; the buffer slot is released on return.
    pub async fn close(mut self, termination: Termination, telemetry: &TelemetryLog) -> ConnectionState {
        let state = termination.state();
        self.transition(state);

        if let Some(exchange) = self.activity.exchange.finish() {
            log_exchange(telemetry, self.peer_addr.ip(), exchange, termination.exchange_result()).await;
        }

        match &termination {
            Termination::PeerClosed => info!("Connection completed"),
            Termination::Failed(e) if state == ConnectionState::TimedOut => {
                info!(reason = e.reason_code(), error = %e, "Connection timed out")
            }
            Termination::Failed(e) => {
                warn!(reason = e.reason_code(), error = %e, "Connection aborted")
            }
        }

        state
    }
}
