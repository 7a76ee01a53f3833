//! Request telemetry: a ring of recent exchanges and a running TTFB average.
//!
//! Writers never wait long for the lock. If the log is contended beyond the
//! lock budget the record is dropped; losing a telemetry line never affects
//! forwarding.

use std::net::IpAddr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::debug;

/// Default number of exchanges kept.
pub const DEFAULT_TELEMETRY_CAPACITY: usize = 10;

/// How long a writer waits for the log lock before dropping its record.
pub const DEFAULT_LOCK_WAIT: Duration = Duration::from_millis(50);

/// Outcome of one request/response exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeResult {
    Success,
    Timeout,
    Error,
}

/// One completed exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequestLogEntry {
    pub timestamp: DateTime<Utc>,
    pub source_address: IpAddr,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub ttfb_ms: u16,
    pub result: ExchangeResult,
}

/// Exponential moving average of TTFB over successful exchanges.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunningAverage {
    pub avg_ttfb_ms: u32,
    pub sample_count: u32,
}

impl RunningAverage {
    /// Fold in one sample with weight 0.2.
    fn update(&mut self, ttfb_ms: u16) {
        let sample = u32::from(ttfb_ms);
        self.avg_ttfb_ms = if self.sample_count == 0 {
            sample
        } else {
            (self.avg_ttfb_ms * 4 + sample) / 5
        };
        self.sample_count = self.sample_count.saturating_add(1);
    }
}

/// Point-in-time copy of the log for status surfaces.
#[derive(Debug, Clone, Serialize)]
pub struct TelemetrySnapshot {
    pub average: RunningAverage,
    /// Most recent first.
    pub entries: Vec<RequestLogEntry>,
}

struct Ring {
    /// `None` marks a slot never written.
    entries: Vec<Option<RequestLogEntry>>,
    /// Next slot to overwrite.
    next: usize,
    average: RunningAverage,
}

impl Ring {
    fn push(&mut self, entry: RequestLogEntry) {
        let len = self.entries.len();
        self.entries[self.next] = Some(entry);
        self.next = (self.next + 1) % len;
    }

    fn recent(&self) -> Vec<RequestLogEntry> {
        let len = self.entries.len();
        (0..len)
            .map(|i| (self.next + len - 1 - i) % len)
            .filter_map(|idx| self.entries[idx].clone())
            .collect()
    }
}

/// Fixed-capacity circular log of exchanges.
pub struct TelemetryLog {
    ring: Mutex<Ring>,
    lock_wait: Duration,
}

impl TelemetryLog {
    /// Create a log keeping the `capacity` most recent exchanges.
    pub fn new(capacity: usize) -> Self {
        Self::with_lock_wait(capacity, DEFAULT_LOCK_WAIT)
    }

    /// Create a log with a custom writer lock budget.
    pub fn with_lock_wait(capacity: usize, lock_wait: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            ring: Mutex::new(Ring {
                entries: vec![None; capacity],
                next: 0,
                average: RunningAverage::default(),
            }),
            lock_wait,
        }
    }

    /// Record a completed exchange.
    ///
    /// Returns `false` if the record was dropped because the lock could not
    /// be taken within the budget.
    pub async fn log_request(
        &self,
        source_address: IpAddr,
        bytes_in: u64,
        bytes_out: u64,
        ttfb_ms: u16,
        result: ExchangeResult,
    ) -> bool {
        let Ok(mut ring) = timeout(self.lock_wait, self.ring.lock()).await else {
            debug!(source = %source_address, "Telemetry lock busy, record dropped");
            return false;
        };

        ring.push(RequestLogEntry {
            timestamp: Utc::now(),
            source_address,
            bytes_in,
            bytes_out,
            ttfb_ms,
            result,
        });

        if result == ExchangeResult::Success && ttfb_ms > 0 {
            ring.average.update(ttfb_ms);
        }

        true
    }

    /// Entries most recent first.
    pub async fn recent(&self) -> Vec<RequestLogEntry> {
        self.ring.lock().await.recent()
    }

    /// Current running TTFB average.
    pub async fn average(&self) -> RunningAverage {
        self.ring.lock().await.average
    }

    /// Consistent copy of entries and average taken under one lock.
    pub async fn snapshot(&self) -> TelemetrySnapshot {
        let ring = self.ring.lock().await;
        TelemetrySnapshot {
            average: ring.average,
            entries: ring.recent(),
        }
    }
}
