//! Periodic status reporting.
//!
//! Logs pool utilisation, listener counters, the running TTFB average and
//! backend reachability at a fixed interval.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::proxy::{
    BackendMonitor, BufferPool, HealthStatus, ListenerStats, StatsSnapshot, TelemetryLog,
};

/// Everything one status line reports.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub pool_capacity: usize,
    pub pool_in_use: usize,
    pub avg_ttfb_ms: u32,
    pub ttfb_samples: u32,
    pub telemetry_entries: usize,
    /// `None` when no monitor runs.
    pub backend_reachable: Option<bool>,
    pub listener: StatsSnapshot,
}

/// Sources a [`StatusReport`] is collected from.
#[derive(Clone)]
pub struct StatusSources {
    pub pool: Arc<BufferPool>,
    pub telemetry: Arc<TelemetryLog>,
    pub stats: Arc<ListenerStats>,
    pub monitor: Option<Arc<BackendMonitor>>,
}

impl StatusSources {
    pub async fn collect(&self) -> StatusReport {
        let snapshot = self.telemetry.snapshot().await;
        let backend_reachable = match &self.monitor {
            Some(monitor) => match monitor.health().await.status {
                HealthStatus::Healthy => Some(true),
                HealthStatus::Unhealthy => Some(false),
                HealthStatus::Unknown => None,
            },
            None => None,
        };

        StatusReport {
            pool_capacity: self.pool.capacity(),
            pool_in_use: self.pool.in_use(),
            avg_ttfb_ms: snapshot.average.avg_ttfb_ms,
            ttfb_samples: snapshot.average.sample_count,
            telemetry_entries: snapshot.entries.len(),
            backend_reachable,
            listener: self.stats.snapshot(),
        }
    }
}

/// Run the status loop until shutdown.
pub async fn run_status_loop(
    sources: StatusSources,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(interval_secs = interval.as_secs(), "Status reporting started");

    let mut interval_timer = tokio::time::interval(interval);
    // The first tick completes immediately.
    interval_timer.tick().await;

    loop {
        tokio::select! {
            _ = interval_timer.tick() => {
                let report = sources.collect().await;
                info!(
                    pool_in_use = report.pool_in_use,
                    pool_capacity = report.pool_capacity,
                    avg_ttfb_ms = report.avg_ttfb_ms,
                    ttfb_samples = report.ttfb_samples,
                    telemetry_entries = report.telemetry_entries,
                    backend_reachable = report.backend_reachable,
                    accepted = report.listener.connections_accepted,
                    rejected = report.listener.connections_rejected,
                    completed = report.listener.completed,
                    timed_out = report.listener.timed_out,
                    errored = report.listener.errored,
                    "Gateway status"
                );
                if report.pool_in_use >= report.pool_capacity {
                    warn!("Buffer pool fully allocated, new connections are being rejected");
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("Status reporting shutting down");
                    break;
                }
            }
        }
    }
}
