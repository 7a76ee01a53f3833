pub mod config;
pub mod error;
pub mod proxy;
pub mod status;

pub use error::ProxyError;
pub use proxy::{
    Backend, BackendMonitor, BufferPool, ForwardingMode, Listener, ListenerStats, ProxyConfig,
    TelemetryLog, TerminationConfig,
};
