//! Gateway configuration.
//!
//! Everything is read from `BRIDGE_*` environment variables at startup.

use std::{net::SocketAddr, path::PathBuf, str::FromStr, time::Duration};

use anyhow::{bail, Context, Result};

use crate::proxy::{
    Backend, BackendVerification, ForwardSettings, ForwardingMode, IdlePolicy, ProxyConfig,
    TerminationConfig, DEFAULT_BUFFER_SIZE, DEFAULT_MAX_CLIENTS, DEFAULT_PROBE_INTERVAL,
    DEFAULT_TELEMETRY_CAPACITY, DEFAULT_TTL,
};

/// Smallest accepted per-direction buffer.
pub const MIN_BUFFER_SIZE: usize = 512;

/// Forwarding mode as configured, before any certificate is loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModeSetting {
    Passthrough,
    Terminating { cert_file: PathBuf, key_file: PathBuf },
}

/// Backend certificate policy as configured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifySetting {
    Insecure,
    WebPki,
    Ca(PathBuf),
}

/// Gateway configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// Address clients connect to.
    pub listen_addr: SocketAddr,

    /// The single backend every connection is forwarded to.
    pub backend_addr: SocketAddr,

    pub mode: ModeSetting,

    /// Bytes per direction per connection.
    pub buffer_size: usize,

    /// Buffer pool capacity, hence the concurrent connection limit.
    pub max_clients: usize,

    /// Base idle timeout (tripled under keep-alive).
    pub idle_timeout: Duration,

    /// TTL / hop limit on outbound sockets.
    pub ttl: u32,

    pub connect_timeout: Duration,
    pub write_timeout: Duration,
    pub poll_slice: Duration,

    /// Telemetry ring size.
    pub telemetry_capacity: usize,

    pub backend_verify: VerifySetting,

    /// SNI / verification name toward the backend; defaults to its IP.
    pub backend_server_name: String,

    /// Hold the listener until the first successful backend probe.
    pub wait_for_backend: bool,

    pub probe_interval: Duration,
    pub status_interval: Duration,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    Ok(lookup(name)
        .map(|v| v.trim().parse::<T>())
        .transpose()
        .with_context(|| format!("{name} has an invalid value."))?
        .unwrap_or(default))
}

fn flag(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> bool {
    lookup(name)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through `lookup`, one variable name at a time.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let listen_addr = parse_or(&lookup, "BRIDGE_LISTEN_ADDR", SocketAddr::from(([0, 0, 0, 0], 443)))?;

        let backend_addr: SocketAddr = lookup("BRIDGE_BACKEND_ADDR")
            .context("Missing backend address. Set BRIDGE_BACKEND_ADDR (example: 192.168.91.1:443).")?
            .trim()
            .parse()
            .context("BRIDGE_BACKEND_ADDR must be an ip:port socket address.")?;

        let mode = match lookup("BRIDGE_MODE").as_deref().map(str::trim) {
            None | Some("passthrough") => ModeSetting::Passthrough,
            Some("terminating") => ModeSetting::Terminating {
                cert_file: lookup("BRIDGE_TLS_CERT_FILE")
                    .map(PathBuf::from)
                    .context("BRIDGE_TLS_CERT_FILE is required in terminating mode.")?,
                key_file: lookup("BRIDGE_TLS_KEY_FILE")
                    .map(PathBuf::from)
                    .context("BRIDGE_TLS_KEY_FILE is required in terminating mode.")?,
            },
            Some(other) => bail!("BRIDGE_MODE must be passthrough or terminating, got {other:?}."),
        };

        let backend_verify = match lookup("BRIDGE_BACKEND_VERIFY").as_deref().map(str::trim) {
            None | Some("insecure") => VerifySetting::Insecure,
            Some("webpki") => VerifySetting::WebPki,
            Some("ca") => VerifySetting::Ca(
                lookup("BRIDGE_BACKEND_CA_FILE")
                    .map(PathBuf::from)
                    .context("BRIDGE_BACKEND_CA_FILE is required when BRIDGE_BACKEND_VERIFY=ca.")?,
            ),
            Some(other) => bail!("BRIDGE_BACKEND_VERIFY must be insecure, webpki or ca, got {other:?}."),
        };

        let buffer_size = parse_or(&lookup, "BRIDGE_BUFFER_SIZE", DEFAULT_BUFFER_SIZE)?.max(MIN_BUFFER_SIZE);
        let max_clients = parse_or(&lookup, "BRIDGE_MAX_CLIENTS", DEFAULT_MAX_CLIENTS)?.max(1);
        let ttl = parse_or(&lookup, "BRIDGE_TTL", DEFAULT_TTL)?.clamp(1, 255);
        let telemetry_capacity =
            parse_or(&lookup, "BRIDGE_TELEMETRY_CAPACITY", DEFAULT_TELEMETRY_CAPACITY)?.max(1);

        let idle_timeout = Duration::from_millis(parse_or(&lookup, "BRIDGE_IDLE_TIMEOUT_MS", 30_000u64)?.max(1));
        let connect_timeout = Duration::from_millis(parse_or(&lookup, "BRIDGE_CONNECT_TIMEOUT_MS", 2_000u64)?.max(1));
        let write_timeout = Duration::from_millis(parse_or(&lookup, "BRIDGE_WRITE_TIMEOUT_MS", 5_000u64)?.max(1));
        let poll_slice = Duration::from_millis(parse_or(&lookup, "BRIDGE_POLL_SLICE_MS", 100u64)?.max(10));
        let probe_interval = Duration::from_secs(
            parse_or(&lookup, "BRIDGE_PROBE_INTERVAL_SECS", DEFAULT_PROBE_INTERVAL.as_secs())?.max(1),
        );
        let status_interval = Duration::from_secs(parse_or(&lookup, "BRIDGE_STATUS_INTERVAL_SECS", 60u64)?.max(1));

        let backend_server_name = lookup("BRIDGE_BACKEND_SERVER_NAME")
            .map(|v| v.trim().to_string())
            .unwrap_or_else(|| backend_addr.ip().to_string());

        let log_level = lookup("BRIDGE_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            listen_addr,
            backend_addr,
            mode,
            buffer_size,
            max_clients,
            idle_timeout,
            ttl,
            connect_timeout,
            write_timeout,
            poll_slice,
            telemetry_capacity,
            backend_verify,
            backend_server_name,
            wait_for_backend: flag(&lookup, "BRIDGE_WAIT_FOR_BACKEND"),
            probe_interval,
            status_interval,
            log_level,
        })
    }

    /// Build the engine configuration, loading certificate files if needed.
    pub fn proxy_config(&self) -> Result<ProxyConfig> {
        let mode = match &self.mode {
            ModeSetting::Passthrough => ForwardingMode::Passthrough,
            ModeSetting::Terminating { cert_file, key_file } => {
                let backend_verification = match &self.backend_verify {
                    VerifySetting::Insecure => BackendVerification::Insecure,
                    VerifySetting::WebPki => BackendVerification::WebPki,
                    VerifySetting::Ca(path) => BackendVerification::CaPem(
                        std::fs::read(path)
                            .with_context(|| format!("Failed to read CA bundle {}", path.display()))?,
                    ),
                };

                ForwardingMode::Terminating(TerminationConfig {
                    cert_pem: std::fs::read(cert_file)
                        .with_context(|| format!("Failed to read certificate {}", cert_file.display()))?,
                    key_pem: std::fs::read(key_file)
                        .with_context(|| format!("Failed to read private key {}", key_file.display()))?,
                    backend_verification,
                    backend_server_name: self.backend_server_name.clone(),
                })
            }
        };

        Ok(ProxyConfig {
            bind_addr: self.listen_addr,
            backend: Backend::new(self.backend_addr)
                .with_ttl(Some(self.ttl))
                .with_connect_timeout(self.connect_timeout),
            mode,
            idle: IdlePolicy::new(self.idle_timeout),
            forward: ForwardSettings {
                poll_slice: self.poll_slice,
                write_timeout: self.write_timeout,
                handshake_timeout: self.connect_timeout,
            },
        })
    }
}
