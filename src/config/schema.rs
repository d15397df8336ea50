//! Shape of `gracehttp.toml`.
//!
//! Every struct is `#[serde(default)]`, so any section or field may be left out.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GraceConfig {
    /// Named server instances, each with its own listeners and route table.
    pub servers: Vec<ServerConfig>,

    /// Restart, reload and supervision settings.
    pub process: ProcessConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

impl Default for GraceConfig {
    fn default() -> Self {
        Self {
            servers: vec![ServerConfig::default()],
            process: ProcessConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

impl GraceConfig {
    pub fn server(&self, name: &str) -> Option<&ServerConfig> {
        self.servers.iter().find(|s| s.name == name)
    }
}

/// One logical server.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Logical name; keys the registry and the descriptor handoff.
    pub name: String,

    /// Plain HTTP bind addresses (e.g., "0.0.0.0:8080").
    pub addresses: Vec<String>,

    /// HTTPS bind addresses; require `tls`.
    pub https_addresses: Vec<String>,

    /// Certificate used by every HTTPS address of this server.
    pub tls: Option<TlsConfig>,

    /// Maximum concurrent connections per listener (backpressure).
    pub max_connections: usize,

    /// Capacity of each resolution cache; 0 disables caching.
    pub route_cache_capacity: usize,

    /// Per-request timeout.
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            addresses: vec!["0.0.0.0:8080".to_string()],
            https_addresses: Vec::new(),
            tls: None,
            max_connections: 10_000,
            route_cache_capacity: 10_000,
            request_timeout_secs: 30,
        }
    }
}

impl ServerConfig {
    /// Same listeners as `other`, so a handler reload is enough.
    pub fn same_listeners(&self, other: &ServerConfig) -> bool {
        self.addresses == other.addresses
            && self.https_addresses == other.https_addresses
            && self.tls == other.tls
            && self.max_connections == other.max_connections
    }
}

/// TLS configuration for HTTPS listeners.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct TlsConfig {
    /// Path to certificate file (PEM).
    pub cert_path: PathBuf,

    /// Path to private key file (PEM).
    pub key_path: PathBuf,
}

/// Process lifecycle configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProcessConfig {
    /// Run a top-level coordinator that owns no listeners.
    pub supervise: bool,

    /// Drain grace period before remaining connections are aborted.
    pub graceful_timeout_secs: u64,

    /// How long a predecessor waits for its successor to report ready.
    pub successor_ready_timeout_secs: u64,

    /// Hand listening sockets to successors. When false, or unsupported by
    /// the platform, restarts close sockets before the successor binds.
    pub inherit_descriptors: bool,

    /// Written with the serving process id once it is running.
    pub pid_file: Option<PathBuf>,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            supervise: false,
            graceful_timeout_secs: 30,
            successor_ready_timeout_secs: 10,
            inherit_descriptors: true,
            pid_file: None,
        }
    }
}

impl ProcessConfig {
    pub fn graceful_timeout(&self) -> Duration {
        Duration::from_secs(self.graceful_timeout_secs)
    }

    pub fn successor_ready_timeout(&self) -> Duration {
        Duration::from_secs(self.successor_ready_timeout_secs)
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log output format.
    pub log_format: LogFormat,

    /// Enable the Prometheus endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}
