//! Configuration structures.
//!
//! Configuration is loaded from a JSON file; every section falls back to its
//! defaults when absent.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Name of the service exposing actions (first segment of span names).
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// RPC transport configuration.
    #[serde(default)]
    pub rpc: RpcConfig,

    /// Message bus configuration.
    #[serde(default)]
    pub bus: BusConfig,

    /// Lock provider defaults.
    #[serde(default)]
    pub lock: LockConfig,

    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

fn default_service_name() -> String {
    "gateway".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            rpc: RpcConfig::default(),
            bus: BusConfig::default(),
            lock: LockConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> crate::types::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

/// RPC transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Start the RPC server at all.
    pub enabled: bool,

    /// Server bind address (TCP).
    pub listen_addr: String,

    /// Dotted names of the services to serve (e.g. `gateway.documents.Documents`).
    pub services: Vec<String>,

    /// Directory scanned recursively for service descriptor files.
    pub descriptor_dir: Option<PathBuf>,

    /// Maximum frame payload size in bytes.
    pub max_frame_bytes: u32,

    /// Maximum concurrent TCP connections. New connections beyond this limit
    /// are held until a slot opens (backpressure via semaphore).
    pub max_connections: usize,

    /// Read timeout in seconds per frame. Connections idle beyond this
    /// duration are dropped.
    pub read_timeout_secs: u64,

    /// Write timeout in seconds per frame.
    pub write_timeout_secs: u64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_addr: "127.0.0.1:50051".to_string(),
            services: Vec::new(),
            descriptor_dir: None,
            max_frame_bytes: 5 * 1024 * 1024,
            max_connections: 1000,
            read_timeout_secs: 30,
            write_timeout_secs: 10,
        }
    }
}

/// Message bus configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Default request timeout in milliseconds (when the caller omits one).
    pub default_timeout_ms: u64,

    /// Maximum request timeout in milliseconds (caps caller-requested timeouts).
    pub max_timeout_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 5_000,
            max_timeout_ms: 30_000,
        }
    }
}

/// Lock provider defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// TTL applied to resource locks taken around handlers.
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,

    /// How long a local lock acquisition waits for a busy resource.
    #[serde(with = "humantime_serde")]
    pub acquire_timeout: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl: crate::lock::DEFAULT_LOCK_TTL,
            acquire_timeout: Duration::from_secs(10),
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Tracing log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable JSON log formatting.
    pub json_logs: bool,

    /// Prometheus scrape endpoint bind address (optional).
    pub metrics_addr: Option<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
            metrics_addr: None,
        }
    }
}
