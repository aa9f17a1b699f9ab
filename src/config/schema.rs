//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the proxy.
//! All types derive Serde traits for deserialization from config files.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration for the proxy.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ProxyConfig {
    /// Public HTTP/HTTPS ports and dynamic listener settings.
    pub listener: ListenerConfig,

    /// Control-plane discovery settings.
    pub discovery: DiscoveryConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Static assets and error page overrides.
    pub assets: AssetsConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Address every listener binds to.
    pub bind_ip: IpAddr,

    /// Plaintext HTTP port.
    pub http_port: u16,

    /// TLS HTTP port.
    pub https_port: u16,

    /// Optional TLS configuration. Without it only plaintext is served.
    pub tls: Option<TlsConfig>,

    /// Depth of the accepted-connection queue (backpressure).
    pub request_queue_depth: usize,

    /// How long a dynamic listener may take to stop, in milliseconds.
    pub close_timeout_ms: u64,
}

impl ListenerConfig {
    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            http_port: 80,
            https_port: 443,
            tls: None,
            request_queue_depth: 15,
            close_timeout_ms: 5_000,
        }
    }
}

/// TLS configuration for the secure listener.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    /// Directory holding `<cert_name>.crt` and `<cert_name>.key`.
    #[serde(default = "default_cert_dir")]
    pub cert_dir: String,

    /// Certificate base name.
    pub cert_name: String,
}

fn default_cert_dir() -> String {
    "/ssl".to_string()
}

/// Service discovery configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Poll interval in seconds. Zero means the default (5s).
    pub interval_secs: u64,

    /// Name of the proxy's own service; never routed to.
    pub management_service: String,

    /// Namespaces whose services are never routed to.
    pub reserved_namespaces: Vec<String>,

    /// Label overriding a backend's host key.
    pub host_label: String,

    /// Host key used when no registered key matches.
    pub default_backend: Option<String>,

    /// Suffix of cluster-internal DNS names.
    pub cluster_domain: String,

    /// Restrict discovery to one namespace.
    pub namespace: Option<String>,

    /// How long the watcher may take to stop, in milliseconds.
    pub stop_timeout_ms: u64,
}

impl DiscoveryConfig {
    pub fn interval(&self) -> Option<Duration> {
        Some(Duration::from_secs(self.interval_secs)).filter(|d| !d.is_zero())
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            interval_secs: 5,
            management_service: "cluster-proxy".to_string(),
            reserved_namespaces: vec!["kube-system".to_string()],
            host_label: "cluster-proxy-host".to_string(),
            default_backend: None,
            cluster_domain: "svc.cluster.local".to_string(),
            namespace: None,
            stop_timeout_ms: 5_000,
        }
    }
}

/// Timeout configuration for various operations.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Total time for a proxied HTTP request, in seconds (max 900).
    pub request_secs: u64,

    /// Backend dial timeout for raw TCP passthrough, in seconds.
    pub connect_secs: u64,
}

impl TimeoutConfig {
    pub fn request(&self) -> Duration {
        Duration::from_secs(self.request_secs)
    }

    pub fn connect(&self) -> Duration {
        Duration::from_secs(self.connect_secs)
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            request_secs: 10,
            connect_secs: 30,
        }
    }
}

/// Static assets served by the proxy itself.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct AssetsConfig {
    /// Path of the favicon served on error pages.
    pub favicon_path: Option<String>,

    /// Directory with `502.html` / `503.html` template overrides.
    pub error_pages_dir: Option<String>,
}

/// Log output format.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log output format.
    pub log_format: LogFormat,

    /// Enable metrics endpoint.
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
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}
