//! Configuration types for containerd-dns.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::DiscoveryError;

/// Default containerd socket.
pub const DEFAULT_ENDPOINT: &str = "/run/containerd/containerd.sock";

/// Default zone that container hostnames are published under.
pub const DEFAULT_DOMAIN: &str = "node.local";

/// Default record TTL in seconds.
pub const DEFAULT_TTL: u32 = 3600;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Runtime connection and naming.
    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// Address resolution strategies.
    #[serde(default)]
    pub resolver: ResolverConfig,

    /// Event watcher tuning.
    #[serde(default)]
    pub watcher: WatcherConfig,

    /// DNS listener configuration.
    #[serde(default)]
    pub dns: DnsConfig,

    /// Telemetry configuration.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl Config {
    /// Apply defaults that cannot be expressed through serde and reject
    /// values that would make the server unusable.
    pub fn normalize(mut self) -> Result<Self, DiscoveryError> {
        // A zero TTL is ignored rather than rejected.
        if self.discovery.ttl == 0 {
            self.discovery.ttl = DEFAULT_TTL;
        }

        let domain = self.discovery.domain.trim().trim_matches('.');
        if domain.is_empty() {
            return Err(DiscoveryError::Config("discovery.domain is empty".into()));
        }
        self.discovery.domain = domain.to_ascii_lowercase();

        if self.discovery.endpoint.trim().is_empty() {
            return Err(DiscoveryError::Config("discovery.endpoint is empty".into()));
        }

        if self.watcher.max_in_flight == 0 {
            return Err(DiscoveryError::Config(
                "watcher.max_in_flight must be at least 1".into(),
            ));
        }

        Ok(self)
    }
}

/// Runtime connection and record naming.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Runtime socket path.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Runtime namespace to list and subscribe in (e.g., "k8s.io", "moby").
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Domain appended to container hostnames.
    #[serde(default = "default_domain")]
    pub domain: String,

    /// TTL for DNS records in seconds. Zero keeps the default.
    #[serde(default = "default_ttl")]
    pub ttl: u32,

    /// Remove a container's record when its task exits or is deleted.
    #[serde(default = "default_true")]
    pub remove_on_exit: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            namespace: default_namespace(),
            domain: default_domain(),
            ttl: default_ttl(),
            remove_on_exit: true,
        }
    }
}

/// Address resolution strategy selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverConfig {
    /// Ask the CRI runtime service for the pod sandbox IP first.
    #[serde(default)]
    pub sandbox_status: bool,

    /// Directory holding CNI result files.
    #[serde(default = "default_cni_state_dir")]
    pub cni_state_dir: PathBuf,

    /// Enter the container's network namespace as a last resort.
    #[serde(default = "default_true")]
    pub netns_introspection: bool,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            sandbox_status: false,
            cni_state_dir: default_cni_state_dir(),
            netns_introspection: true,
        }
    }
}

/// Event watcher tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherConfig {
    /// Maximum number of handler tasks running at once.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,

    /// How long to wait for in-flight handlers on shutdown.
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,

    /// Filter applied to start events before a record is published.
    #[serde(default)]
    pub filter: String,
}

impl WatcherConfig {
    /// Drain timeout as a `Duration`.
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            max_in_flight: default_max_in_flight(),
            drain_timeout_secs: default_drain_timeout_secs(),
            filter: String::new(),
        }
    }
}

/// DNS server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsConfig {
    /// Address for DNS server to listen on (UDP and TCP).
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Idle timeout for TCP connections in seconds.
    #[serde(default = "default_tcp_timeout_secs")]
    pub tcp_timeout_secs: u64,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            tcp_timeout_secs: default_tcp_timeout_secs(),
        }
    }
}

/// Telemetry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level filter (e.g., "info", "debug", "containerd_dns=debug,warn").
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Prometheus metrics exporter address.
    #[serde(default)]
    pub prometheus_addr: Option<SocketAddr>,

    /// OpenTelemetry configuration.
    #[serde(default)]
    pub opentelemetry: Option<OpenTelemetryConfig>,
}

/// OpenTelemetry exporter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenTelemetryConfig {
    /// OTLP endpoint (e.g., "http://localhost:4317").
    pub endpoint: String,

    /// Service name for traces.
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            prometheus_addr: None,
            opentelemetry: None,
        }
    }
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

fn default_namespace() -> String {
    "k8s.io".to_string()
}

fn default_domain() -> String {
    DEFAULT_DOMAIN.to_string()
}

fn default_ttl() -> u32 {
    DEFAULT_TTL
}

fn default_true() -> bool {
    true
}

fn default_cni_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/cni/results")
}

fn default_max_in_flight() -> usize {
    64
}

fn default_drain_timeout_secs() -> u64 {
    5
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 5353))
}

fn default_tcp_timeout_secs() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_service_name() -> String {
    "containerd-dns".to_string()
}
