//! Container address resolution.
//!
//! A [`Resolver`] runs an ordered chain of strategies and returns the first
//! address any of them finds:
//!
//! 1. pod sandbox status from the runtime (optional)
//! 2. the CNI result file the bridge plugin left on disk
//! 3. the container's own network namespace
//!
//! A strategy error falls through to the next strategy, except
//! [`DiscoveryError::NoTask`], which ends resolution for this event.

use async_trait::async_trait;
use serde::Deserialize;
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::ResolverConfig;
use crate::error::DiscoveryError;
use crate::metadata::ContainerInfo;
use crate::metrics;
use crate::runtime::RuntimeClient;

/// One way of finding a container's IPv4 address.
#[async_trait]
pub trait AddressStrategy: Send + Sync {
    /// Short name for logs and metrics.
    fn name(&self) -> &'static str;

    /// Find the address. `Ok(None)` means this strategy has nothing to say.
    async fn resolve(&self, container: &ContainerInfo) -> Result<Option<Ipv4Addr>, DiscoveryError>;
}

/// Ordered chain of address strategies.
#[derive(Default)]
pub struct Resolver {
    strategies: Vec<Box<dyn AddressStrategy>>,
}

impl Resolver {
    /// Create an empty resolver.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the chain described by `config`.
    pub fn from_config<C: RuntimeClient>(config: &ResolverConfig, client: Arc<C>) -> Self {
        let mut resolver = Self::new();
        if config.sandbox_status {
            resolver = resolver.with_strategy(SandboxStatusStrategy::new(client.clone()));
        }
        resolver = resolver.with_strategy(CniResultStrategy::new(&config.cni_state_dir));
        #[cfg(target_os = "linux")]
        if config.netns_introspection {
            resolver = resolver.with_strategy(crate::netns::NetnsStrategy::new(client));
        }
        resolver
    }

    /// Append a strategy to the end of the chain.
    pub fn with_strategy<S: AddressStrategy + 'static>(mut self, strategy: S) -> Self {
        self.strategies.push(Box::new(strategy));
        self
    }

    /// Names of the configured strategies, in order.
    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    /// Resolve the container's primary IPv4 address.
    pub async fn resolve(&self, container: &ContainerInfo) -> Result<Ipv4Addr, DiscoveryError> {
        for strategy in &self.strategies {
            match strategy.resolve(container).await {
                Ok(Some(addr)) => {
                    debug!(
                        container_id = %container.id,
                        strategy = strategy.name(),
                        %addr,
                        "resolved container address"
                    );
                    metrics::record_resolution(strategy.name(), "found");
                    return Ok(addr);
                }
                Ok(None) => {
                    metrics::record_resolution(strategy.name(), "not_found");
                }
                Err(e) if e.aborts_resolution() => {
                    metrics::record_resolution(strategy.name(), "aborted");
                    return Err(e);
                }
                Err(e) => {
                    warn!(
                        container_id = %container.id,
                        strategy = strategy.name(),
                        "address strategy failed: {}",
                        e
                    );
                    metrics::record_resolution(strategy.name(), "error");
                }
            }
        }
        Err(DiscoveryError::NotFound(container.id.clone()))
    }
}

/// Asks the runtime for the pod sandbox address.
pub struct SandboxStatusStrategy<C> {
    client: Arc<C>,
}

impl<C> SandboxStatusStrategy<C> {
    /// Create the strategy.
    pub fn new(client: Arc<C>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl<C: RuntimeClient> AddressStrategy for SandboxStatusStrategy<C> {
    fn name(&self) -> &'static str {
        "sandbox"
    }

    async fn resolve(&self, container: &ContainerInfo) -> Result<Option<Ipv4Addr>, DiscoveryError> {
        self.client.sandbox_address(container).await
    }
}

/// Reads `{state_dir}/bridge-{id}-eth0` written by the CNI bridge plugin.
pub struct CniResultStrategy {
    state_dir: PathBuf,
}

#[derive(Debug, Deserialize)]
struct CniCacheEntry {
    #[serde(default)]
    result: Option<CniResult>,
}

#[derive(Debug, Deserialize)]
struct CniResult {
    #[serde(default)]
    ips: Vec<CniIpConfig>,
}

#[derive(Debug, Deserialize)]
struct CniIpConfig {
    address: String,
}

impl CniResultStrategy {
    /// Create the strategy for a CNI state directory.
    pub fn new(state_dir: impl AsRef<Path>) -> Self {
        Self {
            state_dir: state_dir.as_ref().to_path_buf(),
        }
    }

    /// Path of the result file for a container.
    pub fn result_path(&self, container_id: &str) -> PathBuf {
        self.state_dir.join(format!("bridge-{}-eth0", container_id))
    }
}

/// Extract the first IPv4 address from a CNI result document.
fn parse_cni_result(bytes: &[u8]) -> Result<Option<Ipv4Addr>, String> {
    let entry: CniCacheEntry = serde_json::from_slice(bytes).map_err(|e| e.to_string())?;
    let Some(result) = entry.result else {
        return Ok(None);
    };

    for ip in &result.ips {
        let host = ip
            .address
            .split_once('/')
            .map(|(host, _)| host)
            .unwrap_or(&ip.address);
        match host.parse::<IpAddr>() {
            Ok(IpAddr::V4(v4)) => return Ok(Some(v4)),
            Ok(IpAddr::V6(_)) => continue,
            Err(e) => return Err(format!("invalid address {:?}: {}", ip.address, e)),
        }
    }
    Ok(None)
}

#[async_trait]
impl AddressStrategy for CniResultStrategy {
    fn name(&self) -> &'static str {
        "cni"
    }

    async fn resolve(&self, container: &ContainerInfo) -> Result<Option<Ipv4Addr>, DiscoveryError> {
        let path = self.result_path(&container.id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        parse_cni_result(&bytes).map_err(|reason| DiscoveryError::Cni {
            path: path.display().to_string(),
            reason,
        })
    }
}
