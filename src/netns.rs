//! Address lookup from inside a container's network namespace.
//!
//! `setns(2)` switches the namespace of the calling thread only. Each lookup
//! runs on its own short-lived OS thread, holds a process-wide lock while in
//! the foreign namespace, and switches back through a guard before the thread
//! exits.

use async_trait::async_trait;
use nix::ifaddrs::getifaddrs;
use nix::net::if_::InterfaceFlags;
use nix::sched::{setns, CloneFlags};
use parking_lot::Mutex;
use std::fs::File;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{error, trace};

use crate::error::DiscoveryError;
use crate::metadata::ContainerInfo;
use crate::resolver::AddressStrategy;
use crate::runtime::RuntimeClient;

/// Only one lookup may occupy a foreign namespace at a time.
static NETNS_LOCK: Mutex<()> = parking_lot::const_mutex(());

/// Enters the container's network namespace and reads its first
/// non-loopback IPv4 address.
pub struct NetnsStrategy<C> {
    client: Arc<C>,
}

impl<C> NetnsStrategy<C> {
    /// Create the strategy.
    pub fn new(client: Arc<C>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl<C: RuntimeClient> AddressStrategy for NetnsStrategy<C> {
    fn name(&self) -> &'static str {
        "netns"
    }

    async fn resolve(&self, container: &ContainerInfo) -> Result<Option<Ipv4Addr>, DiscoveryError> {
        let pid = self
            .client
            .task_pid(&container.id)
            .await?
            .filter(|pid| *pid > 0)
            .ok_or_else(|| DiscoveryError::NoTask(container.id.clone()))?;

        lookup_in_netns(pid).await
    }
}

/// Read the first non-loopback IPv4 address in the network namespace of `pid`.
pub async fn lookup_in_netns(pid: u32) -> Result<Option<Ipv4Addr>, DiscoveryError> {
    let (tx, rx) = oneshot::channel();
    std::thread::Builder::new()
        .name(format!("netns-{pid}"))
        .spawn(move || {
            let _ = tx.send(first_ipv4_in_netns(pid));
        })?;

    rx.await
        .map_err(|_| DiscoveryError::Namespace(format!("lookup thread for pid {pid} died")))?
}

fn first_ipv4_in_netns(pid: u32) -> Result<Option<Ipv4Addr>, DiscoveryError> {
    let _lock = NETNS_LOCK.lock();

    let path = format!("/proc/{pid}/ns/net");
    let target = File::open(&path)
        .map_err(|e| DiscoveryError::Namespace(format!("open {path}: {e}")))?;

    let _guard = NamespaceGuard::enter(&target)?;
    first_non_loopback_ipv4()
}

fn first_non_loopback_ipv4() -> Result<Option<Ipv4Addr>, DiscoveryError> {
    let addrs = getifaddrs().map_err(|e| DiscoveryError::Namespace(format!("getifaddrs: {e}")))?;

    for ifaddr in addrs {
        if ifaddr.interface_name == "lo" || ifaddr.flags.contains(InterfaceFlags::IFF_LOOPBACK) {
            continue;
        }
        let Some(sin) = ifaddr.address.as_ref().and_then(|a| a.as_sockaddr_in()) else {
            continue;
        };
        let addr = *SocketAddrV4::from(*sin).ip();
        trace!(interface = %ifaddr.interface_name, %addr, "found namespace address");
        return Ok(Some(addr));
    }
    Ok(None)
}

/// Switches the current thread into a network namespace and back on drop.
struct NamespaceGuard {
    original: File,
}

impl NamespaceGuard {
    fn enter(target: &File) -> Result<Self, DiscoveryError> {
        let original = File::open("/proc/thread-self/ns/net")
            .map_err(|e| DiscoveryError::Namespace(format!("open own namespace: {e}")))?;
        setns(target, CloneFlags::CLONE_NEWNET)
            .map_err(|e| DiscoveryError::Namespace(format!("setns: {e}")))?;
        Ok(Self { original })
    }
}

impl Drop for NamespaceGuard {
    fn drop(&mut self) {
        if let Err(e) = setns(&self.original, CloneFlags::CLONE_NEWNET) {
            // The thread exits right after, so the namespace does not leak.
            error!("failed to restore network namespace: {}", e);
        }
    }
}
