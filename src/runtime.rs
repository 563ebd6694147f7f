//! The container runtime operations discovery depends on.

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::net::Ipv4Addr;

use crate::error::DiscoveryError;
use crate::events::Envelope;
use crate::metadata::ContainerInfo;

/// Stream of envelopes from the runtime event bus. Errors are reported in
/// band and do not end the stream by themselves.
pub type EventStream = BoxStream<'static, Result<Envelope, DiscoveryError>>;

/// Client for a container runtime scoped to one runtime namespace.
#[async_trait]
pub trait RuntimeClient: Send + Sync + 'static {
    /// List every container in the namespace.
    async fn list_containers(&self) -> Result<Vec<ContainerInfo>, DiscoveryError>;

    /// Load the full descriptor of one container.
    async fn load_container(&self, id: &str) -> Result<ContainerInfo, DiscoveryError>;

    /// Subscribe to lifecycle events of the namespace.
    async fn subscribe(&self) -> Result<EventStream, DiscoveryError>;

    /// Pid of the container's primary process, `None` when no task runs.
    async fn task_pid(&self, id: &str) -> Result<Option<u32>, DiscoveryError>;

    /// Address the runtime reports for the container's pod sandbox.
    async fn sandbox_address(
        &self,
        container: &ContainerInfo,
    ) -> Result<Option<Ipv4Addr>, DiscoveryError>;
}
