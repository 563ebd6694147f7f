//! Turns container lifecycle events into DNS records.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::DiscoveryError;
use crate::events::LifecycleEvent;
use crate::metadata::ContainerInfo;
use crate::resolver::Resolver;
use crate::runtime::RuntimeClient;
use crate::state::{container_fqdn, RecordStore};
use crate::watcher::Watcher;

/// Publishes started containers under `<hostname>.<domain>.` and withdraws
/// them again when their task goes away.
#[derive(Clone)]
pub struct Discovery {
    store: RecordStore,
    resolver: Arc<Resolver>,
    domain: Arc<str>,
    remove_on_exit: bool,
}

impl Discovery {
    /// Create discovery for `domain`, writing into `store`.
    pub fn new(store: RecordStore, resolver: Resolver, domain: &str) -> Self {
        Self {
            store,
            resolver: Arc::new(resolver),
            domain: Arc::from(domain),
            remove_on_exit: true,
        }
    }

    /// Whether records are removed when a container's task exits or is
    /// deleted.
    pub fn with_remove_on_exit(mut self, remove_on_exit: bool) -> Self {
        self.remove_on_exit = remove_on_exit;
        self
    }

    /// Register the start, exit and delete handlers on `watcher`. Only
    /// containers matching `start_filter` are published.
    pub fn register<C: RuntimeClient>(
        &self,
        watcher: &mut Watcher<C>,
        start_filter: &str,
    ) -> Result<(), DiscoveryError> {
        let discovery = self.clone();
        watcher.handle_start(start_filter, move |container, _event| {
            let discovery = discovery.clone();
            async move {
                discovery.on_start(&container).await;
            }
        })?;

        if !self.remove_on_exit {
            return Ok(());
        }

        let discovery = self.clone();
        watcher.handle_exit("", move |container, event| {
            let discovery = discovery.clone();
            async move {
                discovery.on_stop(&container, &event);
            }
        })?;

        let discovery = self.clone();
        watcher.handle_delete("", move |container, event| {
            let discovery = discovery.clone();
            async move {
                discovery.on_stop(&container, &event);
            }
        })?;

        Ok(())
    }

    async fn on_start(&self, container: &ContainerInfo) {
        match self.publish(container).await {
            Ok(_) => {}
            Err(DiscoveryError::NoTask(id)) => {
                debug!(container_id = %id, "container has no running task, not publishing");
            }
            Err(e) => {
                warn!(container_id = %container.id, "failed to publish container: {}", e);
            }
        }
    }

    fn on_stop(&self, container: &ContainerInfo, event: &LifecycleEvent) {
        if !event.is_primary_exit() {
            return;
        }
        let removed = self.withdraw(&container.id);
        if !removed.is_empty() {
            info!(
                container_id = %container.id,
                names = ?removed,
                topic = event.topic().as_str(),
                "withdrew container records"
            );
        }
    }

    /// Resolve the container's address and publish it under its hostname.
    ///
    /// Returns the published name, or `None` when the container has no
    /// hostname.
    pub async fn publish(
        &self,
        container: &ContainerInfo,
    ) -> Result<Option<String>, DiscoveryError> {
        let Some(hostname) = container.hostname() else {
            debug!(container_id = %container.id, "container has no hostname");
            return Ok(None);
        };

        let addr = self.resolver.resolve(container).await?;
        let name = container_fqdn(hostname, &self.domain);

        match self.store.update_owned(&container.id, &name, addr) {
            Some(previous) => info!(
                container_id = %container.id,
                name = %name,
                %previous,
                %addr,
                "container address changed"
            ),
            None => info!(container_id = %container.id, name = %name, %addr, "published container"),
        }
        self.store.emit_metrics();
        Ok(Some(name))
    }

    /// Remove the records the container still owns.
    pub fn withdraw(&self, container_id: &str) -> Vec<String> {
        let removed = self.store.remove_owned(container_id);
        if !removed.is_empty() {
            self.store.emit_metrics();
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::RuntimeSpec;
    use crate::resolver::AddressStrategy;
    use async_trait::async_trait;
    use hickory_proto::rr::RecordType;
    use std::net::{IpAddr, Ipv4Addr};

    struct Fixed(Option<Ipv4Addr>);

    #[async_trait]
    impl AddressStrategy for Fixed {
        fn name(&self) -> &'static str {
            "fixed"
        }

        async fn resolve(&self, _: &ContainerInfo) -> Result<Option<Ipv4Addr>, DiscoveryError> {
            Ok(self.0)
        }
    }

    fn discovery(store: &RecordStore, addr: Option<Ipv4Addr>) -> Discovery {
        Discovery::new(
            store.clone(),
            Resolver::new().with_strategy(Fixed(addr)),
            "node.local",
        )
    }

    fn container(id: &str, hostname: &str) -> ContainerInfo {
        ContainerInfo {
            id: id.to_string(),
            spec: Some(RuntimeSpec {
                hostname: hostname.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_publish_uses_hostname_and_domain() {
        let store = RecordStore::new();
        let d = discovery(&store, Some(Ipv4Addr::new(10, 4, 0, 2)));

        let name = d.publish(&container("c1", "web")).await.unwrap();
        assert_eq!(name.as_deref(), Some("web.node.local."));
        assert_eq!(
            store.lookup("web.node.local.", RecordType::A),
            Some(IpAddr::V4(Ipv4Addr::new(10, 4, 0, 2)))
        );
    }

    #[tokio::test]
    async fn test_publish_without_hostname_is_skipped() {
        let store = RecordStore::new();
        let d = discovery(&store, Some(Ipv4Addr::new(10, 4, 0, 2)));

        assert_eq!(d.publish(&container("c1", "")).await.unwrap(), None);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_unresolvable_container_leaves_store_untouched() {
        let store = RecordStore::new();
        let d = discovery(&store, None);

        let err = d.publish(&container("c1", "web")).await.unwrap_err();
        assert!(matches!(err, DiscoveryError::NotFound(_)));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_exec_exit_keeps_record() {
        let store = RecordStore::new();
        let d = discovery(&store, Some(Ipv4Addr::new(10, 4, 0, 2)));
        let web = container("c1", "web");
        d.publish(&web).await.unwrap();

        let exec_exit = LifecycleEvent::Exit {
            container_id: "c1".to_string(),
            exec_id: "shell".to_string(),
            pid: 99,
            exit_status: 0,
        };
        d.on_stop(&web, &exec_exit);
        assert!(store.has_a("web.node.local."));

        let exit = LifecycleEvent::Exit {
            container_id: "c1".to_string(),
            exec_id: "c1".to_string(),
            pid: 1,
            exit_status: 0,
        };
        d.on_stop(&web, &exit);
        assert!(!store.has_a("web.node.local."));
    }
}
