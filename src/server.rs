//! DNS server setup and lifecycle management.

use hickory_server::authority::Catalog;
use hickory_server::ServerFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::discovery::Discovery;
use crate::error::DiscoveryError;
use crate::handler::ContainerHandler;
use crate::resolver::Resolver;
use crate::runtime::RuntimeClient;
use crate::state::RecordStore;
use crate::watcher::Watcher;

/// Interval for emitting state metrics.
const METRICS_INTERVAL: Duration = Duration::from_secs(10);

/// Periodically emit state metrics.
async fn metrics_loop(store: RecordStore, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(METRICS_INTERVAL);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                store.emit_metrics();
                debug!(
                    records = store.len(),
                    generation = store.generation(),
                    "emitted store metrics"
                );
            }
            _ = cancel.cancelled() => {
                debug!("metrics loop shutting down");
                return;
            }
        }
    }
}

/// Container discovery plus the DNS server answering for it.
pub struct DiscoveryServer<C> {
    config: Config,
    client: Arc<C>,
    store: RecordStore,
}

impl<C: RuntimeClient> DiscoveryServer<C> {
    /// Create a server over a connected runtime client.
    pub fn new(config: Config, client: Arc<C>) -> Self {
        Self {
            config,
            client,
            store: RecordStore::new(),
        }
    }

    /// The record store queries are answered from.
    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    /// Build a watcher with the discovery handlers registered.
    pub fn watcher(&self) -> Result<Watcher<C>, DiscoveryError> {
        let resolver = Resolver::from_config(&self.config.resolver, self.client.clone());
        info!(strategies = ?resolver.strategy_names(), "address resolution chain");

        let discovery = Discovery::new(self.store.clone(), resolver, &self.config.discovery.domain)
            .with_remove_on_exit(self.config.discovery.remove_on_exit);

        let mut watcher = Watcher::new(self.client.clone())
            .with_max_in_flight(self.config.watcher.max_in_flight)
            .with_drain_timeout(self.config.watcher.drain_timeout());
        discovery.register(&mut watcher, &self.config.watcher.filter)?;
        Ok(watcher)
    }

    /// Build the DNS request handler. Names without a container record fall
    /// through to an empty catalog.
    pub fn handler(&self) -> ContainerHandler<Catalog> {
        ContainerHandler::new(self.store.clone(), Catalog::new())
            .with_ttl(self.config.discovery.ttl)
    }

    /// Run discovery and serve DNS until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), DiscoveryError> {
        info!(
            listen_addr = %self.config.dns.listen_addr,
            domain = %self.config.discovery.domain,
            namespace = %self.config.discovery.namespace,
            ttl = self.config.discovery.ttl,
            "Starting containerd-dns server"
        );

        let watcher = self.watcher()?;
        let mut server = ServerFuture::new(self.handler());

        let udp_socket = UdpSocket::bind(self.config.dns.listen_addr).await?;
        info!(addr = %self.config.dns.listen_addr, "DNS UDP listening");
        server.register_socket(udp_socket);

        let tcp_listener = TcpListener::bind(self.config.dns.listen_addr).await?;
        info!(addr = %self.config.dns.listen_addr, "DNS TCP listening");
        server.register_listener(
            tcp_listener,
            Duration::from_secs(self.config.dns.tcp_timeout_secs),
        );

        let watcher_handle = tokio::spawn(watcher.listen(cancel.clone()));
        let metrics_handle = tokio::spawn(metrics_loop(self.store.clone(), cancel.clone()));
        self.store.emit_metrics();

        tokio::select! {
            _ = cancel.cancelled() => {
                info!("DNS server shutdown requested");
            }
            result = server.block_until_done() => {
                if let Err(e) = result {
                    error!("DNS server error: {}", e);
                }
                cancel.cancel();
            }
        }

        let _ = metrics_handle.await;

        info!("Waiting for watcher to stop...");
        match watcher_handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("watcher error: {}", e),
            Err(e) => error!("watcher task panicked: {}", e),
        }

        info!("DNS server stopped");
        Ok(())
    }
}
