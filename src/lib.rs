//! containerd DNS - DNS discovery for containers managed by containerd.
//!
//! This crate watches a containerd namespace for task lifecycle events,
//! resolves each started container's IPv4 address and answers A queries for
//! `<hostname>.<domain>.` with it. Records are kept in memory only; at
//! startup the store is seeded from the containers already present.
//!
//! ## Features
//!
//! - Live updates from the containerd event bus, with re-subscription and
//!   re-seeding when the stream drops
//! - Filter expressions over labels, environment, hostname and image
//! - Address resolution through CRI sandbox status, CNI result files or the
//!   container's network namespace
//! - Empty AAAA answers for names that only have an A record
//! - Graceful shutdown support
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                          containerd-dns                           │
//! │                                                                   │
//! │  ┌──────────────────┐   ┌──────────────┐   ┌──────────────────┐   │
//! │  │ Watcher          │──▶│ Discovery    │──▶│ Record store     │   │
//! │  │ (events, filter) │   │ (resolver)   │   │ (in-memory)      │   │
//! │  └──────────────────┘   └──────────────┘   └────────┬─────────┘   │
//! │         ▲                                           │             │
//! │         │ /tasks/start                              ▼             │
//! │         │ /tasks/exit                     ┌──────────────────┐    │
//! │         │ /tasks/delete                   │ ContainerHandler │◀── UDP/TCP
//! │         │                                 │ → next handler   │    │
//! │  containerd socket                        └──────────────────┘    │
//! └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use containerd_dns::containerd::ContainerdClient;
//! use containerd_dns::{Config, DiscoveryServer};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::default().normalize().unwrap();
//!     let discovery = &config.discovery;
//!     let client = ContainerdClient::connect(&discovery.endpoint, &discovery.namespace)
//!         .await
//!         .unwrap();
//!
//!     let server = DiscoveryServer::new(config, Arc::new(client));
//!     server.run(CancellationToken::new()).await.unwrap();
//! }
//! ```

#![warn(missing_docs)]

pub mod config;
#[cfg(feature = "containerd")]
pub mod containerd;
pub mod discovery;
pub mod error;
pub mod events;
pub mod filter;
pub mod handler;
pub mod metadata;
pub mod metrics;
#[cfg(target_os = "linux")]
pub mod netns;
pub mod resolver;
pub mod runtime;
pub mod server;
pub mod state;
pub mod telemetry;
pub mod watcher;

// Re-export main types
pub use config::{
    Config, DiscoveryConfig, DnsConfig, ResolverConfig, TelemetryConfig, WatcherConfig,
};
pub use discovery::Discovery;
pub use error::DiscoveryError;
pub use events::LifecycleEvent;
pub use filter::Filter;
pub use handler::ContainerHandler;
pub use metadata::ContainerInfo;
pub use resolver::Resolver;
pub use runtime::RuntimeClient;
pub use server::DiscoveryServer;
pub use state::RecordStore;
pub use watcher::Watcher;
