//! Client for the service-discovery registry
//!
//! Lets a process register its endpoints under a named service (kept live by
//! heartbeats), discover the healthy endpoints of other services through a
//! push-invalidated local cache, and subscribe to change events when a
//! service's endpoint set mutates. A disk-backed failover store can take over
//! all reads via a local switch file.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use registry_client::{Client, Config, Instance, Metadata};
//!
//! # async fn example() -> registry_client::Result<()> {
//! let client = Client::new(Config::with_hosts(vec!["registry-1:8848".to_string()]))?;
//! let naming = client.naming().await?;
//!
//! let instance = Instance::new(
//!     "orders", "DEFAULT_GROUP", "DEFAULT",
//!     "10.0.0.1", 7000, 1.0, true, true,
//!     Metadata::new().with("zone", "eu-1"),
//! );
//! naming.register_instance(&instance).await?;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod logging;
pub mod naming;
pub mod server_list;
pub mod transport;

pub use client::Client;
pub use config::Config;
pub use error::{Error, Result};
pub use naming::{
    EventListener, InstanceQuery, NamingClient, Selector, ServiceOptions, ServiceQuery,
};
pub use transport::{ApiRequest, ApiResponse};

pub use registry_types::{
    Instance, Metadata, Service, ServiceInfo, ServiceList, DEFAULT_CLUSTER, DEFAULT_GROUP,
};
