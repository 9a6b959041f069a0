//! Shared data model for the registry client
//!
//! Defines the wire-level types exchanged with the registry (instances,
//! service snapshots) and the helpers for building service keys. Kept in its
//! own crate so that transports and applications can depend on the model
//! without pulling in the client runtime.

pub mod instance;
pub mod metadata;
pub mod service;

pub use instance::Instance;
pub use metadata::Metadata;
pub use service::{Service, ServiceInfo, ServiceList};

/// Group used when a caller does not name one.
pub const DEFAULT_GROUP: &str = "DEFAULT_GROUP";

/// Cluster used when a caller does not name one.
pub const DEFAULT_CLUSTER: &str = "DEFAULT";

/// Separator in service keys and grouped service names (`group@@name`).
pub const SERVICE_INFO_SEPARATOR: &str = "@@";

/// Join a group and a service name into the grouped form the registry expects.
pub fn grouped_service_name(group: &str, service: &str) -> String {
    format!("{}{}{}", group, SERVICE_INFO_SEPARATOR, service)
}

/// Build a service-info cache key from a grouped service name and an optional
/// cluster filter. The cluster filter is order-significant.
pub fn service_info_key(grouped_name: &str, clusters: &str) -> String {
    if clusters.is_empty() {
        grouped_name.to_string()
    } else {
        format!("{}{}{}", grouped_name, SERVICE_INFO_SEPARATOR, clusters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grouped_name_uses_separator() {
        assert_eq!(grouped_service_name("DEFAULT_GROUP", "orders"), "DEFAULT_GROUP@@orders");
    }

    #[test]
    fn key_without_clusters_is_the_grouped_name() {
        assert_eq!(service_info_key("g@@s", ""), "g@@s");
    }

    #[test]
    fn key_with_clusters_appends_filter() {
        assert_eq!(service_info_key("g@@s", "a,b"), "g@@s@@a,b");
    }
}
