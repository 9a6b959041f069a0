//! Service snapshots and catalog entries

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::instance::Instance;
use crate::{service_info_key, SERVICE_INFO_SEPARATOR};

/// The cached view of one service's endpoints, as pushed or pulled from the
/// registry.
///
/// `name` carries the grouped form (`group@@service`) on the wire. The cache
/// key is immutable for the lifetime of an entry and `last_ref_time` never
/// goes backwards for a given key.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceInfo {
    pub name: String,
    pub group_name: String,
    pub clusters: String,
    pub cache_millis: i64,
    pub hosts: Option<Vec<Instance>>,
    pub last_ref_time: i64,
    pub checksum: String,
    #[serde(rename = "allIPs")]
    pub all_ips: bool,
    /// Raw payload the registry sent; persisted verbatim by the disk cache.
    #[serde(skip)]
    pub json_from_server: String,
}

impl ServiceInfo {
    /// Placeholder for a service that has not been fetched yet.
    pub fn new(grouped_name: impl Into<String>, clusters: impl Into<String>) -> Self {
        Self { name: grouped_name.into(), clusters: clusters.into(), ..Self::default() }
    }

    /// Cache key: the grouped name, suffixed with the cluster filter when one
    /// is present.
    pub fn key(&self) -> String {
        service_info_key(&self.name, &self.clusters)
    }

    /// Structural validation applied before a payload is allowed to replace a
    /// cached entry.
    pub fn validate(&self) -> bool {
        !self.name.is_empty()
    }

    pub fn hosts(&self) -> &[Instance] {
        self.hosts.as_deref().unwrap_or_default()
    }

    /// Hosts indexed by `ip:port` for diffing.
    pub fn host_map(&self) -> HashMap<String, &Instance> {
        self.hosts().iter().map(|h| (h.addr(), h)).collect()
    }

    /// The bare service name, with the group prefix stripped.
    pub fn service_name(&self) -> &str {
        match self.name.split_once(SERVICE_INFO_SEPARATOR) {
            Some((_, name)) => name,
            None => &self.name,
        }
    }
}

/// A catalog entry returned by the service CRUD surface.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Service {
    pub name: String,
    pub group_name: String,
    pub app_name: String,
    pub metadata: HashMap<String, String>,
    pub protect_threshold: f64,
}

/// One page of service names.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceList {
    #[serde(rename = "doms", default)]
    pub services: Vec<String>,
    #[serde(default)]
    pub count: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_reflects_cluster_filter() {
        let plain = ServiceInfo::new("g@@s", "");
        assert_eq!(plain.key(), "g@@s");

        let filtered = ServiceInfo::new("g@@s", "c1,c2");
        assert_eq!(filtered.key(), "g@@s@@c1,c2");
    }

    #[test]
    fn service_name_strips_group() {
        let info = ServiceInfo::new("DEFAULT_GROUP@@orders", "");
        assert_eq!(info.service_name(), "orders");
    }

    #[test]
    fn deserializes_instance_list_payload() {
        let json = r#"{
            "name": "DEFAULT_GROUP@@orders",
            "clusters": "",
            "cacheMillis": 10000,
            "hosts": [{"ip": "10.0.0.1", "port": 7000, "weight": 1.0}],
            "lastRefTime": 1700000000000,
            "checksum": "abc",
            "allIPs": false
        }"#;
        let info: ServiceInfo = serde_json::from_str(json).unwrap();
        assert_eq!(info.key(), "DEFAULT_GROUP@@orders");
        assert_eq!(info.hosts().len(), 1);
        assert_eq!(info.last_ref_time, 1_700_000_000_000);
        assert!(info.validate());
    }

    #[test]
    fn missing_hosts_field_stays_none() {
        let info: ServiceInfo = serde_json::from_str(r#"{"name":"g@@s"}"#).unwrap();
        assert!(info.hosts.is_none());
    }

    #[test]
    fn service_list_uses_doms_field() {
        let list: ServiceList =
            serde_json::from_str(r#"{"doms": ["a", "b"], "count": 2}"#).unwrap();
        assert_eq!(list.services, vec!["a", "b"]);
        assert_eq!(list.count, 2);
    }
}
