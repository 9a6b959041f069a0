//! Registered service instances

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::metadata::Metadata;
use crate::DEFAULT_CLUSTER;

/// One `(ip, port)` endpoint belonging to a service.
///
/// `(service, group, ip, port)` is unique within the client's view of a
/// service. Ephemeral instances stay registered only while heartbeats keep
/// arriving; non-ephemeral ones persist until deregistered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Instance {
    pub group_name: String,
    pub service_name: String,
    pub cluster_name: String,
    pub instance_id: String,
    pub ip: String,
    pub port: u16,
    pub weight: f64,
    pub healthy: bool,
    #[serde(rename = "enable", alias = "enabled")]
    pub enabled: bool,
    pub ephemeral: bool,
    pub metadata: Metadata,
}

impl Default for Instance {
    fn default() -> Self {
        Self {
            group_name: String::new(),
            service_name: String::new(),
            cluster_name: String::new(),
            instance_id: String::new(),
            ip: String::new(),
            port: 0,
            weight: 1.0,
            healthy: true,
            enabled: true,
            ephemeral: true,
            metadata: Metadata::new(),
        }
    }
}

impl Instance {
    /// Create an instance with a locally generated identifier.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        service_name: impl Into<String>,
        group_name: impl Into<String>,
        cluster_name: impl Into<String>,
        ip: impl Into<String>,
        port: u16,
        weight: f64,
        enabled: bool,
        ephemeral: bool,
        metadata: Metadata,
    ) -> Self {
        let cluster_name = {
            let c: String = cluster_name.into();
            if c.is_empty() { DEFAULT_CLUSTER.to_string() } else { c }
        };
        Self {
            group_name: group_name.into(),
            service_name: service_name.into(),
            cluster_name,
            instance_id: Uuid::new_v4().to_string(),
            ip: ip.into(),
            port,
            weight,
            healthy: true,
            enabled,
            ephemeral,
            metadata,
        }
    }

    /// `ip:port`, the identity used when diffing service snapshots.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}
