//! Client configuration

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Configuration for a registry client.
///
/// Either `hosts` or `endpoint` must be set: `hosts` pins a static server
/// list, `endpoint` names an address-server that is polled for the current
/// list. When both are present the endpoint wins and `hosts` is cleared,
/// matching the registry's precedence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// "http" or "https"
    pub scheme: String,

    /// Registry servers as `host:port`
    pub hosts: Vec<String>,

    /// Path prefix the registry is mounted under
    pub context_path: String,

    /// Application name sent as the `app` query parameter
    pub app_name: String,

    /// Tenancy partition
    pub namespace: String,

    /// Address server providing the host list (mutually exclusive with `hosts`)
    pub endpoint: String,

    pub username: String,
    pub password: String,

    /// Access key for request signing; only used together with `secret_key`
    pub access_key: String,
    pub secret_key: String,

    /// Default metadata merged into every registered instance; per-instance
    /// values win on conflict
    pub metadata: HashMap<String, String>,

    /// Root of the on-disk snapshot layout
    pub cache_dir: PathBuf,

    /// Filter directive for the logging layer (e.g. "info", "debug")
    pub log_level: String,

    /// Per-request timeout
    #[serde(with = "duration_millis")]
    pub timeout: Duration,

    /// Bind host for the UDP push receiver; empty binds all interfaces
    pub push_host: String,

    /// Re-register an ephemeral instance when a heartbeat reply reports it
    /// unknown (code 20404)
    pub reregister_on_not_found: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            scheme: "http".to_string(),
            hosts: Vec::new(),
            context_path: "/".to_string(),
            app_name: String::new(),
            namespace: "public".to_string(),
            endpoint: String::new(),
            username: "nacos".to_string(),
            password: "nacos".to_string(),
            access_key: String::new(),
            secret_key: String::new(),
            metadata: HashMap::new(),
            cache_dir: PathBuf::new(),
            log_level: "info".to_string(),
            timeout: Duration::from_secs(10),
            push_host: String::new(),
            reregister_on_not_found: true,
        }
    }
}

impl Config {
    /// Start from defaults with a static host list.
    pub fn with_hosts(hosts: Vec<String>) -> Self {
        Self { hosts, ..Self::default() }
    }

    /// Start from defaults with an address-server endpoint.
    pub fn with_endpoint(endpoint: impl Into<String>) -> Self {
        Self { endpoint: endpoint.into(), ..Self::default() }
    }

    /// Fill unset fields and validate. Called once at client construction.
    pub(crate) fn normalize(mut self) -> Result<Self> {
        if self.hosts.is_empty() && self.endpoint.is_empty() {
            return Err(Error::Config("either hosts or endpoint must be set".to_string()));
        }
        if !self.endpoint.is_empty() {
            self.hosts.clear();
        }
        if self.scheme.is_empty() {
            self.scheme = "http".to_string();
        }
        if self.scheme != "http" && self.scheme != "https" {
            return Err(Error::Config(format!("unsupported scheme: {}", self.scheme)));
        }
        if self.context_path.is_empty() {
            self.context_path = "/".to_string();
        }
        if self.cache_dir.as_os_str().is_empty() {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            self.cache_dir =
                PathBuf::from(home).join("registry-client").join("cache").join(&self.namespace);
        }
        std::fs::create_dir_all(&self.cache_dir)?;
        Ok(self)
    }

    /// Path prefix with exactly one trailing slash stripped, for joining.
    pub(crate) fn base_path(&self) -> &str {
        self.context_path.trim_end_matches('/')
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_rejects_missing_hosts_and_endpoint() {
        let err = Config::default().normalize().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn normalize_rejects_unknown_scheme() {
        let cfg = Config {
            scheme: "ftp".to_string(),
            ..Config::with_hosts(vec!["localhost:8848".to_string()])
        };
        assert!(matches!(cfg.normalize(), Err(Error::Config(_))));
    }

    #[test]
    fn endpoint_clears_static_hosts() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config {
            hosts: vec!["a:80".to_string()],
            endpoint: "addr:8080".to_string(),
            cache_dir: dir.path().to_path_buf(),
            ..Config::default()
        };
        let cfg = cfg.normalize().unwrap();
        assert!(cfg.hosts.is_empty());
        assert_eq!(cfg.endpoint, "addr:8080");
    }

    #[test]
    fn normalize_creates_cache_dir() {
        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("nested").join("cache");
        let cfg = Config {
            cache_dir: cache.clone(),
            ..Config::with_hosts(vec!["localhost:8848".to_string()])
        };
        cfg.normalize().unwrap();
        assert!(cache.is_dir());
    }

    #[test]
    fn base_path_strips_trailing_slash() {
        let cfg = Config { context_path: "/nacos/".to_string(), ..Config::default() };
        assert_eq!(cfg.base_path(), "/nacos");
        let cfg = Config::default();
        assert_eq!(cfg.base_path(), "");
    }
}
