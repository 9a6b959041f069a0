//! On-disk service snapshots
//!
//! Every effective cache update is written through as one file per service
//! key, holding the raw payload the registry sent. A fresh client loads the
//! directory back before touching the network, so a restart starts from the
//! previous run's view.

use std::path::{Path, PathBuf};

use registry_types::ServiceInfo;
use tracing::{debug, warn};

/// Escape a service key into a safe file name (query escaping, like the
/// registry's own layout).
pub(crate) fn escape_key(key: &str) -> String {
    url::form_urlencoded::byte_serialize(key.as_bytes()).collect()
}

/// Write-through snapshot store under the cache directory.
pub struct DiskCache {
    dir: PathBuf,
}

impl DiskCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Persist one snapshot. Disk trouble is logged, never surfaced; the
    /// cache simply stays memory-only.
    pub fn write(&self, service: &ServiceInfo) {
        let data = if service.json_from_server.is_empty() {
            match serde_json::to_string(service) {
                Ok(s) => s,
                Err(e) => {
                    warn!(key = %service.key(), error = %e, "snapshot not serializable");
                    return;
                }
            }
        } else {
            service.json_from_server.clone()
        };
        let path = self.dir.join(escape_key(&service.key()));
        if let Err(e) = std::fs::write(&path, data) {
            warn!(path = %path.display(), error = %e, "snapshot write failed");
        }
    }

    /// Load every parseable snapshot in the directory. Subdirectories (the
    /// failover tree lives here too) and corrupt files are skipped.
    pub fn load_all(&self) -> Vec<ServiceInfo> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %self.dir.display(), error = %e, "cache dir unreadable");
                return Vec::new();
            }
        };

        let mut services = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let raw = match std::fs::read_to_string(&path) {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "snapshot unreadable");
                    continue;
                }
            };
            match serde_json::from_str::<ServiceInfo>(&raw) {
                Ok(mut service) if service.validate() => {
                    service.json_from_server = raw;
                    services.push(service);
                }
                Ok(_) => debug!(path = %path.display(), "skipping invalid snapshot"),
                Err(e) => warn!(path = %path.display(), error = %e, "snapshot undecodable"),
            }
        }
        services
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use registry_types::Instance;

    fn service(name: &str, port: u16) -> ServiceInfo {
        let raw = format!(
            r#"{{"name":"{}","clusters":"","hosts":[{{"ip":"10.0.0.1","port":{}}}],"lastRefTime":42}}"#,
            name, port
        );
        let mut info: ServiceInfo = serde_json::from_str(&raw).unwrap();
        info.json_from_server = raw;
        info
    }

    #[test]
    fn escape_makes_keys_filesystem_safe() {
        assert_eq!(escape_key("g@@s@@c1,c2"), "g%40%40s%40%40c1%2Cc2");
    }

    #[test]
    fn write_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::new(dir.path());

        cache.write(&service("g@@orders", 7000));
        cache.write(&service("g@@billing", 7001));

        let loaded = cache.load_all();
        assert_eq!(loaded.len(), 2);
        let orders = loaded.iter().find(|s| s.name == "g@@orders").unwrap();
        assert_eq!(orders.hosts()[0].port, 7000);
        assert_eq!(orders.last_ref_time, 42);
    }

    #[test]
    fn load_skips_directories_and_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::new(dir.path());

        std::fs::create_dir(dir.path().join("failover")).unwrap();
        std::fs::write(dir.path().join("broken"), "not json").unwrap();
        cache.write(&service("g@@orders", 7000));

        let loaded = cache.load_all();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].name, "g@@orders");
    }

    #[test]
    fn write_survives_missing_raw_payload() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::new(dir.path());

        let mut info = ServiceInfo::new("g@@svc", "");
        info.hosts = Some(vec![Instance::default()]);
        cache.write(&info);

        assert_eq!(cache.load_all().len(), 1);
    }
}
