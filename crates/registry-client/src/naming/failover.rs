//! Disk-backed failover
//!
//! A switch file under `{cache_dir}/failover` redirects all service reads to
//! snapshots previously written there. The store keeps the snapshots fresh
//! with a slow background writer and polls the switch file for changes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::{Mutex, RwLock};
use registry_types::ServiceInfo;
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::naming::cache::ServiceInfoCache;
use crate::naming::disk::escape_key;

/// Name of the switch file; `"1"` inside enables failover mode.
pub const FAILOVER_SWITCH_FILE: &str = "00-00---000-VIPSRV_FAILOVER_SWITCH-000---00-00";

const SWITCH_CHECK_INTERVAL: Duration = Duration::from_secs(5);
const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);
const SNAPSHOT_INITIAL_DELAY: Duration = Duration::from_secs(30 * 60);
const SNAPSHOT_STARTUP_CHECK: Duration = Duration::from_secs(10);

/// Internal bookkeeping entries that never belong in a failover snapshot.
fn is_reserved(service: &ServiceInfo) -> bool {
    service.key() == "000--00-ALL_IPS--00--000"
        || matches!(
            service.name.as_str(),
            "envList"
                | "00-00---000-ENV_CONFIGS-000---00-00"
                | "vipclient.properties"
                | "00-00---000-ALL_HOSTS-000---00-00"
        )
}

/// Read-only fallback store, activated by the switch file.
pub struct FailoverStore {
    dir: PathBuf,
    cache: Arc<ServiceInfoCache>,
    enabled: AtomicBool,
    services: RwLock<HashMap<String, Arc<ServiceInfo>>>,
    last_switch_mtime: Mutex<Option<SystemTime>>,
}

impl FailoverStore {
    pub fn new(cache_dir: &Path, cache: Arc<ServiceInfoCache>) -> std::io::Result<Self> {
        let dir = cache_dir.join("failover");
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            cache,
            enabled: AtomicBool::new(false),
            services: RwLock::new(HashMap::new()),
            last_switch_mtime: Mutex::new(None),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn get(&self, key: &str) -> Option<Arc<ServiceInfo>> {
        self.services.read().get(key).cloned()
    }

    /// One iteration of the switch watcher: stat the switch file, and when
    /// its mtime moved, re-read it and flip the mode.
    pub fn check_switch_once(&self) {
        let path = self.dir.join(FAILOVER_SWITCH_FILE);
        let metadata = match std::fs::metadata(&path) {
            Ok(m) => m,
            Err(_) => {
                self.enabled.store(false, Ordering::Relaxed);
                return;
            }
        };
        let mtime = metadata.modified().ok();
        {
            let mut last = self.last_switch_mtime.lock();
            if *last == mtime && mtime.is_some() {
                return;
            }
            *last = mtime;
        }

        let content = std::fs::read_to_string(&path).unwrap_or_default();
        if content.trim() == "1" {
            self.reload_snapshots();
            self.enabled.store(true, Ordering::Relaxed);
            info!("failover mode enabled, serving reads from disk snapshots");
        } else {
            self.enabled.store(false, Ordering::Relaxed);
            info!("failover mode disabled");
        }
    }

    /// Load every snapshot file next to the switch into the failover map.
    fn reload_snapshots(&self) {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %self.dir.display(), error = %e, "failover dir unreadable");
                return;
            }
        };
        let mut loaded = HashMap::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file()
                || path.file_name().and_then(|n| n.to_str()) == Some(FAILOVER_SWITCH_FILE)
            {
                continue;
            }
            let Ok(raw) = std::fs::read_to_string(&path) else { continue };
            match serde_json::from_str::<ServiceInfo>(&raw) {
                Ok(mut service) => {
                    service.json_from_server = raw;
                    loaded.insert(service.key(), Arc::new(service));
                }
                Err(e) => warn!(path = %path.display(), error = %e, "failover snapshot undecodable"),
            }
        }
        info!(count = loaded.len(), "failover snapshots loaded");
        *self.services.write() = loaded;
    }

    /// Serialize the live cache into the failover directory, one file per
    /// service, skipping reserved bookkeeping keys.
    pub fn write_snapshots(&self) {
        for (key, service) in self.cache.snapshot() {
            if is_reserved(service.as_ref()) {
                continue;
            }
            let data = if service.json_from_server.is_empty() {
                match serde_json::to_string(service.as_ref()) {
                    Ok(s) => s,
                    Err(_) => continue,
                }
            } else {
                service.json_from_server.clone()
            };
            let path = self.dir.join(escape_key(&key));
            if let Err(e) = std::fs::write(&path, data) {
                warn!(path = %path.display(), error = %e, "failover snapshot write failed");
            }
        }
        debug!(dir = %self.dir.display(), "failover snapshots written");
    }

    fn snapshot_dir_is_empty(&self) -> bool {
        match std::fs::read_dir(&self.dir) {
            Ok(mut entries) => entries.next().is_none(),
            Err(_) => false,
        }
    }

    /// Start the switch watcher and the snapshot writer.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) {
        let store = Arc::clone(&self);
        let watcher_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(SWITCH_CHECK_INTERVAL);
            timer.tick().await;
            loop {
                tokio::select! {
                    _ = watcher_cancel.cancelled() => return,
                    _ = timer.tick() => store.check_switch_once(),
                }
            }
        });

        let store = self;
        tokio::spawn(async move {
            let mut day = interval_at(Instant::now() + SNAPSHOT_INTERVAL, SNAPSHOT_INTERVAL);
            let startup_check = tokio::time::sleep(SNAPSHOT_STARTUP_CHECK);
            let initial_write = tokio::time::sleep(SNAPSHOT_INITIAL_DELAY);
            tokio::pin!(startup_check);
            tokio::pin!(initial_write);
            let mut startup_done = false;
            let mut initial_done = false;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = &mut startup_check, if !startup_done => {
                        startup_done = true;
                        if store.snapshot_dir_is_empty() {
                            store.write_snapshots();
                        }
                    }
                    _ = &mut initial_write, if !initial_done => {
                        initial_done = true;
                        store.write_snapshots();
                    }
                    _ = day.tick() => store.write_snapshots(),
                }
            }
        });
    }
}
