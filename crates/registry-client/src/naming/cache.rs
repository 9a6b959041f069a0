//! Service-info cache with diff-and-notify
//!
//! Both producers (discovery polls and UDP pushes) land in `process_payload`,
//! the single merge path. Entries are replaced whole under the write lock, so
//! readers observe either the pre- or the post-merge snapshot, never a
//! partial merge. `last_ref_time` never goes backwards for a key.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use registry_types::{Instance, ServiceInfo};
use tracing::{debug, info, warn};

use crate::naming::disk::DiskCache;
use crate::naming::dispatcher::ChangeDispatcher;
use crate::naming::heartbeat::HeartbeatEngine;

#[derive(Debug, Default)]
struct HostDiff {
    added: Vec<Instance>,
    removed: Vec<Instance>,
    modified: Vec<Instance>,
}

impl HostDiff {
    fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty()
    }
}

/// Diff two host sets keyed by `ip:port`.
fn diff_hosts(old: &[Instance], new: &[Instance]) -> HostDiff {
    let old_map: HashMap<String, &Instance> = old.iter().map(|h| (h.addr(), h)).collect();
    let new_map: HashMap<String, &Instance> = new.iter().map(|h| (h.addr(), h)).collect();

    let mut diff = HostDiff::default();
    for (addr, host) in &new_map {
        match old_map.get(addr) {
            None => diff.added.push((*host).clone()),
            Some(previous) if *host != *previous => diff.modified.push((*host).clone()),
            Some(_) => {}
        }
    }
    for (addr, host) in &old_map {
        if !new_map.contains_key(addr) {
            diff.removed.push((*host).clone());
        }
    }
    diff
}

/// In-memory map of service key to the latest snapshot.
pub struct ServiceInfoCache {
    entries: RwLock<HashMap<String, Arc<ServiceInfo>>>,
    disk: DiskCache,
    heartbeat: Arc<HeartbeatEngine>,
    dispatcher: Arc<ChangeDispatcher>,
}

impl ServiceInfoCache {
    pub fn new(
        disk: DiskCache,
        heartbeat: Arc<HeartbeatEngine>,
        dispatcher: Arc<ChangeDispatcher>,
    ) -> Self {
        Self { entries: RwLock::new(HashMap::new()), disk, heartbeat, dispatcher }
    }

    /// Load the previous run's snapshots from disk, without events.
    pub fn warm_start(&self) {
        let snapshots = self.disk.load_all();
        if snapshots.is_empty() {
            return;
        }
        let mut entries = self.entries.write();
        for service in snapshots {
            entries.insert(service.key(), Arc::new(service));
        }
        info!(count = entries.len(), "cache warmed from disk");
    }

    pub fn get(&self, key: &str) -> Option<Arc<ServiceInfo>> {
        self.entries.read().get(key).cloned()
    }

    pub fn snapshot(&self) -> HashMap<String, Arc<ServiceInfo>> {
        self.entries.read().clone()
    }

    /// Merge one raw registry payload into the cache.
    ///
    /// Returns the entry now cached for the payload's key: the new snapshot
    /// when it was accepted, the previous one when the payload was stale or
    /// structurally invalid.
    pub async fn process_payload(&self, raw: &str) -> Option<Arc<ServiceInfo>> {
        let mut incoming: ServiceInfo = match serde_json::from_str(raw) {
            Ok(service) => service,
            Err(e) => {
                warn!(error = %e, "undecodable service payload");
                return None;
            }
        };
        incoming.json_from_server = raw.to_string();
        let key = incoming.key();

        let (current, diff, first_seen) = {
            let mut entries = self.entries.write();
            let old = entries.get(&key).cloned();
            if incoming.hosts.is_none() || !incoming.validate() {
                return old;
            }
            if let Some(old) = &old {
                if old.last_ref_time > incoming.last_ref_time {
                    debug!(
                        key = %key,
                        cached = old.last_ref_time,
                        pushed = incoming.last_ref_time,
                        "ignoring stale service payload"
                    );
                    return Some(Arc::clone(old));
                }
            }
            let diff = match &old {
                Some(old) => diff_hosts(old.hosts(), incoming.hosts()),
                None => HostDiff { added: incoming.hosts().to_vec(), ..HostDiff::default() },
            };
            let current = Arc::new(incoming);
            entries.insert(key.clone(), Arc::clone(&current));
            (current, diff, old.is_none())
        };

        if first_seen || !diff.is_empty() {
            info!(
                key = %key,
                added = diff.added.len(),
                removed = diff.removed.len(),
                modified = diff.modified.len(),
                "service updated"
            );
            self.disk.write(&current);
            if !diff.modified.is_empty() {
                Arc::clone(&self.heartbeat).update_beats(&diff.modified);
            }
            self.dispatcher.publish(Arc::clone(&current)).await;
        }
        Some(current)
    }
}
