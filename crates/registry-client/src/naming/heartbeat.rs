//! Heartbeat scheduling for ephemeral instances
//!
//! One task per descriptor key (`grouped-service#ip#port`), re-armed only
//! after the previous beat's response is processed, so a slow registry
//! backpressures heartbeats instead of piling them up. Re-adding a key
//! cancels the previous task first.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use registry_types::{Instance, Metadata};
use reqwest::Method;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::naming::NAMING_BASE;
use crate::transport::{ApiRequest, Transport};

/// What gets announced with every beat.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BeatInfo {
    /// Grouped service name (`group@@service`)
    pub service_name: String,
    pub cluster: String,
    pub ip: String,
    pub port: u16,
    pub weight: f64,
    pub metadata: Metadata,
    pub scheduled: bool,
    #[serde(serialize_with = "as_millis")]
    pub period: Duration,
}

fn as_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

impl BeatInfo {
    /// Build a descriptor from a registered instance. The period comes from
    /// the instance metadata, defaulting to 5 s.
    pub fn from_instance(grouped_name: impl Into<String>, instance: &Instance) -> Self {
        Self {
            service_name: grouped_name.into(),
            cluster: instance.cluster_name.clone(),
            ip: instance.ip.clone(),
            port: instance.port,
            weight: instance.weight,
            metadata: instance.metadata.clone(),
            scheduled: true,
            period: instance.metadata.heart_beat_interval(),
        }
    }

    pub fn key(&self) -> String {
        beat_key(&self.service_name, &self.ip, self.port)
    }
}

/// Descriptor key: `grouped-service#ip#port`.
pub fn beat_key(grouped_name: &str, ip: &str, port: u16) -> String {
    format!("{}#{}#{}", grouped_name, ip, port)
}

struct BeatHandle {
    cancel: CancellationToken,
}

/// Schedules at most one heartbeat task per descriptor key.
pub struct HeartbeatEngine {
    transport: Arc<Transport>,
    tasks: Mutex<HashMap<String, BeatHandle>>,
    light_beat: AtomicBool,
    cancel: CancellationToken,
}

impl HeartbeatEngine {
    pub fn new(transport: Arc<Transport>, cancel: CancellationToken) -> Self {
        Self {
            transport,
            tasks: Mutex::new(HashMap::new()),
            light_beat: AtomicBool::new(false),
            cancel,
        }
    }

    /// Install a beat task, cancelling any previous task for the same key.
    pub fn add_beat(self: Arc<Self>, beat: BeatInfo) {
        let key = beat.key();
        let token = self.cancel.child_token();
        {
            let mut tasks = self.tasks.lock();
            if let Some(previous) = tasks.insert(key.clone(), BeatHandle { cancel: token.clone() })
            {
                previous.cancel.cancel();
            }
        }
        debug!(key = %key, period_ms = beat.period.as_millis() as u64, "heartbeat scheduled");

        let engine = self;
        tokio::spawn(async move {
            let mut period = beat.period;
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(period) => {
                        period = engine.send_beat(&beat, period).await;
                    }
                }
            }
        });
    }

    /// Cancel and forget the task for a descriptor key, if any.
    pub fn remove_beat(&self, grouped_name: &str, ip: &str, port: u16) {
        let key = beat_key(grouped_name, ip, port);
        if let Some(handle) = self.tasks.lock().remove(&key) {
            handle.cancel.cancel();
            debug!(key = %key, "heartbeat removed");
        }
    }

    /// Refresh descriptors for modified instances that already have a task.
    pub fn update_beats(self: Arc<Self>, hosts: &[Instance]) {
        for host in hosts {
            if !host.ephemeral {
                continue;
            }
            let key = beat_key(&host.service_name, &host.ip, host.port);
            if self.tasks.lock().contains_key(&key) {
                Arc::clone(&self)
                    .add_beat(BeatInfo::from_instance(host.service_name.clone(), host));
            }
        }
    }

    pub fn scheduled_count(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Send one beat and return the period for the next tick.
    async fn send_beat(&self, beat: &BeatInfo, previous: Duration) -> Duration {
        let mut req = ApiRequest::new(Method::PUT, format!("{}/instance/beat", NAMING_BASE))
            .param("serviceName", beat.service_name.clone())
            .param("clusterName", beat.cluster.clone())
            .param("ip", beat.ip.clone())
            .param("port", beat.port.to_string());
        if !self.light_beat.load(Ordering::Relaxed) {
            let body = match serde_json::to_string(beat) {
                Ok(json) => json,
                Err(e) => {
                    warn!(key = %beat.key(), error = %e, "beat descriptor not serializable");
                    return previous;
                }
            };
            req = req.form_body([("beat", body.as_str())]);
        }

        let resp = match self.transport.do_request(req).await {
            Ok(resp) => resp,
            Err(e) => {
                // Keep ticking; the registry may come back.
                warn!(key = %beat.key(), error = %e, "heartbeat failed");
                return previous;
            }
        };

        if resp.ok() {
            let Ok(reply) = serde_json::from_str::<serde_json::Value>(&resp.data) else {
                return previous;
            };
            if let Some(light) = reply.get("lightBeatEnabled").and_then(|v| v.as_bool()) {
                self.light_beat.store(light, Ordering::Relaxed);
            }
            if let Some(millis) = reply.get("clientBeatInterval").and_then(|v| v.as_u64()) {
                return Duration::from_millis(millis);
            }
            return previous;
        }

        if resp.code == 20404 && self.transport.config().reregister_on_not_found {
            info!(key = %beat.key(), "instance unknown to registry, re-registering");
            self.reregister(beat).await;
        } else {
            warn!(key = %beat.key(), code = resp.code, "heartbeat rejected");
        }
        previous
    }

    /// Rebuild an ephemeral registration from the descriptor after a 20404.
    async fn reregister(&self, beat: &BeatInfo) {
        let group = beat
            .service_name
            .split_once(registry_types::SERVICE_INFO_SEPARATOR)
            .map(|(g, _)| g)
            .unwrap_or_default();
        let req = ApiRequest::new(Method::POST, format!("{}/instance", NAMING_BASE))
            .param("serviceName", beat.service_name.clone())
            .param("groupName", group)
            .param("clusterName", beat.cluster.clone())
            .param("ip", beat.ip.clone())
            .param("port", beat.port.to_string())
            .param("weight", format!("{:.2}", beat.weight))
            .param("enable", "true")
            .param("healthy", "true")
            .param("ephemeral", "true")
            .param("metadata", beat.metadata.encode());
        if let Err(e) = self.transport.call(req).await {
            warn!(key = %beat.key(), error = %e, "re-registration failed");
        }
    }
}
