//! Naming subsystem
//!
//! The facade over discovery, registration, subscription and the service CRUD
//! surface, plus the background machinery it wires together: the service-info
//! cache, heartbeat engine, UDP push receiver, change dispatcher and failover
//! store.

pub mod cache;
pub mod disk;
pub mod dispatcher;
pub mod failover;
pub mod heartbeat;
pub mod push;

use std::sync::Arc;

use registry_types::{
    grouped_service_name, service_info_key, Instance, Service, ServiceInfo, ServiceList,
    DEFAULT_CLUSTER, DEFAULT_GROUP,
};
use reqwest::Method;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::Result;
use crate::transport::{local_ip, ApiRequest, ApiResponse, Transport};

pub use dispatcher::EventListener;

use cache::ServiceInfoCache;
use disk::DiskCache;
use dispatcher::ChangeDispatcher;
use failover::FailoverStore;
use heartbeat::{BeatInfo, HeartbeatEngine};
use push::PushReceiver;

pub(crate) const NAMING_BASE: &str = "/v1/ns";

/// Instance discovery query.
#[derive(Debug, Clone, Default)]
pub struct InstanceQuery {
    pub service_name: String,
    pub group_name: String,
    pub clusters: Vec<String>,
    /// Read through the cache (and keep it warm) instead of asking the
    /// registry directly.
    pub subscribe: bool,
    pub healthy_only: bool,
}

/// Service catalog query.
#[derive(Debug, Clone, Default)]
pub struct ServiceQuery {
    pub page: i64,
    pub size: i64,
    pub group_name: String,
    pub service_name: String,
}

/// Selector attached to service definitions.
#[derive(Debug, Clone, Serialize)]
pub struct Selector {
    #[serde(rename = "type")]
    pub kind: String,
}

impl Selector {
    pub fn none() -> Self {
        Self { kind: "none".to_string() }
    }

    pub fn label() -> Self {
        Self { kind: "label".to_string() }
    }
}

/// Options for the service CRUD surface.
#[derive(Debug, Clone, Default)]
pub struct ServiceOptions {
    pub service_name: String,
    pub group_name: String,
    pub protect_threshold: f64,
    pub metadata: Option<registry_types::Metadata>,
    pub selector: Option<Selector>,
}

struct NamingInner {
    transport: Arc<Transport>,
    cache: Arc<ServiceInfoCache>,
    heartbeat: Arc<HeartbeatEngine>,
    dispatcher: Arc<ChangeDispatcher>,
    failover: Arc<FailoverStore>,
    push: Arc<PushReceiver>,
    cancel: CancellationToken,
}

/// Client to the registry naming API.
#[derive(Clone)]
pub struct NamingClient {
    inner: Arc<NamingInner>,
}

impl NamingClient {
    /// Wire the naming subsystem and start its background tasks.
    pub(crate) fn new(transport: Arc<Transport>, cancel: CancellationToken) -> Result<Self> {
        let config = Arc::clone(transport.config());

        let dispatcher = Arc::new(ChangeDispatcher::new(cancel.clone()));
        let heartbeat = Arc::new(HeartbeatEngine::new(Arc::clone(&transport), cancel.clone()));
        let cache = Arc::new(ServiceInfoCache::new(
            DiskCache::new(config.cache_dir.clone()),
            Arc::clone(&heartbeat),
            Arc::clone(&dispatcher),
        ));
        cache.warm_start();

        let failover = Arc::new(FailoverStore::new(&config.cache_dir, Arc::clone(&cache))?);
        Arc::clone(&failover).spawn(cancel.clone());

        let push = Arc::new(PushReceiver::new(Arc::clone(&cache)));
        Arc::clone(&push).spawn(config.push_host.clone(), cancel.clone());

        info!(namespace = %config.namespace, "naming client started");
        Ok(Self {
            inner: Arc::new(NamingInner {
                transport,
                cache,
                heartbeat,
                dispatcher,
                failover,
                push,
                cancel,
            }),
        })
    }

    fn request(&self, method: Method, path: &str) -> ApiRequest {
        ApiRequest::new(method, format!("{}{}", NAMING_BASE, path))
    }

    /// Register an endpoint under a service. Ephemeral instances get a
    /// heartbeat installed on success.
    pub async fn register_instance(&self, instance: &Instance) -> Result<ApiResponse> {
        let group = non_empty_or(&instance.group_name, DEFAULT_GROUP);
        let cluster = non_empty_or(&instance.cluster_name, DEFAULT_CLUSTER);
        let grouped = grouped_service_name(group, &instance.service_name);

        // Client-wide default metadata, with per-instance values winning.
        let mut effective = instance.clone();
        for (key, value) in &self.inner.transport.config().metadata {
            if !effective.metadata.contains(key) {
                effective.metadata.insert(key.clone(), value.clone());
            }
        }

        let req = self
            .request(Method::POST, "/instance")
            .param("serviceName", grouped.clone())
            .param("groupName", group)
            .param("clusterName", cluster)
            .param("ip", effective.ip.clone())
            .param("port", effective.port.to_string())
            .param("weight", format!("{:.2}", effective.weight))
            .param("enable", effective.enabled.to_string())
            .param("healthy", effective.healthy.to_string())
            .param("ephemeral", effective.ephemeral.to_string())
            .param("metadata", effective.metadata.encode());
        let resp = self.inner.transport.call(req).await?;

        if effective.ephemeral {
            Arc::clone(&self.inner.heartbeat)
                .add_beat(BeatInfo::from_instance(grouped, &effective));
        }
        Ok(resp)
    }

    /// Remove an endpoint. The heartbeat goes first so the registry does not
    /// see beats for an instance it just forgot.
    pub async fn deregister_instance(
        &self,
        service_name: &str,
        group_name: &str,
        cluster_name: &str,
        ip: &str,
        port: u16,
        ephemeral: bool,
    ) -> Result<ApiResponse> {
        let group = non_empty_or(group_name, DEFAULT_GROUP);
        let grouped = grouped_service_name(group, service_name);
        if ephemeral {
            self.inner.heartbeat.remove_beat(&grouped, ip, port);
        }

        let req = self
            .request(Method::DELETE, "/instance")
            .param("serviceName", grouped)
            .param("groupName", group)
            .param("clusterName", non_empty_or(cluster_name, DEFAULT_CLUSTER))
            .param("ip", ip)
            .param("port", port.to_string())
            .param("ephemeral", ephemeral.to_string());
        self.inner.transport.call(req).await
    }

    /// Discover the instances of a service.
    pub async fn select_instances(&self, query: InstanceQuery) -> Result<Vec<Instance>> {
        let clusters = if query.clusters.is_empty() {
            DEFAULT_CLUSTER.to_string()
        } else {
            query.clusters.join(",")
        };
        let group = non_empty_or(&query.group_name, DEFAULT_GROUP);
        let grouped = grouped_service_name(group, &query.service_name);

        let service = if query.subscribe {
            self.get_service_info(&grouped, &clusters).await?
        } else {
            self.query_from_server(&grouped, &clusters, query.healthy_only).await?
        };
        Ok(service.map(|s| s.hosts().to_vec()).unwrap_or_default())
    }

    /// Subscribe a listener to changes of a service's endpoint set.
    pub async fn subscribe(
        &self,
        service_name: &str,
        group_name: &str,
        clusters: &[&str],
        listener: Arc<dyn EventListener>,
    ) -> Result<()> {
        let group = non_empty_or(group_name, DEFAULT_GROUP);
        let grouped = grouped_service_name(group, service_name);
        let clusters = clusters.join(",");
        // Prime the cache so the key is polled and pushed from now on.
        if let Err(e) = self.get_service_info(&grouped, &clusters).await {
            warn!(service = %grouped, error = %e, "subscription priming fetch failed");
        }
        self.inner.dispatcher.add_listener(service_info_key(&grouped, &clusters), listener);
        Ok(())
    }

    /// Remove a previously subscribed listener.
    pub fn unsubscribe(
        &self,
        service_name: &str,
        group_name: &str,
        clusters: &[&str],
        listener: &Arc<dyn EventListener>,
    ) {
        let group = non_empty_or(group_name, DEFAULT_GROUP);
        let grouped = grouped_service_name(group, service_name);
        self.inner
            .dispatcher
            .remove_listener(&service_info_key(&grouped, &clusters.join(",")), listener);
    }

    /// Cached read of a service, fetching once on miss. In failover mode the
    /// disk snapshot map is authoritative.
    async fn get_service_info(
        &self,
        grouped_name: &str,
        clusters: &str,
    ) -> Result<Option<Arc<ServiceInfo>>> {
        let key = service_info_key(grouped_name, clusters);
        if self.inner.failover.is_enabled() {
            return Ok(self.inner.failover.get(&key));
        }
        if let Some(service) = self.inner.cache.get(&key) {
            return Ok(Some(service));
        }
        let resp = self
            .query_list(grouped_name, clusters, self.inner.push.port(), false)
            .await?;
        self.inner.cache.process_payload(&resp.data).await;
        Ok(self.inner.cache.get(&key))
    }

    /// Uncached `/instance/list` query.
    async fn query_from_server(
        &self,
        grouped_name: &str,
        clusters: &str,
        healthy_only: bool,
    ) -> Result<Option<Arc<ServiceInfo>>> {
        let resp = self.query_list(grouped_name, clusters, 0, healthy_only).await?;
        let service: ServiceInfo = resp.body_to()?;
        Ok(Some(Arc::new(service)))
    }

    async fn query_list(
        &self,
        grouped_name: &str,
        clusters: &str,
        udp_port: u16,
        healthy_only: bool,
    ) -> Result<ApiResponse> {
        let req = self
            .request(Method::GET, "/instance/list")
            .param("serviceName", grouped_name)
            .param("clusters", clusters)
            .param("udpPort", udp_port.to_string())
            .param("clientIP", local_ip())
            .param("healthyOnly", healthy_only.to_string());
        self.inner.transport.call(req).await
    }

    /// Page through the service catalog.
    pub async fn select_services(&self, query: ServiceQuery) -> Result<ServiceList> {
        let page = if query.page <= 0 { 1 } else { query.page };
        let size = if query.size <= 0 { 10 } else { query.size };
        let mut req = self
            .request(Method::GET, "/service/list")
            .param("pageNo", page.to_string())
            .param("pageSize", size.to_string())
            .param("groupName", non_empty_or(&query.group_name, DEFAULT_GROUP));
        if !query.service_name.is_empty() {
            req.set_param("serviceName", query.service_name.clone());
        }
        self.inner.transport.do_request(req).await?.body_to()
    }

    /// Fetch one service definition.
    pub async fn select_service(&self, query: ServiceQuery) -> Result<Service> {
        let mut req = self
            .request(Method::GET, "/service")
            .param("groupName", non_empty_or(&query.group_name, DEFAULT_GROUP));
        if !query.service_name.is_empty() {
            req.set_param("serviceName", query.service_name.clone());
        }
        self.inner.transport.do_request(req).await?.body_to()
    }

    pub async fn create_service(&self, options: ServiceOptions) -> Result<ApiResponse> {
        self.service_mutation(Method::POST, options).await
    }

    pub async fn update_service(&self, options: ServiceOptions) -> Result<ApiResponse> {
        self.service_mutation(Method::PUT, options).await
    }

    pub async fn delete_service(&self, options: ServiceOptions) -> Result<ApiResponse> {
        self.service_mutation(Method::DELETE, options).await
    }

    async fn service_mutation(
        &self,
        method: Method,
        options: ServiceOptions,
    ) -> Result<ApiResponse> {
        if options.service_name.is_empty() {
            return Err(crate::error::Error::Config("service_name is required".to_string()));
        }
        let selector = options.selector.unwrap_or_else(Selector::none);
        let mut form = vec![
            ("serviceName".to_string(), options.service_name),
            (
                "groupName".to_string(),
                non_empty_or(&options.group_name, DEFAULT_GROUP).to_string(),
            ),
            ("protectThreshold".to_string(), format!("{:.2}", options.protect_threshold)),
            ("selector".to_string(), serde_json::to_string(&selector)?),
        ];
        if let Some(metadata) = &options.metadata {
            form.push(("metadata".to_string(), metadata.encode()));
        }
        let req = self.request(method, "/service").form_body(form);
        self.inner.transport.call(req).await
    }

    /// Stop every background task owned by the client.
    pub fn shutdown(&self) {
        info!("naming client shutting down");
        self.inner.cancel.cancel();
    }

    /// The UDP port the registry should push updates to.
    pub fn push_port(&self) -> u16 {
        self.inner.push.port()
    }
}

fn non_empty_or<'a>(value: &'a str, fallback: &'a str) -> &'a str {
    if value.is_empty() { fallback } else { value }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_serializes_its_kind() {
        assert_eq!(serde_json::to_string(&Selector::none()).unwrap(), r#"{"type":"none"}"#);
    }

    #[test]
    fn non_empty_or_prefers_value() {
        assert_eq!(non_empty_or("", DEFAULT_GROUP), DEFAULT_GROUP);
        assert_eq!(non_empty_or("g", DEFAULT_GROUP), "g");
    }
}
