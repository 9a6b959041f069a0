//! Registry server-list resolution
//!
//! A static `hosts` configuration is returned as-is and never refreshed. In
//! endpoint mode the address server is asked for the current list once at
//! startup and every 30 s after; a failed or empty fetch keeps the previous
//! list.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::transport::{decode_body, CLIENT_VERSION};

const ENDPOINT_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

/// Provides the current registry endpoints.
pub struct ServerListResolver {
    config: Arc<Config>,
    http: reqwest::Client,
    from_endpoint: RwLock<Vec<String>>,
}

impl ServerListResolver {
    pub fn new(http: reqwest::Client, config: Arc<Config>) -> Self {
        Self { config, http, from_endpoint: RwLock::new(Vec::new()) }
    }

    /// The list requests should rotate over right now.
    pub fn current(&self) -> Vec<String> {
        if !self.config.hosts.is_empty() {
            return self.config.hosts.clone();
        }
        self.from_endpoint.read().clone()
    }

    /// Fetch the list from the address server and swap it in atomically.
    ///
    /// No-op with a static host list. Errors leave the previous list intact.
    pub async fn refresh_once(&self) -> Result<()> {
        if !self.config.hosts.is_empty() {
            return Ok(());
        }
        let url = format!("http://{}/nacos/serverlist", self.config.endpoint);
        let resp = self
            .http
            .get(&url)
            .header("Client-Version", CLIENT_VERSION)
            .send()
            .await?;
        let status = resp.status().as_u16();
        let body = resp.text().await?;
        let envelope = decode_body(status, body);
        if !envelope.ok() {
            return Err(Error::Protocol(format!(
                "address server {} returned code {}",
                self.config.endpoint, envelope.code
            )));
        }

        let servers: Vec<String> = envelope
            .data
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();
        if servers.is_empty() {
            return Err(Error::Protocol(format!(
                "address server {} returned an empty list",
                self.config.endpoint
            )));
        }

        debug!(count = servers.len(), "server list refreshed from endpoint");
        *self.from_endpoint.write() = servers;
        Ok(())
    }

    /// Background refresh loop for endpoint mode.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) {
        if !self.config.hosts.is_empty() {
            return;
        }
        let resolver = self;
        info!(endpoint = %resolver.config.endpoint, "starting server-list refresh task");
        tokio::spawn(async move {
            let mut timer = interval(ENDPOINT_REFRESH_INTERVAL);
            timer.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = timer.tick() => {
                        if let Err(e) = resolver.refresh_once().await {
                            error!(error = %e, "server-list refresh failed, keeping previous list");
                        }
                    }
                }
            }
        });
    }
}
