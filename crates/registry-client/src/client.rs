//! Client construction and lifetime
//!
//! A `Client` owns the HTTP stack, the access-token state, the server-list
//! resolver and the root cancellation token every background task observes.
//! `naming()` wires the naming subsystem on first use.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::auth::TokenManager;
use crate::config::Config;
use crate::error::Result;
use crate::naming::NamingClient;
use crate::server_list::ServerListResolver;
use crate::transport::Transport;

/// Handle to the registry. Create once per process and share.
pub struct Client {
    config: Arc<Config>,
    transport: Arc<Transport>,
    servers: Arc<ServerListResolver>,
    auth: Arc<TokenManager>,
    cancel: CancellationToken,
    naming: tokio::sync::Mutex<Option<NamingClient>>,
}

impl Client {
    /// Validate the configuration and build the shared HTTP stack. No
    /// network traffic happens until a subsystem is requested.
    pub fn new(config: Config) -> Result<Self> {
        let config = Arc::new(config.normalize()?);
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .pool_max_idle_per_host(10)
            .build()?;

        let servers = Arc::new(ServerListResolver::new(http.clone(), Arc::clone(&config)));
        let auth = Arc::new(TokenManager::new(http.clone(), Arc::clone(&config)));
        let transport = Arc::new(Transport::new(
            http,
            Arc::clone(&config),
            Arc::clone(&servers),
            Arc::clone(&auth),
        ));

        Ok(Self {
            config,
            transport,
            servers,
            auth,
            cancel: CancellationToken::new(),
            naming: tokio::sync::Mutex::new(None),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The naming client, created on first call.
    ///
    /// Wiring performs the initial server-list fetch and login, then starts
    /// the refresh loops; later calls return the same instance.
    pub async fn naming(&self) -> Result<NamingClient> {
        let mut slot = self.naming.lock().await;
        if let Some(existing) = slot.as_ref() {
            return Ok(existing.clone());
        }

        if let Err(e) = self.servers.refresh_once().await {
            debug!(error = %e, "initial server-list fetch failed");
        }
        self.auth.ensure_fresh(&self.servers.current()).await;

        let naming = NamingClient::new(Arc::clone(&self.transport), self.cancel.clone())?;
        Arc::clone(&self.servers).spawn(self.cancel.clone());
        Arc::clone(&self.auth).spawn_refresh_loop(Arc::clone(&self.servers), self.cancel.clone());
        *slot = Some(naming.clone());
        Ok(naming)
    }

    /// Cancel every background task. Loops exit on their next tick, in-flight
    /// requests are abandoned and the push socket read returns.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
