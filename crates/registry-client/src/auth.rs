//! Access-token management
//!
//! Tokens come from `POST {context_path}/v1/auth/login` and are refreshed
//! shortly before their TTL elapses (one tenth of the TTL before expiry).
//! A refresh that fails on every server is logged and otherwise ignored:
//! requests simply go out untokened and the registry's answer speaks for
//! itself.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Deserialize;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::Config;
use crate::server_list::ServerListResolver;
use crate::transport::{decode_body, CLIENT_VERSION};

const REFRESH_CHECK_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Default)]
struct TokenState {
    token: String,
    ttl: Duration,
    refresh_window: Duration,
    last_refresh: Option<Instant>,
}

impl TokenState {
    /// Refresh when no token was ever loaded, or when the remaining lifetime
    /// has entered the refresh window.
    fn needs_refresh(&self) -> bool {
        match self.last_refresh {
            None => true,
            Some(at) => at.elapsed() >= self.ttl.saturating_sub(self.refresh_window),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginResponse {
    #[serde(default)]
    access_token: String,
    #[serde(default)]
    token_ttl: u64,
}

/// Holds the current access token and keeps it fresh.
pub struct TokenManager {
    http: reqwest::Client,
    config: Arc<Config>,
    state: RwLock<TokenState>,
}

impl TokenManager {
    pub fn new(http: reqwest::Client, config: Arc<Config>) -> Self {
        Self { http, config, state: RwLock::new(TokenState::default()) }
    }

    /// The token to attach to outgoing requests, if one is held.
    pub fn current(&self) -> Option<String> {
        let state = self.state.read();
        if state.token.is_empty() { None } else { Some(state.token.clone()) }
    }

    /// Refresh the token if the guard says so. Never fails the caller.
    pub async fn ensure_fresh(&self, servers: &[String]) -> bool {
        if self.config.username.is_empty() {
            return true;
        }
        if !self.state.read().needs_refresh() {
            return true;
        }
        for server in servers {
            if self.login(server).await {
                return true;
            }
        }
        warn!(servers = servers.len(), "token refresh failed on every server");
        false
    }

    async fn login(&self, server: &str) -> bool {
        let url = format!(
            "{}://{}{}/v1/auth/login",
            self.config.scheme,
            server,
            self.config.base_path()
        );
        let mut params = vec![
            ("username", self.config.username.as_str()),
            ("password", self.config.password.as_str()),
        ];
        if !self.config.namespace.is_empty() {
            params.push(("namespaceId", self.config.namespace.as_str()));
        }

        let resp = self
            .http
            .post(&url)
            .query(&params)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .header("Client-Version", CLIENT_VERSION)
            .send()
            .await;
        let resp = match resp {
            Ok(r) => r,
            Err(e) => {
                debug!(server = %server, error = %e, "login request failed");
                return false;
            }
        };
        let status = resp.status().as_u16();
        let body = match resp.text().await {
            Ok(b) => b,
            Err(e) => {
                debug!(server = %server, error = %e, "login response unreadable");
                return false;
            }
        };
        let envelope = decode_body(status, body);
        if !envelope.ok() {
            debug!(server = %server, code = envelope.code, "login rejected");
            return false;
        }
        let login: LoginResponse = match serde_json::from_str(&envelope.data) {
            Ok(l) => l,
            Err(e) => {
                debug!(server = %server, error = %e, "login payload undecodable");
                return false;
            }
        };
        if login.access_token.is_empty() {
            return false;
        }

        let ttl = Duration::from_secs(login.token_ttl);
        let mut state = self.state.write();
        state.token = login.access_token;
        state.ttl = ttl;
        state.refresh_window = ttl / 10;
        state.last_refresh = Some(Instant::now());
        debug!(server = %server, ttl_secs = login.token_ttl, "access token refreshed");
        true
    }

    /// Background loop re-running the refresh guard every 5 s.
    pub fn spawn_refresh_loop(
        self: Arc<Self>,
        servers: Arc<ServerListResolver>,
        cancel: CancellationToken,
    ) {
        let manager = self;
        tokio::spawn(async move {
            let mut timer = interval(REFRESH_CHECK_INTERVAL);
            timer.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = timer.tick() => {
                        manager.ensure_fresh(&servers.current()).await;
                    }
                }
            }
        });
    }
}
