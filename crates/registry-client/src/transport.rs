//! HTTP request layer
//!
//! Builds registry requests (identification headers, namespace/token/app
//! query injection, optional AK/SK signing), rotates across the resolved
//! server list on transport failures, and normalizes response bodies into the
//! `{code, data, message}` envelope the registry speaks.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use reqwest::Method;
use serde::de::DeserializeOwned;
use sha1::Sha1;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::auth::TokenManager;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::server_list::ServerListResolver;

pub(crate) const CLIENT_VERSION: &str = concat!("registry-client/", env!("CARGO_PKG_VERSION"));

/// A request against the registry HTTP surface.
///
/// `path` is relative to the configured context path. Query parameters are
/// kept sorted so retries and signatures see a stable encoding.
#[derive(Debug)]
pub struct ApiRequest {
    pub(crate) method: Method,
    pub(crate) path: String,
    pub(crate) params: BTreeMap<String, String>,
    pub(crate) body: Option<String>,
    pub(crate) timeout: Option<Duration>,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self { method, path: path.into(), params: BTreeMap::new(), body: None, timeout: None }
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn set_param(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.params.insert(key.into(), value.into());
    }

    /// Form-encode `pairs` into the request body.
    pub fn form_body<I, K, V>(mut self, pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut ser = url::form_urlencoded::Serializer::new(String::new());
        for (k, v) in pairs {
            ser.append_pair(k.as_ref(), v.as_ref());
        }
        self.body = Some(ser.finish());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Normalized registry response.
#[derive(Debug, Clone, Default)]
pub struct ApiResponse {
    pub code: i64,
    pub data: String,
    pub message: String,
}

impl ApiResponse {
    /// Success codes the registry uses interchangeably.
    pub fn ok(&self) -> bool {
        self.code == 0 || self.code == 200
    }

    /// Deserialize `data` into a typed payload.
    pub fn body_to<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_str(&self.data).map_err(Error::from)
    }

    /// Promote a non-success response into an error.
    pub fn into_result(self) -> Result<ApiResponse> {
        if self.ok() {
            Ok(self)
        } else {
            Err(Error::Api { code: self.code, message: self.message })
        }
    }
}

/// Parse a raw body into the `{code, data, message}` envelope.
///
/// A body without a `code` field is normalized through the HTTP status:
/// success puts the raw body into `data`, failure into `message`. Non-string
/// `data`/`message` values are re-serialized so callers always see text.
pub(crate) fn decode_body(status: u16, body: String) -> ApiResponse {
    if let Ok(serde_json::Value::Object(map)) = serde_json::from_str::<serde_json::Value>(&body) {
        if let Some(code) = map.get("code").and_then(serde_json::Value::as_i64) {
            let text = |key: &str| {
                map.get(key)
                    .map(|v| match v {
                        serde_json::Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .unwrap_or_default()
            };
            return ApiResponse { code, data: text("data"), message: text("message") };
        }
    }
    let code = i64::from(status);
    if (200..300).contains(&status) {
        ApiResponse { code, data: body, message: String::new() }
    } else {
        ApiResponse { code, message: body, data: String::new() }
    }
}

/// Shared HTTP layer for all registry calls.
pub struct Transport {
    http: reqwest::Client,
    config: Arc<Config>,
    servers: Arc<ServerListResolver>,
    auth: Arc<TokenManager>,
}

impl Transport {
    pub fn new(
        http: reqwest::Client,
        config: Arc<Config>,
        servers: Arc<ServerListResolver>,
        auth: Arc<TokenManager>,
    ) -> Self {
        Self { http, config, servers, auth }
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn servers(&self) -> &Arc<ServerListResolver> {
        &self.servers
    }

    /// Execute a request, rotating across the current server list.
    ///
    /// Only transport failures move on to the next host; any HTTP response,
    /// success or not, is returned to the caller. With every host down the
    /// last failure surfaces as [`Error::AllHostsExhausted`].
    pub async fn do_request(&self, mut req: ApiRequest) -> Result<ApiResponse> {
        let servers = self.servers.current();
        self.auth.ensure_fresh(&servers).await;
        self.prepare(&mut req);

        if servers.is_empty() {
            return Err(Error::NoHosts);
        }
        if servers.len() == 1 {
            return self.send_once(&servers[0], &req).await;
        }

        let start = (unix_nanos() % servers.len() as u128) as usize;
        let mut last_err: Option<reqwest::Error> = None;
        for i in 0..servers.len() {
            let host = &servers[(start + i) % servers.len()];
            match self.send_once(host, &req).await {
                Ok(resp) => return Ok(resp),
                Err(Error::Transport(e)) => {
                    warn!(host = %host, path = %req.path, error = %e, "registry host failed, rotating");
                    last_err = Some(e);
                }
                Err(other) => return Err(other),
            }
        }
        match last_err {
            Some(source) => Err(Error::AllHostsExhausted { path: req.path, source }),
            None => Err(Error::NoHosts),
        }
    }

    /// `do_request` and treat non-success envelopes as errors.
    pub async fn call(&self, req: ApiRequest) -> Result<ApiResponse> {
        self.do_request(req).await?.into_result()
    }

    fn prepare(&self, req: &mut ApiRequest) {
        if !self.config.namespace.is_empty() {
            req.set_param("namespaceId", self.config.namespace.clone());
        }
        if let Some(token) = self.auth.current() {
            req.set_param("accessToken", token);
        }
        if self.config.app_name.is_empty() {
            req.set_param("app", "unknown");
        } else {
            req.set_param("app", self.config.app_name.clone());
        }
        if !self.config.access_key.is_empty() && !self.config.secret_key.is_empty() {
            let sign_data = build_sign_data(req.params.get("serviceName").map(String::as_str));
            let signature = sign(&self.config.secret_key, &sign_data);
            req.set_param("signature", signature);
            req.set_param("data", sign_data);
            req.set_param("ak", self.config.access_key.clone());
        }
    }

    async fn send_once(&self, host: &str, req: &ApiRequest) -> Result<ApiResponse> {
        let url = format!(
            "{}://{}{}{}",
            self.config.scheme,
            host,
            self.config.base_path(),
            req.path
        );
        let mut builder = self
            .http
            .request(req.method.clone(), &url)
            .query(&req.params)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .header("Client-Version", CLIENT_VERSION)
            .header("User-Agent", CLIENT_VERSION)
            .header("Accept-Encoding", "gzip,deflate,sdch")
            .header("Connection", "Keep-Alive")
            .header("RequestId", Uuid::new_v4().to_string())
            .header("Request-Module", "Naming");
        if let Some(body) = &req.body {
            builder = builder.body(body.clone());
        }
        if let Some(timeout) = req.timeout {
            builder = builder.timeout(timeout);
        }

        let resp = builder.send().await?;
        let status = resp.status().as_u16();
        let body = resp.text().await?;
        debug!(url = %url, status, "registry response");
        Ok(decode_body(status, body))
    }
}

/// Data covered by the request signature: the unix time, joined with the
/// grouped service name when the request carries one.
fn build_sign_data(service_name: Option<&str>) -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    match service_name {
        Some(name) if !name.is_empty() => format!("{}@@{}", now, name),
        _ => now.to_string(),
    }
}

fn sign(secret_key: &str, sign_data: &str) -> String {
    let mut mac = Hmac::<Sha1>::new_from_slice(secret_key.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(sign_data.as_bytes());
    BASE64.encode(mac.finalize().into_bytes())
}

fn unix_nanos() -> u128 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_nanos()).unwrap_or_default()
}

/// Best-effort local IPv4 discovery, reported to the registry so pushes can
/// reach this process. Falls back to loopback when no route is available.
pub(crate) fn local_ip() -> String {
    std::net::UdpSocket::bind("0.0.0.0:0")
        .and_then(|sock| {
            sock.connect("8.8.8.8:53")?;
            sock.local_addr()
        })
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|_| "127.0.0.1".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_data_joins_time_and_service_name() {
        assert!(build_sign_data(None).parse::<u64>().is_ok());
        let data = build_sign_data(Some("s"));
        assert!(data.ends_with("@@s"));
        assert!(data.split("@@").next().unwrap().parse::<u64>().is_ok());
    }

    #[test]
    fn signature_matches_known_vector() {
        // HMAC-SHA1("k", "1700000000@@s"), base64-encoded
        assert_eq!(sign("k", "1700000000@@s"), "Um6ePHhA0CLugNUm8UDYwszdNv4=");
        // HMAC-SHA1("secret", "1700000000")
        assert_eq!(sign("secret", "1700000000"), "WGw37+g43pfwVUmrc9tgArn/juE=");
    }

    #[test]
    fn decode_reads_envelope_fields() {
        let resp = decode_body(200, r#"{"code":0,"data":"[]","message":"ok"}"#.to_string());
        assert_eq!(resp.code, 0);
        assert_eq!(resp.data, "[]");
        assert_eq!(resp.message, "ok");
        assert!(resp.ok());
    }

    #[test]
    fn decode_stringifies_structured_data() {
        let resp = decode_body(200, r#"{"code":200,"data":{"a":1}}"#.to_string());
        assert_eq!(resp.data, r#"{"a":1}"#);
    }

    #[test]
    fn decode_without_code_uses_status_success() {
        let body = r#"{"name":"g@@s","hosts":[]}"#;
        let resp = decode_body(200, body.to_string());
        assert_eq!(resp.code, 200);
        assert_eq!(resp.data, body);
        assert!(resp.message.is_empty());
    }

    #[test]
    fn decode_without_code_uses_status_failure() {
        let resp = decode_body(503, "upstream down".to_string());
        assert_eq!(resp.code, 503);
        assert_eq!(resp.message, "upstream down");
        assert!(!resp.ok());
    }

    #[test]
    fn into_result_maps_failure_to_api_error() {
        let resp = ApiResponse { code: 403, message: "denied".to_string(), data: String::new() };
        match resp.into_result() {
            Err(Error::Api { code, message }) => {
                assert_eq!(code, 403);
                assert_eq!(message, "denied");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn form_body_encodes_pairs() {
        let req = ApiRequest::new(Method::POST, "/service")
            .form_body([("serviceName", "svc"), ("metadata", r#"{"a":"1"}"#)]);
        assert_eq!(
            req.body.as_deref(),
            Some("serviceName=svc&metadata=%7B%22a%22%3A%221%22%7D")
        );
    }

    #[test]
    fn local_ip_returns_something_routable_looking() {
        let ip = local_ip();
        assert!(!ip.is_empty());
    }
}
