//! UDP push receiver
//!
//! The registry pushes service updates over UDP to the port this receiver
//! reports in discovery queries. Payloads may be gzipped; every datagram is
//! acknowledged to its source address. A bad packet is logged and skipped,
//! never fatal.

use std::io::Read;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use flate2::read::GzDecoder;
use rand::Rng;
use registry_types::ServiceInfo;
use serde::Deserialize;
use serde_json::json;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::naming::cache::ServiceInfoCache;

const PORT_RANGE_START: u16 = 54951;
const PORT_RANGE_END: u16 = 55950;
const BIND_ATTEMPTS: usize = 3;
const RECV_BUFFER_SIZE: usize = 4096;

const GZIP_MAGIC: [u8; 2] = [0x1F, 0x8B];

#[derive(Debug, Deserialize)]
struct PushPacket {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: String,
    #[serde(rename = "lastRefTime", default)]
    last_ref_time: i64,
}

/// Listens for registry pushes and feeds them into the cache merge path.
pub struct PushReceiver {
    cache: Arc<ServiceInfoCache>,
    port: AtomicU16,
}

impl PushReceiver {
    pub fn new(cache: Arc<ServiceInfoCache>) -> Self {
        Self { cache, port: AtomicU16::new(0) }
    }

    /// The bound UDP port, or 0 while unbound. Sent to the registry in
    /// discovery queries so pushes can reach this process.
    pub fn port(&self) -> u16 {
        self.port.load(Ordering::Relaxed)
    }

    /// Try up to three random ports in the push range.
    async fn bind(&self, host: &str) -> Option<UdpSocket> {
        let host = if host.is_empty() { "0.0.0.0" } else { host };
        for attempt in 1..=BIND_ATTEMPTS {
            let port = rand::rng().random_range(PORT_RANGE_START..=PORT_RANGE_END);
            match UdpSocket::bind((host, port)).await {
                Ok(socket) => {
                    self.port.store(port, Ordering::Relaxed);
                    info!(host = %host, port, "push receiver listening");
                    return Some(socket);
                }
                Err(e) => {
                    warn!(host = %host, port, attempt, error = %e, "push receiver bind failed");
                }
            }
        }
        error!("push receiver gave up after {} bind attempts", BIND_ATTEMPTS);
        None
    }

    /// Bind and run the receive loop until cancellation.
    pub fn spawn(self: Arc<Self>, host: String, cancel: CancellationToken) {
        tokio::spawn(async move {
            let Some(socket) = self.bind(&host).await else { return };
            self.serve(socket, cancel).await;
        });
    }

    async fn serve(self: Arc<Self>, socket: UdpSocket, cancel: CancellationToken) {
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        loop {
            let (len, addr) = tokio::select! {
                _ = cancel.cancelled() => return,
                received = socket.recv_from(&mut buf) => match received {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "push receiver read failed");
                        continue;
                    }
                },
            };
            self.handle_datagram(&socket, &buf[..len], addr).await;
        }
    }

    async fn handle_datagram(&self, socket: &UdpSocket, data: &[u8], addr: SocketAddr) {
        let payload = match decompress_if_gzip(data) {
            Ok(text) => text,
            Err(e) => {
                warn!(from = %addr, error = %e, "undecodable push datagram");
                return;
            }
        };
        debug!(from = %addr, payload = %payload, "push received");

        let packet: PushPacket = match serde_json::from_str(&payload) {
            Ok(p) => p,
            Err(e) => {
                warn!(from = %addr, error = %e, "unparseable push packet");
                return;
            }
        };

        let ack = match packet.kind.as_str() {
            "dom" | "service" => {
                self.cache.process_payload(&packet.data).await;
                json!({
                    "type": "push-ack",
                    "lastRefTime": packet.last_ref_time.to_string(),
                    "data": "",
                })
            }
            "dump" => {
                let snapshot = self.cache.snapshot();
                let view: std::collections::HashMap<&str, &ServiceInfo> =
                    snapshot.iter().map(|(k, v)| (k.as_str(), v.as_ref())).collect();
                let dump = serde_json::to_string(&view).unwrap_or_default();
                json!({
                    "type": "dump-ack",
                    "lastRefTime": packet.last_ref_time.to_string(),
                    "data": dump,
                })
            }
            other => {
                debug!(from = %addr, kind = %other, "unknown push type");
                json!({
                    "type": "unknow-ack",
                    "lastRefTime": packet.last_ref_time.to_string(),
                    "data": "",
                })
            }
        };

        if let Err(e) = socket.send_to(ack.to_string().as_bytes(), addr).await {
            warn!(to = %addr, error = %e, "push ack send failed");
        }
    }
}

fn decompress_if_gzip(data: &[u8]) -> std::io::Result<String> {
    if data.len() < 2 || data[..2] != GZIP_MAGIC {
        return Ok(String::from_utf8_lossy(data).into_owned());
    }
    let mut decoder = GzDecoder::new(data);
    let mut out = String::new();
    decoder.read_to_string(&mut out)?;
    Ok(out)
}
