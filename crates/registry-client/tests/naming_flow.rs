//! End-to-end flows against a canned in-process registry.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use registry_client::{Client, Config, Instance, InstanceQuery, Metadata, ServiceQuery};

/// Minimal registry stub: answers every request with a canned body chosen by
/// path, records the request lines it saw.
struct FakeRegistry {
    addr: String,
    requests: Arc<Mutex<Vec<String>>>,
}

impl FakeRegistry {
    async fn spawn() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let requests: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

        let seen = Arc::clone(&requests);
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else { return };
                let seen = Arc::clone(&seen);
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 8192];
                    let n = stream.read(&mut buf).await.unwrap_or(0);
                    let text = String::from_utf8_lossy(&buf[..n]);
                    let request_line = text.lines().next().unwrap_or_default().to_string();
                    let path = request_line.split_whitespace().nth(1).unwrap_or("").to_string();
                    seen.lock().unwrap().push(request_line);

                    let body = route(&path);
                    let resp = format!(
                        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        body.len(),
                        body
                    );
                    let _ = stream.write_all(resp.as_bytes()).await;
                });
            }
        });

        Self { addr, requests }
    }

    fn request_lines(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }

    fn count_matching(&self, needle: &str) -> usize {
        self.request_lines().iter().filter(|l| l.contains(needle)).count()
    }
}

fn route(path: &str) -> String {
    if path.contains("/v1/auth/login") {
        return r#"{"accessToken":"test-token","tokenTtl":18000}"#.to_string();
    }
    if path.contains("/instance/beat") {
        return r#"{"code":0,"data":"{\"clientBeatInterval\":300,\"lightBeatEnabled\":false}"}"#
            .to_string();
    }
    if path.contains("/instance/list") {
        return r#"{
            "name": "DEFAULT_GROUP@@orders",
            "clusters": "DEFAULT",
            "cacheMillis": 10000,
            "hosts": [{
                "ip": "10.0.0.1", "port": 7000, "weight": 1.0,
                "healthy": true, "enabled": true, "ephemeral": true,
                "clusterName": "DEFAULT", "serviceName": "DEFAULT_GROUP@@orders",
                "metadata": {}
            }],
            "lastRefTime": 1700000000000,
            "checksum": "c",
            "allIPs": false
        }"#
        .to_string();
    }
    if path.contains("/service/list") {
        return r#"{"doms":["orders"],"count":1}"#.to_string();
    }
    r#"{"code":0,"data":"ok"}"#.to_string()
}

fn client_for(registry: &FakeRegistry, cache_dir: &std::path::Path) -> Client {
    let config = Config {
        hosts: vec![registry.addr.clone()],
        cache_dir: cache_dir.to_path_buf(),
        ..Config::default()
    };
    Client::new(config).unwrap()
}

#[tokio::test]
async fn register_starts_heartbeats_and_deregister_stops_them() {
    let registry = FakeRegistry::spawn().await;
    let dir = tempfile::tempdir().unwrap();
    let client = client_for(&registry, dir.path());
    let naming = client.naming().await.unwrap();

    let instance = Instance::new(
        "orders",
        "DEFAULT_GROUP",
        "DEFAULT",
        "10.0.0.1",
        7000,
        1.0,
        true,
        true,
        Metadata::new().with("preserved.heart.beat.interval", "200ms"),
    );
    naming.register_instance(&instance).await.unwrap();
    assert_eq!(registry.count_matching("POST /v1/ns/instance?"), 1);

    tokio::time::sleep(Duration::from_secs(2)).await;
    let beats = registry.count_matching("/instance/beat");
    assert!(beats >= 2, "expected repeated heartbeats, saw {}", beats);
    let beat_line = registry
        .request_lines()
        .into_iter()
        .find(|l| l.contains("/instance/beat"))
        .unwrap();
    assert!(beat_line.starts_with("PUT "));
    assert!(beat_line.contains("ip=10.0.0.1"));
    assert!(beat_line.contains("port=7000"));
    assert!(beat_line.contains("orders"));

    naming
        .deregister_instance("orders", "DEFAULT_GROUP", "DEFAULT", "10.0.0.1", 7000, true)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;
    let after_deregister = registry.count_matching("/instance/beat");
    tokio::time::sleep(Duration::from_millis(800)).await;
    assert_eq!(
        registry.count_matching("/instance/beat"),
        after_deregister,
        "heartbeats must stop after deregistration"
    );

    client.shutdown();
}

#[tokio::test]
async fn direct_discovery_returns_registered_endpoint() {
    let registry = FakeRegistry::spawn().await;
    let dir = tempfile::tempdir().unwrap();
    let client = client_for(&registry, dir.path());
    let naming = client.naming().await.unwrap();

    let instances = naming
        .select_instances(InstanceQuery {
            service_name: "orders".to_string(),
            group_name: "DEFAULT_GROUP".to_string(),
            clusters: vec!["DEFAULT".to_string()],
            subscribe: false,
            healthy_only: false,
        })
        .await
        .unwrap();

    assert_eq!(instances.len(), 1);
    assert_eq!(instances[0].addr(), "10.0.0.1:7000");
    // Direct queries advertise no push port.
    let query_line = registry
        .request_lines()
        .into_iter()
        .find(|l| l.contains("/instance/list"))
        .unwrap();
    assert!(query_line.contains("udpPort=0"));

    client.shutdown();
}

#[tokio::test]
async fn cached_discovery_goes_through_the_merge_path() {
    let registry = FakeRegistry::spawn().await;
    let dir = tempfile::tempdir().unwrap();
    let client = client_for(&registry, dir.path());
    let naming = client.naming().await.unwrap();

    let query = InstanceQuery {
        service_name: "orders".to_string(),
        group_name: "DEFAULT_GROUP".to_string(),
        clusters: vec!["DEFAULT".to_string()],
        subscribe: true,
        healthy_only: false,
    };
    let instances = naming.select_instances(query.clone()).await.unwrap();
    assert_eq!(instances.len(), 1);
    let pulls = registry.count_matching("/instance/list");
    assert_eq!(pulls, 1);

    // Second read is served from the cache.
    let again = naming.select_instances(query).await.unwrap();
    assert_eq!(again.len(), 1);
    assert_eq!(registry.count_matching("/instance/list"), pulls);

    client.shutdown();
}

#[tokio::test]
async fn subscribed_listener_sees_a_pushed_instance_exactly_once() {
    use registry_client::{EventListener, ServiceInfo};

    struct Recorder {
        events: Mutex<Vec<ServiceInfo>>,
    }

    impl EventListener for Recorder {
        fn on_event(&self, service: &ServiceInfo) {
            self.events.lock().unwrap().push(service.clone());
        }
    }

    let registry = FakeRegistry::spawn().await;
    let dir = tempfile::tempdir().unwrap();
    let client = client_for(&registry, dir.path());
    let naming = client.naming().await.unwrap();

    let recorder = Arc::new(Recorder { events: Mutex::new(Vec::new()) });
    naming
        .subscribe(
            "orders",
            "DEFAULT_GROUP",
            &["DEFAULT"],
            recorder.clone() as Arc<dyn EventListener>,
        )
        .await
        .unwrap();
    // Priming fetch delivered one event for the first-seen service.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let primed = recorder.events.lock().unwrap().len();

    // The registry pushes an updated endpoint set over UDP.
    let push_port = naming.push_port();
    assert_ne!(push_port, 0, "push receiver must be bound");
    let payload = serde_json::json!({
        "type": "service",
        "data": r#"{
            "name": "DEFAULT_GROUP@@orders",
            "clusters": "DEFAULT",
            "hosts": [
                {"ip": "10.0.0.1", "port": 7000},
                {"ip": "10.0.0.2", "port": 7001}
            ],
            "lastRefTime": 1700000000999
        }"#,
        "lastRefTime": 1700000000999u64,
    })
    .to_string();
    let peer = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    peer.send_to(payload.as_bytes(), ("127.0.0.1", push_port)).await.unwrap();
    let mut ack = vec![0u8; 1024];
    tokio::time::timeout(Duration::from_secs(2), peer.recv_from(&mut ack))
        .await
        .expect("push must be acked")
        .unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    let events = recorder.events.lock().unwrap();
    assert_eq!(events.len(), primed + 1, "exactly one event per effective update");
    let latest = events.last().unwrap();
    assert!(latest.hosts().iter().any(|h| h.addr() == "10.0.0.2:7001"));

    client.shutdown();
}

#[tokio::test]
async fn transport_rotates_past_a_dead_host() {
    // Reserve a port and close it again so the first host refuses connections.
    let dead = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().to_string()
    };
    let registry = FakeRegistry::spawn().await;
    let dir = tempfile::tempdir().unwrap();

    let config = Config {
        hosts: vec![dead, registry.addr.clone()],
        cache_dir: dir.path().to_path_buf(),
        timeout: Duration::from_secs(2),
        ..Config::default()
    };
    let client = Client::new(config).unwrap();
    let naming = client.naming().await.unwrap();

    let list = naming
        .select_services(ServiceQuery { service_name: String::new(), ..ServiceQuery::default() })
        .await
        .unwrap();
    assert_eq!(list.count, 1);
    assert_eq!(list.services, vec!["orders"]);

    client.shutdown();
}
