//! HTTP server endpoint tests

use mockito::{Matcher, Server, ServerGuard};
use proxmox_suite::{
    config::{Backend, DeviceConfig},
    metrics::MetricsCollector,
    poller::{DeviceSnapshot, Poller},
    server::serve,
};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch};

/// Helper to create test config
fn create_test_config(server_url: &str) -> DeviceConfig {
    DeviceConfig {
        endpoint: Some(server_url.to_string()),
        timeout_seconds: 5,
        ..DeviceConfig::new(Backend::Pbs, "pbs.test", "test@pbs!token", "test-secret")
    }
}

/// Mock every endpoint a PBS poll touches
async fn mock_pbs(server: &mut ServerGuard) -> Vec<mockito::Mock> {
    let mut mocks = Vec::new();
    mocks.push(
        server
            .mock("GET", "/api2/json/version")
            .with_status(200)
            .with_body(r#"{"data": {"version": "3.2", "release": "1"}}"#)
            .create_async()
            .await,
    );
    mocks.push(
        server
            .mock("GET", "/api2/json/nodes/localhost/status")
            .with_status(200)
            .with_body(r#"{"data": {"cpu": 0.25, "memory": {"used": 1073741824, "total": 4294967296, "free": 3221225472}, "loadavg": [0.5, 0.4, 0.3], "uptime": 3600}}"#)
            .create_async()
            .await,
    );
    mocks.push(
        server
            .mock("GET", "/api2/json/status/datastore-usage")
            .with_status(200)
            .with_body(r#"{"data": [{"store": "backup", "total": 1099511627776, "used": 549755813888, "avail": 549755813888}]}"#)
            .create_async()
            .await,
    );
    mocks.push(
        server
            .mock("GET", "/api2/json/nodes/localhost/tasks")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"data": []}"#)
            .create_async()
            .await,
    );
    mocks
}

/// Poll once, then serve the snapshot on an ephemeral port.
async fn start_test_server(server_url: &str) -> (SocketAddr, oneshot::Sender<()>) {
    let mut poller = Poller::new(create_test_config(server_url)).unwrap();
    let snapshot = poller.poll().await;
    let (_tx, rx) = watch::channel::<DeviceSnapshot>(snapshot);
    let collector = MetricsCollector::new(vec![rx]).unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        serve(listener, collector, async move {
            let _ = stop_rx.await;
        })
        .await
    });

    (addr, stop_tx)
}

#[tokio::test]
async fn test_health_endpoint() {
    let mut server = Server::new_async().await;
    let _mocks = mock_pbs(&mut server).await;
    let (addr, _stop) = start_test_server(&server.url()).await;

    let response = reqwest::get(format!("http://{}/health", addr)).await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "OK");
}

#[tokio::test]
async fn test_sensors_endpoint_lists_devices() {
    let mut server = Server::new_async().await;
    let _mocks = mock_pbs(&mut server).await;
    let (addr, _stop) = start_test_server(&server.url()).await;

    let response = reqwest::get(format!("http://{}/api/sensors", addr)).await.unwrap();
    assert_eq!(response.status(), 200);

    let body: serde_json::Value = response.json().await.unwrap();
    let devices = body.as_array().unwrap();
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0]["device_id"], "pbs:pbs.test:8007");
    assert_eq!(devices[0]["available"], true);
    assert_eq!(devices[0]["version"], "3.2 (1)");

    let sensors = devices[0]["sensors"].as_array().unwrap();
    let cpu = sensors.iter().find(|s| s["key"] == "cpu_percent").unwrap();
    assert_eq!(cpu["unit"], "%");
    assert_eq!(cpu["reading"]["state"], "value");
    assert_eq!(cpu["reading"]["value"], 25.0);
}

#[tokio::test]
async fn test_device_endpoint() {
    let mut server = Server::new_async().await;
    let _mocks = mock_pbs(&mut server).await;
    let (addr, _stop) = start_test_server(&server.url()).await;

    let response = reqwest::get(format!("http://{}/api/sensors/pbs:pbs.test:8007", addr))
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["model"], "Proxmox Backup Server");

    let missing = reqwest::get(format!("http://{}/api/sensors/pve:nowhere:8006", addr))
        .await
        .unwrap();
    assert_eq!(missing.status(), 404);
}

#[tokio::test]
async fn test_metrics_endpoint_returns_prometheus_format() {
    let mut server = Server::new_async().await;
    let _mocks = mock_pbs(&mut server).await;
    let (addr, _stop) = start_test_server(&server.url()).await;

    let response = reqwest::get(format!("http://{}/metrics", addr)).await.unwrap();
    assert_eq!(response.status(), 200);
    let content_type = response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    assert!(content_type.starts_with("text/plain"));

    let body = response.text().await.unwrap();
    assert!(body.contains("# TYPE proxmox_up gauge"));
    assert!(body.contains(r#"proxmox_up{backend="pbs",device="pbs:pbs.test:8007"} 1"#));
    assert!(body.contains(
        r#"proxmox_sensor_value{backend="pbs",device="pbs:pbs.test:8007",sensor="ds:backup:usage_percent",unit="%"} 50"#
    ));
    assert!(body.contains(r#"proxmox_version_info{backend="pbs",device="pbs:pbs.test:8007",version="3.2 (1)"} 1"#));
}

#[tokio::test]
async fn test_server_stops_on_shutdown_signal() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let collector = MetricsCollector::new(Vec::new()).unwrap();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();

    let handle = tokio::spawn(serve(listener, collector, async move {
        let _ = stop_rx.await;
    }));

    stop_tx.send(()).unwrap();
    let result = tokio::time::timeout(std::time::Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_ok());
}
