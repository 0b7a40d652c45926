//! HTTP server exposing sensor snapshots.
//!
//! This module provides an Axum-based HTTP server with:
//! - `/api/sensors` and `/api/sensors/{device}` for JSON sensor entities
//! - `/metrics` for Prometheus scraping
//! - `/health` for health checks

use crate::error::{ProxmoxError, Result};
use crate::metrics::MetricsCollector;
use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

/// Shared application state.
#[derive(Clone)]
struct AppState {
    metrics: Arc<MetricsCollector>,
}

/// Build the application router.
pub fn router(metrics: MetricsCollector) -> Router {
    let state = AppState {
        metrics: Arc::new(metrics),
    };

    Router::new()
        .route("/api/sensors", get(sensors_handler))
        .route("/api/sensors/{device}", get(device_handler))
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .route("/", get(root_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP server.
///
/// # Arguments
///
/// * `listen_address` - Address to bind to (e.g., "0.0.0.0:9221")
/// * `metrics` - Collector over the pollers' snapshot channels
/// * `shutdown` - Resolves when the server should stop
///
/// # Examples
///
/// ```no_run
/// use proxmox_suite::config::{Backend, DeviceConfig};
/// use proxmox_suite::metrics::MetricsCollector;
/// use proxmox_suite::poller::Poller;
/// use proxmox_suite::server::start_server;
/// use std::time::Duration;
///
/// #[tokio::main]
/// async fn main() {
///     let config = DeviceConfig::new(Backend::Pve, "pve.example.com", "monitor@pve!ha", "secret");
///     let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
///     let (snapshots, _handle) = Poller::new(config)
///         .unwrap()
///         .spawn(Duration::from_secs(30), shutdown_rx);
///     let metrics = MetricsCollector::new(vec![snapshots]).unwrap();
///     start_server("0.0.0.0:9221", metrics, std::future::pending()).await.unwrap();
/// }
/// ```
pub async fn start_server<F>(listen_address: &str, metrics: MetricsCollector, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    info!("Starting HTTP server on {}", listen_address);
    let listener = TcpListener::bind(listen_address).await?;
    serve(listener, metrics, shutdown).await
}

/// Serve on an already bound listener.
pub async fn serve<F>(listener: TcpListener, metrics: MetricsCollector, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, router(metrics))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| ProxmoxError::Server(e.to_string()))?;

    Ok(())
}

/// Handler for /api/sensors.
async fn sensors_handler(State(state): State<AppState>) -> Response {
    Json(state.metrics.snapshots()).into_response()
}

/// Handler for /api/sensors/{device}.
async fn device_handler(State(state): State<AppState>, Path(device): Path<String>) -> Response {
    match state.metrics.snapshot(&device) {
        Some(snapshot) => Json(snapshot).into_response(),
        None => (StatusCode::NOT_FOUND, format!("Unknown device: {}", device)).into_response(),
    }
}

/// Handler for /metrics endpoint.
async fn metrics_handler(State(state): State<AppState>) -> Response {
    debug!("Received metrics scrape request");
    state.metrics.collect();

    match state.metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)],
            body,
        )
            .into_response(),
        Err(e) => {
            warn!("Failed to encode metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to encode metrics: {}", e),
            )
                .into_response()
        }
    }
}

/// Handler for /health endpoint.
async fn health_handler() -> Response {
    (StatusCode::OK, "OK").into_response()
}

/// Handler for root endpoint.
async fn root_handler() -> Response {
    let html = r#"
<!DOCTYPE html>
<html>
<head>
    <title>Proxmox Suite Exporter</title>
    <style>
        body { font-family: Arial, sans-serif; margin: 40px; }
        h1 { color: #333; }
        a { color: #0066cc; text-decoration: none; }
        a:hover { text-decoration: underline; }
        .info { background: #f0f0f0; padding: 15px; border-radius: 5px; margin: 20px 0; }
    </style>
</head>
<body>
    <h1>Proxmox Suite Exporter</h1>
    <div class="info">
        <p>Sensors for Proxmox VE and Proxmox Backup Server</p>
        <p><strong>Endpoints:</strong></p>
        <ul>
            <li><a href="/api/sensors">/api/sensors</a> - Sensor snapshots (JSON)</li>
            <li><a href="/metrics">/metrics</a> - Prometheus metrics</li>
            <li><a href="/health">/health</a> - Health check</li>
        </ul>
    </div>
</body>
</html>
"#;

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
        html,
    )
        .into_response()
}
