//! Prometheus rendering of device snapshots.
//!
//! Polling happens in the background; a scrape only renders the latest
//! snapshot of every device. Gauge vectors are reset before each rendering so
//! sensors that disappeared (e.g., a removed datastore) do not linger.

use crate::error::{ProxmoxError, Result};
use crate::poller::DeviceSnapshot;
use crate::sensor::Reading;
use prometheus::{Encoder, GaugeVec, Opts, Registry, TextEncoder};
use tokio::sync::watch;
use tracing::debug;

/// Holds the snapshot receivers of all pollers and the metric registry.
pub struct MetricsCollector {
    devices: Vec<watch::Receiver<DeviceSnapshot>>,
    registry: Registry,

    up: GaugeVec,
    sensor_value: GaugeVec,
    sensor_unavailable: GaugeVec,
    last_poll_timestamp: GaugeVec,
    version_info: GaugeVec,
}

fn gauge_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> Result<GaugeVec> {
    let gauge = GaugeVec::new(Opts::new(name, help), labels)
        .map_err(|e| ProxmoxError::Metrics(e.to_string()))?;
    registry
        .register(Box::new(gauge.clone()))
        .map_err(|e| ProxmoxError::Metrics(e.to_string()))?;
    Ok(gauge)
}

impl MetricsCollector {
    /// Create a collector over the given snapshot receivers.
    pub fn new(devices: Vec<watch::Receiver<DeviceSnapshot>>) -> Result<Self> {
        let registry = Registry::new();

        #[cfg(target_os = "linux")]
        registry
            .register(Box::new(
                prometheus::process_collector::ProcessCollector::for_self(),
            ))
            .map_err(|e| ProxmoxError::Metrics(e.to_string()))?;

        let up = gauge_vec(
            &registry,
            "proxmox_up",
            "Whether the last poll of the device reached the API (1 = yes, 0 = no)",
            &["device", "backend"],
        )?;
        let sensor_value = gauge_vec(
            &registry,
            "proxmox_sensor_value",
            "Current value of a numeric sensor",
            &["device", "backend", "sensor", "unit"],
        )?;
        let sensor_unavailable = gauge_vec(
            &registry,
            "proxmox_sensor_unavailable",
            "Set to 1 for sensors without a value, labelled with the reason",
            &["device", "backend", "sensor", "reason"],
        )?;
        let last_poll_timestamp = gauge_vec(
            &registry,
            "proxmox_last_poll_timestamp_seconds",
            "Unix timestamp of the last completed poll",
            &["device"],
        )?;
        let version_info = gauge_vec(
            &registry,
            "proxmox_version_info",
            "Proxmox product version",
            &["device", "backend", "version"],
        )?;

        Ok(Self {
            devices,
            registry,
            up,
            sensor_value,
            sensor_unavailable,
            last_poll_timestamp,
            version_info,
        })
    }

    /// Latest snapshot of every device.
    pub fn snapshots(&self) -> Vec<DeviceSnapshot> {
        self.devices.iter().map(|rx| rx.borrow().clone()).collect()
    }

    /// Latest snapshot of one device.
    pub fn snapshot(&self, device_id: &str) -> Option<DeviceSnapshot> {
        self.devices
            .iter()
            .map(|rx| rx.borrow())
            .find(|snapshot| snapshot.device_id == device_id)
            .map(|snapshot| snapshot.clone())
    }

    /// Rebuild all gauges from the latest snapshots.
    pub fn collect(&self) {
        self.up.reset();
        self.sensor_value.reset();
        self.sensor_unavailable.reset();
        self.last_poll_timestamp.reset();
        self.version_info.reset();

        for snapshot in self.snapshots() {
            self.update_device_metrics(&snapshot);
        }
    }

    fn update_device_metrics(&self, snapshot: &DeviceSnapshot) {
        let device = snapshot.device_id.as_str();
        let backend = snapshot.backend.to_string();
        debug!(
            "Updating metrics for {} ({} sensors)",
            device,
            snapshot.sensors.len()
        );

        self.up
            .with_label_values(&[device, &backend])
            .set(if snapshot.available { 1.0 } else { 0.0 });

        if let Some(polled_at) = snapshot.polled_at {
            self.last_poll_timestamp
                .with_label_values(&[device])
                .set(polled_at as f64);
        }

        if let Some(version) = &snapshot.version {
            self.version_info
                .with_label_values(&[device, &backend, version])
                .set(1.0);
        }

        for sensor in &snapshot.sensors {
            match &sensor.reading {
                Reading::Value(value) => {
                    let unit = sensor.unit.map(|u| u.symbol()).unwrap_or("");
                    self.sensor_value
                        .with_label_values(&[device, &backend, &sensor.key, unit])
                        .set(*value);
                }
                Reading::Unavailable(reason) => {
                    self.sensor_unavailable
                        .with_label_values(&[device, &backend, &sensor.key, reason.as_str()])
                        .set(1.0);
                }
                // Text sensors have no numeric representation.
                Reading::Text(_) => {}
            }
        }
    }

    /// Encode metrics in Prometheus text format.
    pub fn encode(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();

        let mut buffer = Vec::with_capacity(8192);
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| ProxmoxError::Metrics(e.to_string()))?;

        String::from_utf8(buffer).map_err(|e| ProxmoxError::Metrics(e.to_string()))
    }
}
