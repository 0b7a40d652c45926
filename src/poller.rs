//! Per-device polling.
//!
//! Each configured device gets one [`Poller`]. It owns an immutable copy of
//! the device configuration, an API client and the little state that survives
//! between cycles (resolved node, datastore names seen so far). The latest
//! [`DeviceSnapshot`] is published on a `watch` channel.

use crate::client::{ProxmoxClient, VersionInfo};
use crate::config::{Backend, DeviceConfig};
use crate::error::{ProxmoxError, Result};
use crate::node::{resolve_for, select_node, PBS_DEFAULT_NODE};
use crate::sensor::{
    datastore_sensors, fetched, guest_sensors, host_sensors, task_sensors, Fetched, Sensor,
    Unavailability,
};
use serde::Serialize;
use std::collections::BTreeSet;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Everything known about one device after a poll cycle.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceSnapshot {
    /// `<backend>:<host>:<port>`
    pub device_id: String,
    pub backend: Backend,
    /// Display name; never contains the configured host
    pub name: String,
    pub model: &'static str,
    pub node: Option<String>,
    pub version: Option<String>,
    /// False when every call of the last cycle failed
    pub available: bool,
    /// Unix timestamp of the last completed poll
    pub polled_at: Option<i64>,
    pub sensors: Vec<Sensor>,
}

impl DeviceSnapshot {
    /// Placeholder published before the first poll completes.
    pub fn pending(config: &DeviceConfig) -> Self {
        Self {
            device_id: config.device_id(),
            backend: config.backend,
            name: display_name(config.backend, None),
            model: config.backend.model(),
            node: config.configured_node().map(str::to_string),
            version: None,
            available: false,
            polled_at: None,
            sensors: Vec::new(),
        }
    }

    pub fn sensor(&self, key: &str) -> Option<&Sensor> {
        self.sensors.iter().find(|s| s.key == key)
    }
}

fn display_name(backend: Backend, name: Option<&str>) -> String {
    format!(
        "Proxmox {} ({})",
        backend.label(),
        name.unwrap_or(backend.label())
    )
}

/// Current Unix time in seconds.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_else(|e| {
            warn!("System time error: {}", e);
            0
        })
}

/// Polls one Proxmox backend.
pub struct Poller {
    config: DeviceConfig,
    client: ProxmoxClient,
    node: Option<String>,
    known_datastores: BTreeSet<String>,
}

impl Poller {
    /// Create a poller for a device.
    pub fn new(config: DeviceConfig) -> Result<Self> {
        let client = ProxmoxClient::new(&config)?;
        Ok(Self {
            config,
            client,
            node: None,
            known_datastores: BTreeSet::new(),
        })
    }

    pub fn device_id(&self) -> String {
        self.config.device_id()
    }

    /// The node used for node-scoped calls, once known.
    pub fn node(&self) -> Option<&str> {
        self.node.as_deref()
    }

    /// Validate connectivity and credentials before polling starts.
    ///
    /// PVE must list at least one node; PBS must answer `/version`. Returns
    /// the node that will be polled.
    pub async fn setup(&mut self) -> Result<String> {
        let node = match self.config.backend {
            Backend::Pve => {
                let nodes = self.client.list_nodes().await?;
                if nodes.is_empty() {
                    return Err(ProxmoxError::NodeResolution(
                        "no nodes returned".to_string(),
                    ));
                }
                select_node(self.config.configured_node(), &nodes)?
            }
            Backend::Pbs => {
                let version = self.client.get_version().await?;
                debug!("{} runs version {}", self.device_id(), version.version);
                resolve_for(&self.client, &self.config).await?
            }
        };

        info!("Device {} validated, node {}", self.device_id(), node);
        self.node = Some(node.clone());
        Ok(node)
    }

    /// Run one poll cycle against wall-clock time.
    pub async fn poll(&mut self) -> DeviceSnapshot {
        self.poll_at(unix_now()).await
    }

    /// Run one poll cycle; `now` anchors the failed-task window.
    pub async fn poll_at(&mut self, now: i64) -> DeviceSnapshot {
        let snapshot = match self.config.backend {
            Backend::Pve => self.poll_pve(now).await,
            Backend::Pbs => self.poll_pbs(now).await,
        };

        if !snapshot.available {
            warn!("All API calls failed for {}", snapshot.device_id);
        }
        snapshot
    }

    async fn current_node(&mut self) -> Result<String> {
        if let Some(node) = &self.node {
            return Ok(node.clone());
        }
        let node = resolve_for(&self.client, &self.config).await?;
        self.node = Some(node.clone());
        Ok(node)
    }

    fn track<T>(&self, result: Result<T>, what: &str) -> Fetched<T> {
        if let Err(e) = &result {
            warn!("Failed to get {} for {}: {}", what, self.device_id(), e);
        }
        fetched(result)
    }

    async fn poll_pve(&mut self, now: i64) -> DeviceSnapshot {
        let node = self.current_node().await;
        let client = &self.client;

        let (version, status, vms, containers, tasks, running) = match &node {
            Ok(node) => {
                let (version, status, vms, containers, tasks, running) = tokio::join!(
                    client.get_version(),
                    client.get_node_status(node),
                    client.list_vms(node),
                    client.list_containers(node),
                    client.list_tasks(node),
                    client.list_running_tasks(node),
                );
                (
                    self.track(version, "version"),
                    self.track(status, "node status"),
                    self.track(vms, "VM list"),
                    self.track(containers, "container list"),
                    self.track(tasks, "task list"),
                    self.track(running, "running task list"),
                )
            }
            Err(e) => {
                warn!("Node resolution failed for {}: {}", self.device_id(), e);
                let reason = Unavailability::from(e);
                (
                    self.track(client.get_version().await, "version"),
                    Err(reason),
                    Err(reason),
                    Err(reason),
                    Err(reason),
                    Err(reason),
                )
            }
        };

        let available = version.is_ok()
            || status.is_ok()
            || vms.is_ok()
            || containers.is_ok()
            || tasks.is_ok()
            || running.is_ok();

        let mut sensors = host_sensors(&status);
        sensors.extend(guest_sensors(&vms, &containers));
        sensors.extend(task_sensors(&tasks, &running, now));

        let node = node.ok();
        DeviceSnapshot {
            device_id: self.device_id(),
            backend: Backend::Pve,
            name: display_name(Backend::Pve, node.as_deref()),
            model: Backend::Pve.model(),
            node,
            version: version.ok().map(version_string),
            available,
            polled_at: Some(now),
            sensors,
        }
    }

    async fn poll_pbs(&mut self, now: i64) -> DeviceSnapshot {
        let node = self
            .current_node()
            .await
            .unwrap_or_else(|_| PBS_DEFAULT_NODE.to_string());
        let client = &self.client;

        let (version, status, datastores, tasks, running) = tokio::join!(
            client.get_version(),
            client.get_node_status(&node),
            client.get_datastore_usage(),
            client.list_tasks(&node),
            client.list_running_tasks(&node),
        );
        let version = self.track(version, "version");
        let status = self.track(status, "node status");
        let datastores = self.track(datastores, "datastore usage");
        let tasks = self.track(tasks, "task list");
        let running = self.track(running, "running task list");

        let available = version.is_ok()
            || status.is_ok()
            || datastores.is_ok()
            || tasks.is_ok()
            || running.is_ok();

        let hostname = status
            .as_ref()
            .ok()
            .and_then(|s| s.hostname())
            .map(str::to_string);

        let mut sensors = host_sensors(&status);
        sensors.extend(task_sensors(&tasks, &running, now));
        sensors.extend(datastore_sensors(&datastores, &self.known_datastores));

        if let Ok(list) = &datastores {
            self.known_datastores = list.iter().map(|ds| ds.store.clone()).collect();
        }

        DeviceSnapshot {
            device_id: self.device_id(),
            backend: Backend::Pbs,
            name: display_name(Backend::Pbs, hostname.as_deref()),
            model: Backend::Pbs.model(),
            node: Some(node),
            version: version.ok().map(version_string),
            available,
            polled_at: Some(now),
            sensors,
        }
    }

    /// Poll on a fixed interval until `shutdown` flips or its sender is
    /// dropped. The first poll starts immediately.
    pub async fn run(
        mut self,
        every: Duration,
        tx: watch::Sender<DeviceSnapshot>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut tick = interval(every);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let snapshot = self.poll().await;
                    debug!(
                        "Polled {}: {} sensors, available={}",
                        snapshot.device_id,
                        snapshot.sensors.len(),
                        snapshot.available
                    );
                    tx.send_replace(snapshot);
                }
                _ = shutdown.changed() => {
                    debug!("Poller for {} shutting down", self.device_id());
                    break;
                }
            }
        }
    }

    /// Spawn [`Poller::run`] on the runtime and return the snapshot receiver.
    pub fn spawn(
        self,
        every: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> (watch::Receiver<DeviceSnapshot>, JoinHandle<()>) {
        let (tx, rx) = watch::channel(DeviceSnapshot::pending(&self.config));
        let handle = tokio::spawn(self.run(every, tx, shutdown));
        (rx, handle)
    }
}

/// Pollers started by [`start_pollers`].
pub struct PollerSet {
    /// Snapshot receivers, in configuration order
    pub receivers: Vec<watch::Receiver<DeviceSnapshot>>,
    pub handles: Vec<JoinHandle<()>>,
    /// Device IDs whose setup validation failed
    pub setup_failures: Vec<String>,
}

/// Validate every device and spawn one poller each.
///
/// A device that fails setup still gets a poller: it resolves its node on
/// the first successful cycle and reports itself unavailable until then, so
/// one unreachable backend does not stop the others. Only a client that
/// cannot be built is an error.
pub async fn start_pollers(
    devices: &[DeviceConfig],
    every: Duration,
    shutdown: watch::Receiver<bool>,
) -> Result<PollerSet> {
    let mut set = PollerSet {
        receivers: Vec::with_capacity(devices.len()),
        handles: Vec::with_capacity(devices.len()),
        setup_failures: Vec::new(),
    };

    for device in devices {
        let mut poller = Poller::new(device.clone())?;
        if let Err(e) = poller.setup().await {
            warn!(
                "Setup failed for {}: {}; polling anyway",
                device.device_id(),
                e
            );
            set.setup_failures.push(device.device_id());
        }

        let (rx, handle) = poller.spawn(every, shutdown.clone());
        set.receivers.push(rx);
        set.handles.push(handle);
    }

    Ok(set)
}

fn version_string(info: VersionInfo) -> String {
    match info.release {
        Some(release) if !release.is_empty() && !info.version.starts_with(&release) => {
            format!("{} ({})", info.version, release)
        }
        _ => info.version,
    }
}
