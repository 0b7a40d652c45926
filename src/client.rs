//! Proxmox API client for PVE and PBS.
//!
//! This module provides a read-only client for the Proxmox REST API
//! (`/api2/json/...`) using API token authentication. Both products share the
//! same envelope (`{"data": ...}`) and task endpoints; the client only differs
//! in the `Authorization` header it sends.

use crate::config::DeviceConfig;
use crate::error::{ProxmoxError, Result};
use crate::task::TaskRecord;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;
use tracing::{debug, warn};

/// Proxmox API client bound to one device.
#[derive(Clone)]
pub struct ProxmoxClient {
    client: Client,
    base_url: String,
    auth_header: String,
    task_limit: u32,
}

impl ProxmoxClient {
    /// Create a new API client.
    ///
    /// # Arguments
    ///
    /// * `config` - Device connection settings
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use proxmox_suite::client::ProxmoxClient;
    /// use proxmox_suite::config::{Backend, DeviceConfig};
    ///
    /// let config = DeviceConfig::new(Backend::Pve, "pve.example.com", "monitor@pve!ha", "secret");
    /// let client = ProxmoxClient::new(&config).unwrap();
    /// ```
    pub fn new(config: &DeviceConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .danger_accept_invalid_certs(!config.verify_tls)
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url(),
            auth_header: config.auth_header(),
            task_limit: config.task_limit,
        })
    }

    /// Issue a GET request and unwrap the `data` envelope.
    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        debug!("Fetching {}", url);

        let response = self
            .client
            .get(&url)
            .header("Authorization", &self.auth_header)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!("Request to {} failed: {}", path, status);
            return Err(match status {
                StatusCode::FORBIDDEN => ProxmoxError::Forbidden {
                    path: path.to_string(),
                },
                StatusCode::UNAUTHORIZED => {
                    ProxmoxError::Auth(format!("{} rejected the API token", path))
                }
                _ => ProxmoxError::Http {
                    status: status.as_u16(),
                    path: path.to_string(),
                    body,
                },
            });
        }

        let body = response.text().await?;
        let api_response: ApiResponse<T> = serde_json::from_str(&body).map_err(|e| {
            ProxmoxError::ParseError(format!(
                "{}: {}. Body preview: {}",
                path,
                e,
                body.chars().take(200).collect::<String>()
            ))
        })?;
        Ok(api_response.data)
    }

    /// Get product version information.
    pub async fn get_version(&self) -> Result<VersionInfo> {
        self.get("/version").await
    }

    /// List cluster nodes (PVE).
    pub async fn list_nodes(&self) -> Result<Vec<NodeListItem>> {
        let items: Vec<Value> = self.get("/nodes").await?;
        Ok(parse_records(items, "node"))
    }

    /// Get node status (CPU, memory, uptime, load).
    pub async fn get_node_status(&self, node: &str) -> Result<NodeStatus> {
        self.get(&format!("/nodes/{}/status", node)).await
    }

    /// List virtual machines on a node (PVE).
    pub async fn list_vms(&self, node: &str) -> Result<Vec<GuestSummary>> {
        let items: Vec<Value> = self.get(&format!("/nodes/{}/qemu", node)).await?;
        Ok(parse_records(items, "qemu guest"))
    }

    /// List containers on a node (PVE).
    pub async fn list_containers(&self, node: &str) -> Result<Vec<GuestSummary>> {
        let items: Vec<Value> = self.get(&format!("/nodes/{}/lxc", node)).await?;
        Ok(parse_records(items, "lxc guest"))
    }

    /// Get datastore usage information (PBS).
    pub async fn get_datastore_usage(&self) -> Result<Vec<DatastoreUsage>> {
        let items: Vec<Value> = self.get("/status/datastore-usage").await?;
        let mut datastores: Vec<DatastoreUsage> = parse_records(items, "datastore");
        datastores.retain(|ds| !ds.store.is_empty());
        Ok(datastores)
    }

    /// Get recent tasks of a node, finished and running.
    pub async fn list_tasks(&self, node: &str) -> Result<Vec<TaskRecord>> {
        let path = format!("/nodes/{}/tasks?limit={}", node, self.task_limit);
        let items: Vec<Value> = self.get(&path).await?;
        Ok(parse_records(items, "task"))
    }

    /// Get currently running tasks of a node.
    ///
    /// Records from this call carry no `status`/`state` fields.
    pub async fn list_running_tasks(&self, node: &str) -> Result<Vec<TaskRecord>> {
        let path = format!("/nodes/{}/tasks?running=1&limit={}", node, self.task_limit);
        let items: Vec<Value> = self.get(&path).await?;
        Ok(parse_records(items, "running task"))
    }
}

/// Decode each list entry on its own, skipping entries that do not fit.
fn parse_records<T: DeserializeOwned>(items: Vec<Value>, what: &str) -> Vec<T> {
    let total = items.len();
    let records: Vec<T> = items
        .into_iter()
        .filter_map(|item| match serde_json::from_value(item) {
            Ok(record) => Some(record),
            Err(e) => {
                debug!("Skipping unparseable {} record: {}", what, e);
                None
            }
        })
        .collect();

    if records.len() < total {
        debug!("Parsed {}/{} {} records", records.len(), total, what);
    }
    records
}

/// Generic Proxmox API response wrapper.
#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    data: T,
}

/// Version information.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VersionInfo {
    /// Version string (e.g., "8.2.4")
    pub version: String,
    #[serde(default)]
    pub release: Option<String>,
    #[serde(default)]
    pub repoid: Option<String>,
}

/// A node as returned by `/nodes`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NodeListItem {
    /// Node name (e.g., "pve1")
    #[serde(default)]
    pub node: String,
    /// "online", "offline" or "unknown"
    #[serde(default)]
    pub status: Option<String>,
}

/// Node status. PVE and PBS report the same core fields; everything else is
/// kept in `extra`.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct NodeStatus {
    /// CPU usage (0.0 to 1.0)
    #[serde(default)]
    pub cpu: Option<f64>,
    /// I/O wait (0.0 to 1.0)
    #[serde(default)]
    pub wait: Option<f64>,
    #[serde(default)]
    pub memory: Option<Memory>,
    #[serde(default)]
    pub swap: Option<Memory>,
    /// Load averages [1min, 5min, 15min]; PVE sends strings, PBS numbers
    #[serde(default, deserialize_with = "lenient_loadavg")]
    pub loadavg: Option<Vec<f64>>,
    /// Uptime in seconds
    #[serde(default)]
    pub uptime: Option<u64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl NodeStatus {
    /// A host name reported in the status payload, if any.
    pub fn hostname(&self) -> Option<&str> {
        fn lookup<'a>(map: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a str> {
            keys.iter()
                .filter_map(|key| map.get(*key).and_then(Value::as_str))
                .map(str::trim)
                .find(|value| !value.is_empty())
        }

        lookup(&self.extra, &["hostname", "nodename", "node", "name"]).or_else(|| {
            self.extra
                .get("node")
                .and_then(Value::as_object)
                .and_then(|node| lookup(node, &["hostname", "nodename", "name"]))
        })
    }
}

fn lenient_loadavg<'de, D>(deserializer: D) -> std::result::Result<Option<Vec<f64>>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Array(items)) => Some(
            items
                .iter()
                .filter_map(|item| match item {
                    Value::Number(n) => n.as_f64(),
                    Value::String(s) => s.trim().parse().ok(),
                    _ => None,
                })
                .collect(),
        ),
        _ => None,
    })
}

/// Memory information.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Memory {
    /// Used memory in bytes
    #[serde(default)]
    pub used: u64,
    /// Total memory in bytes
    #[serde(default)]
    pub total: u64,
    /// Free memory in bytes
    #[serde(default)]
    pub free: u64,
}

/// A VM or container list entry.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GuestSummary {
    #[serde(default)]
    pub name: Option<String>,
    /// "running", "stopped", ...
    #[serde(default)]
    pub status: Option<String>,
}

impl GuestSummary {
    pub fn is_running(&self) -> bool {
        self.status.as_deref() == Some("running")
    }
}

/// Datastore usage information (PBS).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatastoreUsage {
    /// Datastore name
    #[serde(default)]
    pub store: String,
    /// Total size in bytes
    #[serde(default)]
    pub total: Option<u64>,
    /// Used bytes
    #[serde(default)]
    pub used: Option<u64>,
    /// Available bytes
    #[serde(default)]
    pub avail: Option<u64>,
    /// Set when PBS could not read the datastore
    #[serde(default)]
    pub error: Option<String>,
}
