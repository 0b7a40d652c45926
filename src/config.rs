//! Configuration management for the Proxmox suite exporter.
//!
//! Supports loading configuration from:
//! - TOML configuration files
//! - Environment variables (with `PROXMOX_SUITE_` prefix)
//!
//! Each `[[devices]]` entry describes one backend connection. Every device
//! gets its own poller holding an immutable copy of its [`DeviceConfig`].

use crate::error::{ProxmoxError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::Path;

/// Default PVE API port.
pub const DEFAULT_PVE_PORT: u16 = 8006;
/// Default PBS API port.
pub const DEFAULT_PBS_PORT: u16 = 8007;

/// Which Proxmox product a device talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Proxmox Virtual Environment
    Pve,
    /// Proxmox Backup Server
    Pbs,
}

impl Backend {
    pub fn default_port(self) -> u16 {
        match self {
            Backend::Pve => DEFAULT_PVE_PORT,
            Backend::Pbs => DEFAULT_PBS_PORT,
        }
    }

    /// Upper-case short name used in display names ("PVE", "PBS").
    pub fn label(self) -> &'static str {
        match self {
            Backend::Pve => "PVE",
            Backend::Pbs => "PBS",
        }
    }

    pub fn model(self) -> &'static str {
        match self {
            Backend::Pve => "Proxmox VE",
            Backend::Pbs => "Proxmox Backup Server",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Pve => f.write_str("pve"),
            Backend::Pbs => f.write_str("pbs"),
        }
    }
}

/// Connection settings for one Proxmox backend.
#[derive(Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Backend kind ("pve" or "pbs")
    pub backend: Backend,

    /// Host name or IP address of the API server
    pub host: String,

    /// API port (defaults to 8006 for PVE, 8007 for PBS)
    #[serde(default)]
    pub port: Option<u16>,

    /// API token ID (e.g., "monitor@pve!ha")
    #[serde(default)]
    pub token_id: String,

    /// API token secret
    #[serde(default)]
    pub token_secret: String,

    /// Verify TLS certificates (set to false for self-signed certs)
    #[serde(default = "default_verify_tls")]
    pub verify_tls: bool,

    /// Node to query. Blank means auto-detect (PVE) or "localhost" (PBS).
    #[serde(default)]
    pub node: Option<String>,

    /// Full origin overriding `https://host:port` (e.g., behind a reverse proxy)
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,

    /// Maximum number of task records requested per task list call
    #[serde(default = "default_task_limit")]
    pub task_limit: u32,
}

impl fmt::Debug for DeviceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceConfig")
            .field("backend", &self.backend)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("token_id", &self.token_id)
            .field("token_secret", &"***REDACTED***")
            .field("verify_tls", &self.verify_tls)
            .field("node", &self.node)
            .field("endpoint", &self.endpoint)
            .field("timeout_seconds", &self.timeout_seconds)
            .field("task_limit", &self.task_limit)
            .finish()
    }
}

impl DeviceConfig {
    /// Create a device configuration with default port, TLS and timeout settings.
    ///
    /// # Examples
    ///
    /// ```
    /// use proxmox_suite::config::{Backend, DeviceConfig};
    ///
    /// let device = DeviceConfig::new(Backend::Pbs, "pbs.lan", "monitor@pbs!ha", "secret");
    /// assert_eq!(device.port(), 8007);
    /// assert_eq!(device.device_id(), "pbs:pbs.lan:8007");
    /// ```
    pub fn new(
        backend: Backend,
        host: impl Into<String>,
        token_id: impl Into<String>,
        token_secret: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            host: host.into(),
            port: None,
            token_id: token_id.into(),
            token_secret: token_secret.into(),
            verify_tls: default_verify_tls(),
            node: None,
            endpoint: None,
            timeout_seconds: default_timeout(),
            task_limit: default_task_limit(),
        }
    }

    /// Effective API port.
    pub fn port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.backend.default_port())
    }

    /// Base URL of the JSON API, without trailing slash.
    pub fn base_url(&self) -> String {
        match self.endpoint.as_deref().map(str::trim).filter(|e| !e.is_empty()) {
            Some(endpoint) => format!("{}/api2/json", endpoint.trim_end_matches('/')),
            None => format!("https://{}:{}/api2/json", self.host, self.port()),
        }
    }

    /// Value of the `Authorization` header for API token auth.
    pub fn auth_header(&self) -> String {
        match self.backend {
            Backend::Pve => format!("PVEAPIToken={}={}", self.token_id, self.token_secret),
            Backend::Pbs => format!("PBSAPIToken={}:{}", self.token_id, self.token_secret),
        }
    }

    /// Stable identifier of this device: `<backend>:<host>:<port>`.
    pub fn device_id(&self) -> String {
        format!("{}:{}:{}", self.backend, self.host, self.port())
    }

    /// The configured node, if it is set and not blank.
    pub fn configured_node(&self) -> Option<&str> {
        self.node.as_deref().map(str::trim).filter(|n| !n.is_empty())
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Exporter specific settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExporterConfig {
    /// Address to listen on for the sensor and metrics endpoints
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log format (text, json)
    #[serde(default)]
    pub log_format: LogFormat,
    /// Seconds between two polls of the same device
    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: u64,
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            log_level: default_log_level(),
            log_format: LogFormat::default(),
            poll_interval_seconds: default_poll_interval(),
        }
    }
}

/// Main configuration structure for the exporter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Exporter server configuration
    #[serde(default)]
    pub exporter: ExporterConfig,

    /// Backend connections to poll
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

fn default_verify_tls() -> bool {
    false
}

fn default_timeout() -> u64 {
    20
}

fn default_task_limit() -> u32 {
    200
}

fn default_listen_address() -> String {
    "0.0.0.0:9221".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_poll_interval() -> u64 {
    30
}

impl Settings {
    /// Load configuration from a file and environment variables.
    ///
    /// # Arguments
    ///
    /// * `config_path` - Optional path to configuration file
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use proxmox_suite::config::Settings;
    ///
    /// let settings = Settings::load(Some("config/default.toml")).unwrap();
    /// ```
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = config_path {
            if Path::new(path).exists() {
                builder = builder.add_source(config::File::with_name(path));
            }
        }

        builder = builder.add_source(
            config::Environment::with_prefix("PROXMOX_SUITE")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        let settings: Settings = config.try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Validate configuration settings.
    pub fn validate(&self) -> Result<()> {
        if self.devices.is_empty() {
            return Err(invalid("at least one device must be configured"));
        }

        if self.exporter.poll_interval_seconds == 0 {
            return Err(invalid("poll_interval_seconds must be greater than zero"));
        }

        let mut seen = HashSet::new();
        for device in &self.devices {
            if device.host.trim().is_empty() {
                return Err(invalid("device host cannot be empty"));
            }

            if device.token_id.is_empty() || device.token_secret.is_empty() {
                return Err(invalid(&format!(
                    "API token credentials are required for {}",
                    device.device_id()
                )));
            }

            if !seen.insert(device.device_id()) {
                return Err(invalid(&format!(
                    "device {} is configured more than once",
                    device.device_id()
                )));
            }
        }

        Ok(())
    }
}

fn invalid(message: &str) -> ProxmoxError {
    ProxmoxError::Config(config::ConfigError::Message(message.to_string()))
}
