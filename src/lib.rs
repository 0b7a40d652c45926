//! # Proxmox Suite Exporter
//!
//! Polls Proxmox VE and Proxmox Backup Server and exposes derived sensors.
//!
//! ## Overview
//!
//! Every configured device is polled on a fixed interval by its own
//! [`poller::Poller`]. A poll cycle fetches, concurrently:
//!
//! - Node status (CPU, memory, load, uptime)
//! - VM and container lists (PVE)
//! - Datastore usage (PBS)
//! - The recent task history and the running task list
//!
//! and turns the results into named [`sensor::Sensor`]s with units. Calls that
//! fail only affect the sensors derived from them; a 403 shows up as a
//! `forbidden` reason on exactly those sensors.
//!
//! ## Quick Start
//!
//! ```no_run
//! use proxmox_suite::{config::Settings, metrics::MetricsCollector, poller::Poller, server::start_server};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let settings = Settings::load(Some("config/default.toml"))?;
//!     let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//!
//!     let mut receivers = Vec::new();
//!     for device in settings.devices {
//!         let mut poller = Poller::new(device)?;
//!         poller.setup().await?;
//!         let (rx, _handle) = poller.spawn(Duration::from_secs(30), shutdown_rx.clone());
//!         receivers.push(rx);
//!     }
//!
//!     let metrics = MetricsCollector::new(receivers)?;
//!     start_server(&settings.exporter.listen_address, metrics, std::future::pending()).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration
//!
//! The exporter can be configured via:
//! - TOML configuration file
//! - Environment variables (with `PROXMOX_SUITE_` prefix)
//!
//! See [`config::Settings`] for details.
//!
//! ## Modules
//!
//! - [`client`] - Read-only Proxmox API client
//! - [`config`] - Configuration management
//! - [`error`] - Error types and handling
//! - [`metrics`] - Prometheus rendering of snapshots
//! - [`node`] - Node resolution
//! - [`poller`] - Per-device poll loop
//! - [`sensor`] - Sensor model and value derivation
//! - [`server`] - HTTP server
//! - [`task`] - Task-state classification

pub mod client;
pub mod config;
pub mod error;
pub mod metrics;
pub mod node;
pub mod poller;
pub mod sensor;
pub mod server;
pub mod task;

pub use error::{ProxmoxError, Result};
