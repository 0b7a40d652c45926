//! Node resolution.
//!
//! PVE requires a node name for every node-scoped call. When the device has
//! no node configured the first node of `/nodes` is used; only that node's
//! statistics are surfaced. PBS always answers on `localhost`.

use crate::client::{NodeListItem, ProxmoxClient};
use crate::config::{Backend, DeviceConfig};
use crate::error::{ProxmoxError, Result};
use tracing::{debug, info};

/// Node PBS is queried on when none is configured.
pub const PBS_DEFAULT_NODE: &str = "localhost";

/// Pick the node to use from a configured value and a node listing.
///
/// A configured node wins; otherwise the first listed node with a name.
pub fn select_node(configured: Option<&str>, nodes: &[NodeListItem]) -> Result<String> {
    if let Some(node) = configured.map(str::trim).filter(|n| !n.is_empty()) {
        return Ok(node.to_string());
    }

    nodes
        .iter()
        .map(|item| item.node.trim())
        .find(|name| !name.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ProxmoxError::NodeResolution("no nodes returned".to_string()))
}

/// Resolve the PVE node to query.
///
/// The node listing is only requested when no node is configured. A failing
/// listing call propagates its error unchanged so permission problems stay
/// recognisable.
pub async fn resolve_node(client: &ProxmoxClient, configured: Option<&str>) -> Result<String> {
    if let Some(node) = configured.map(str::trim).filter(|n| !n.is_empty()) {
        debug!("Using configured node {}", node);
        return Ok(node.to_string());
    }

    let nodes = client.list_nodes().await?;
    let node = select_node(None, &nodes)?;
    info!("Auto-detected node {} ({} listed)", node, nodes.len());
    Ok(node)
}

/// Resolve the node to query for any backend.
pub async fn resolve_for(client: &ProxmoxClient, config: &DeviceConfig) -> Result<String> {
    match config.backend {
        Backend::Pve => resolve_node(client, config.configured_node()).await,
        Backend::Pbs => Ok(config
            .configured_node()
            .unwrap_or(PBS_DEFAULT_NODE)
            .to_string()),
    }
}
