//! Error types for the Proxmox suite exporter.
//!
//! This module defines custom error types using `thiserror` for structured
//! error handling throughout the application.

use thiserror::Error;

/// Main error type for exporter operations.
#[derive(Debug, Error)]
pub enum ProxmoxError {
    /// Transport-level error talking to the Proxmox API (connect, timeout, TLS)
    #[error("Proxmox API error: {0}")]
    Api(#[from] reqwest::Error),

    /// Non-success HTTP status other than 401/403
    #[error("HTTP {status} for {path}: {body}")]
    Http {
        status: u16,
        path: String,
        body: String,
    },

    /// HTTP 403: the user or the API token lacks audit permissions
    #[error("Permission denied for {path} (check Sys.Audit/VM.Audit/Datastore.Audit on / for user and token)")]
    Forbidden { path: String },

    /// Authentication error (HTTP 401)
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Error parsing a Proxmox API response
    #[error("Failed to parse Proxmox API response: {0}")]
    ParseError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// No node could be determined for a PVE connection
    #[error("Could not determine node: {0}")]
    NodeResolution(String),

    /// Metrics error
    #[error("Metrics error: {0}")]
    Metrics(String),

    /// HTTP server error
    #[error("HTTP server error: {0}")]
    Server(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProxmoxError {
    /// Whether this error is an authorization failure (HTTP 403).
    pub fn is_forbidden(&self) -> bool {
        matches!(self, ProxmoxError::Forbidden { .. })
    }
}

/// Result type alias for exporter operations.
pub type Result<T> = std::result::Result<T, ProxmoxError>;
