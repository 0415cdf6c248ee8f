//! Cluster error types

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur during cluster operations
///
/// The enum is serializable so a failure raised on one node can travel back
/// to the caller inside an RPC response.
#[derive(Error, Debug, Clone, Serialize, Deserialize)]
pub enum ClusterError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Transport error: {0}")]
    Transport(String),

    /// Membership changed underneath the operation (rebalance, join, leave)
    #[error("Topology changed: {0}")]
    Topology(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Node unavailable: {0}")]
    NodeUnavailable(String),

    /// The local or remote node is shutting down
    #[error("Node stopping: {0}")]
    NodeStopping(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Lock '{name}' is not held by {holder}")]
    LockNotHeld { name: String, holder: String },

    #[error("Service not deployed: {0}")]
    ServiceNotDeployed(String),

    #[error("Job not registered: {0}")]
    JobNotRegistered(String),

    /// A unit of work failed on the node that executed it
    #[error("Remote execution failed on {node}: {message}")]
    Remote { node: String, message: String },

    #[error("{operation} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        #[source]
        source: Box<ClusterError>,
    },

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ClusterError {
    /// Get the error type as a string for metrics labeling
    pub fn error_type(&self) -> &'static str {
        match self {
            ClusterError::Connection(_) => "connection",
            ClusterError::Transport(_) => "transport",
            ClusterError::Topology(_) => "topology",
            ClusterError::Tls(_) => "tls",
            ClusterError::Serialization(_) => "serialization",
            ClusterError::InvalidInput(_) => "invalid_input",
            ClusterError::Timeout(_) => "timeout",
            ClusterError::NodeUnavailable(_) => "node_unavailable",
            ClusterError::NodeStopping(_) => "node_stopping",
            ClusterError::Config(_) => "config",
            ClusterError::LockNotHeld { .. } => "lock_not_held",
            ClusterError::ServiceNotDeployed(_) => "service_not_deployed",
            ClusterError::JobNotRegistered(_) => "job_not_registered",
            ClusterError::Remote { .. } => "remote",
            ClusterError::RetriesExhausted { .. } => "retries_exhausted",
            ClusterError::Cancelled(_) => "cancelled",
            ClusterError::Io(_) => "io",
            ClusterError::Internal(_) => "internal",
        }
    }

    /// True if this error, or any error in its cause chain, signals that a
    /// node is shutting down.
    pub fn is_node_stopping(&self) -> bool {
        match self {
            ClusterError::NodeStopping(_) => true,
            ClusterError::RetriesExhausted { source, .. } => source.is_node_stopping(),
            _ => false,
        }
    }

    /// Whether a bounded retry may succeed where this attempt failed.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            ClusterError::Cancelled(_)
                | ClusterError::NodeStopping(_)
                | ClusterError::InvalidInput(_)
                | ClusterError::RetriesExhausted { .. }
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ClusterError::Timeout(_))
    }
}

impl From<std::io::Error> for ClusterError {
    fn from(err: std::io::Error) -> Self {
        ClusterError::Io(err.to_string())
    }
}

impl From<bincode::Error> for ClusterError {
    fn from(err: bincode::Error) -> Self {
        ClusterError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for ClusterError {
    fn from(err: toml::de::Error) -> Self {
        ClusterError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for ClusterError {
    fn from(err: toml::ser::Error) -> Self {
        ClusterError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ClusterError>;
