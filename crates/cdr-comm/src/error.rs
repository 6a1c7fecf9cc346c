//! Communication error types

use cdr_types::NodeId;
use thiserror::Error;

/// Failure to hand a message to the cluster transport
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Node unreachable: {0}")]
    Unreachable(NodeId),

    #[error("Transport closed")]
    Closed,
}

/// Communication layer errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CommError {
    #[error("Fetch from {node} timed out after {timeout_ms}ms")]
    Timeout { node: NodeId, timeout_ms: u64 },

    #[error("Node left the cluster: {0}")]
    NodeLeft(NodeId),

    #[error("Communication layer stopped")]
    Stopped,

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Remote node refused request: {0}")]
    Remote(String),
}

/// Result type for communication operations
pub type Result<T> = std::result::Result<T, CommError>;
