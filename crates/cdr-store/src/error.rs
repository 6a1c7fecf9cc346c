//! Store error types

use cdr_comm::CommError;
use thiserror::Error;

/// Store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    #[error("Invalid loading context for {store} store: {reason}")]
    InvalidContext {
        store: &'static str,
        reason: String,
    },

    #[error("Store not started: {0}")]
    NotStarted(&'static str),

    #[error("Communication error: {0}")]
    Communication(#[from] CommError),
}

/// Result type for store operations
pub type Result<T> = std::result::Result<T, StoreError>;
