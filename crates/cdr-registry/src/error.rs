//! Registry error types

use cdr_comm::CommError;
use cdr_store::StoreError;
use cdr_types::{DeploymentMetadata, DeploymentMode, DeploymentUnit};
use std::fmt;
use thiserror::Error;

/// Registry errors
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Fatal at start
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Failed to load configuration: {0}")]
    Config(#[from] config::ConfigError),

    #[error(
        "Resource {resource} was loaded in {context_mode} mode but this node runs in {local_mode} mode"
    )]
    CrossModeConflict {
        resource: String,
        context_mode: DeploymentMode,
        local_mode: DeploymentMode,
    },

    #[error("Invalid deployment metadata: {0}")]
    InvalidMetadata(String),

    #[error("Registry not started")]
    NotStarted,

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Communication error: {0}")]
    Communication(#[from] CommError),
}

/// Result type for registry operations
pub type Result<T> = std::result::Result<T, RegistryError>;

/// Why a local reuse candidate was turned down. Never surfaced as an error;
/// the resolution returns not-found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveRejection {
    ModeMismatch {
        requested: DeploymentMode,
        found: DeploymentMode,
    },
    VersionMismatch {
        requested: String,
        found: String,
    },
}

impl ResolveRejection {
    /// A local unit may stand in for a sharing-mode request only if it is
    /// itself shared and carries the requested user version
    pub fn check(unit: &DeploymentUnit, meta: &DeploymentMetadata) -> std::result::Result<(), Self> {
        if !unit.mode().is_per_version() {
            return Err(ResolveRejection::ModeMismatch {
                requested: meta.mode(),
                found: unit.mode(),
            });
        }
        if unit.user_version() != meta.user_version() {
            return Err(ResolveRejection::VersionMismatch {
                requested: meta.user_version().to_string(),
                found: unit.user_version().to_string(),
            });
        }
        Ok(())
    }
}

impl fmt::Display for ResolveRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolveRejection::ModeMismatch { requested, found } => write!(
                f,
                "mode mismatch (requested {}, local unit is {})",
                requested, found
            ),
            ResolveRejection::VersionMismatch { requested, found } => write!(
                f,
                "version mismatch (requested {}, local unit is {})",
                requested, found
            ),
        }
    }
}
