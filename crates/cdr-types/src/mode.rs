//! Deployment modes
//!
//! A node's configured mode is fixed for its process lifetime. `Shared` and
//! `Continuous` form the per-version family (one unit per alias and user
//! version, shared cluster-wide). `Private` and `Isolated` form the
//! per-context family (one unit per loading context).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// How deployed units are shared across the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentMode {
    /// One unit per loading context, visible only to that context
    Private,
    /// One unit per loading context, shared by tasks of that context
    Isolated,
    /// One unit per alias and user version; undeployed when the version is
    /// superseded or all remote participants leave
    Shared,
    /// Like `Shared`, but units survive participant departure and new versions
    Continuous,
}

impl DeploymentMode {
    pub const ALL: [DeploymentMode; 4] = [
        DeploymentMode::Private,
        DeploymentMode::Isolated,
        DeploymentMode::Shared,
        DeploymentMode::Continuous,
    ];

    /// True for the sharing modes (`Shared`, `Continuous`)
    pub fn is_per_version(&self) -> bool {
        matches!(self, DeploymentMode::Shared | DeploymentMode::Continuous)
    }

    /// True for the isolation modes (`Private`, `Isolated`)
    pub fn is_per_context(&self) -> bool {
        !self.is_per_version()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentMode::Private => "private",
            DeploymentMode::Isolated => "isolated",
            DeploymentMode::Shared => "shared",
            DeploymentMode::Continuous => "continuous",
        }
    }
}

impl fmt::Display for DeploymentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unknown deployment mode string
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Unknown deployment mode: {0}")]
pub struct ParseModeError(pub String);

impl FromStr for DeploymentMode {
    type Err = ParseModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "private" => Ok(DeploymentMode::Private),
            "isolated" => Ok(DeploymentMode::Isolated),
            "shared" => Ok(DeploymentMode::Shared),
            "continuous" => Ok(DeploymentMode::Continuous),
            other => Err(ParseModeError(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_families_partition() {
        for mode in DeploymentMode::ALL {
            assert_ne!(mode.is_per_version(), mode.is_per_context());
        }
        assert!(DeploymentMode::Shared.is_per_version());
        assert!(DeploymentMode::Continuous.is_per_version());
        assert!(DeploymentMode::Private.is_per_context());
        assert!(DeploymentMode::Isolated.is_per_context());
    }

    #[test]
    fn test_parse_mode() {
        assert_eq!("Continuous".parse::<DeploymentMode>(), Ok(DeploymentMode::Continuous));
        assert_eq!(" isolated ".parse::<DeploymentMode>(), Ok(DeploymentMode::Isolated));
        assert!("global".parse::<DeploymentMode>().is_err());
    }

    #[test]
    fn test_serde_lowercase() {
        let json = serde_json::to_string(&DeploymentMode::Shared).unwrap();
        assert_eq!(json, "\"shared\"");
        let mode: DeploymentMode = serde_json::from_str("\"private\"").unwrap();
        assert_eq!(mode, DeploymentMode::Private);
    }
}
