//! The store capability contract

use crate::error::Result;
use async_trait::async_trait;
use cdr_types::{
    ContextId, DeploymentMetadata, DeploymentMode, DeploymentUnit, LoadingContext, NodeId,
    ResourceHandle,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// The three storage strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    /// Units from the node's own resource path
    Local,
    /// One unit per loading context (isolation modes)
    PerContext,
    /// One unit per alias and user version (sharing modes)
    PerVersion,
}

impl StoreKind {
    /// Store that serves cluster resolutions for `mode`
    pub fn for_mode(mode: DeploymentMode) -> Self {
        if mode.is_per_version() {
            StoreKind::PerVersion
        } else {
            StoreKind::PerContext
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StoreKind::Local => "local",
            StoreKind::PerContext => "per-context",
            StoreKind::PerVersion => "per-version",
        }
    }
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Capability set shared by every store.
///
/// Each store exclusively owns the units it materializes. Lookups never
/// return a unit that is pending undeploy or obsolete.
#[async_trait]
pub trait DeploymentStore: Send + Sync {
    fn kind(&self) -> StoreKind;

    async fn start(&self) -> Result<()>;

    /// Undeploy and drop every held unit
    async fn stop(&self);

    async fn on_cluster_start(&self) {}

    async fn on_cluster_stop(&self) {}

    fn get_by_context_id(&self, id: &ContextId) -> Option<Arc<DeploymentUnit>>;

    /// Resolve a request, materializing the unit when this store knows how
    async fn get_by_metadata(&self, meta: &DeploymentMetadata) -> Option<Arc<DeploymentUnit>>;

    async fn explicit_deploy(
        &self,
        resource: &ResourceHandle,
        context: &LoadingContext,
    ) -> Result<Arc<DeploymentUnit>>;

    /// Undeploy every unit for `name`, restricted to units tied to `node` when
    /// given. Returns the number of units scheduled for undeploy.
    async fn explicit_undeploy(&self, node: Option<NodeId>, name: &str) -> usize;

    async fn on_node_left(&self, _node: NodeId) {}

    /// Snapshot of the active units
    fn units(&self) -> Vec<Arc<DeploymentUnit>>;

    /// Undeploy units idle longer than `max_idle`; returns how many
    fn evict_idle(&self, _max_idle: Duration) -> usize {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_selection_by_mode() {
        assert_eq!(StoreKind::for_mode(DeploymentMode::Shared), StoreKind::PerVersion);
        assert_eq!(StoreKind::for_mode(DeploymentMode::Continuous), StoreKind::PerVersion);
        assert_eq!(StoreKind::for_mode(DeploymentMode::Private), StoreKind::PerContext);
        assert_eq!(StoreKind::for_mode(DeploymentMode::Isolated), StoreKind::PerContext);
    }
}
