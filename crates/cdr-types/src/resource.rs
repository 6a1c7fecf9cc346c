//! Deployed resources and the contexts they are loaded under

use crate::ids::ContextId;
use crate::mode::DeploymentMode;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// What a deployed resource represents to the execution engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    /// An invocable task definition
    Task,
    /// A supporting class
    Class,
    /// Any other named resource
    Resource,
}

/// One named resource with its raw content
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployedResource {
    pub name: String,
    pub kind: ResourceKind,
    pub content: Bytes,
}

impl DeployedResource {
    pub fn new(name: impl Into<String>, kind: ResourceKind, content: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            kind,
            content: content.into(),
        }
    }

    pub fn task(name: impl Into<String>, content: impl Into<Bytes>) -> Self {
        Self::new(name, ResourceKind::Task, content)
    }

    pub fn is_task(&self) -> bool {
        self.kind == ResourceKind::Task
    }
}

/// Logical name -> resource
pub type ResourceMap = BTreeMap<String, DeployedResource>;

/// The context a resource was loaded under.
///
/// `Local` is the node's own resource path. `Cluster` is a context
/// materialized by the registry, carrying the mode it was created for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LoadingContext {
    Local,
    Cluster { id: ContextId, mode: DeploymentMode },
}

impl LoadingContext {
    pub fn cluster(id: ContextId, mode: DeploymentMode) -> Self {
        LoadingContext::Cluster { id, mode }
    }

    /// Context id, present only for registry-managed contexts
    pub fn context_id(&self) -> Option<ContextId> {
        match self {
            LoadingContext::Local => None,
            LoadingContext::Cluster { id, .. } => Some(*id),
        }
    }

    pub fn is_cluster_managed(&self) -> bool {
        matches!(self, LoadingContext::Cluster { .. })
    }
}

/// A resource set submitted for explicit deployment by this node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceHandle {
    /// Primary resource name; also the alias the unit is registered under
    pub name: String,
    pub user_version: String,
    pub resources: ResourceMap,
    /// Internal resources are exempt from the cross-mode safety check
    #[serde(default)]
    pub internal: bool,
}

impl ResourceHandle {
    /// Handle for a single task resource
    pub fn task(
        name: impl Into<String>,
        user_version: impl Into<String>,
        content: impl Into<Bytes>,
    ) -> Self {
        let name = name.into();
        let mut resources = ResourceMap::new();
        resources.insert(name.clone(), DeployedResource::task(name.clone(), content));
        Self {
            name,
            user_version: user_version.into(),
            resources,
            internal: false,
        }
    }

    /// Add a supporting resource
    pub fn with_resource(mut self, resource: DeployedResource) -> Self {
        self.resources.insert(resource.name.clone(), resource);
        self
    }

    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }
}

/// Everything needed to materialize a unit on another node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceBundle {
    pub mode: DeploymentMode,
    pub user_version: String,
    pub sample_resource: String,
    pub resources: ResourceMap,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loading_context_identity() {
        let id = ContextId::generate();
        let ctx = LoadingContext::cluster(id, DeploymentMode::Isolated);
        assert_eq!(ctx.context_id(), Some(id));
        assert!(ctx.is_cluster_managed());
        assert_eq!(LoadingContext::Local.context_id(), None);
        assert!(!LoadingContext::Local.is_cluster_managed());
    }

    #[test]
    fn test_task_handle() {
        let handle = ResourceHandle::task("Task1", "v1", &b"body"[..])
            .with_resource(DeployedResource::new("Helper", ResourceKind::Class, &b"h"[..]));
        assert_eq!(handle.resources.len(), 2);
        assert!(handle.resources["Task1"].is_task());
        assert!(!handle.resources["Helper"].is_task());
        assert!(!handle.internal);
    }
}
