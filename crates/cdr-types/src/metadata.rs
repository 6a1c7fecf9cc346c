//! Resolution request descriptor

use crate::ids::{ContextId, NodeId};
use crate::mode::DeploymentMode;
use crate::participants::ParticipantMap;
use std::fmt;
use std::sync::Arc;

/// Predicate scoping which nodes may serve or see a deployment unit
#[derive(Clone)]
pub struct NodeFilter(Arc<dyn Fn(&NodeId) -> bool + Send + Sync>);

impl NodeFilter {
    pub fn new(predicate: impl Fn(&NodeId) -> bool + Send + Sync + 'static) -> Self {
        Self(Arc::new(predicate))
    }

    /// Filter admitting only the given nodes
    pub fn only(nodes: impl IntoIterator<Item = NodeId>) -> Self {
        let nodes: Vec<NodeId> = nodes.into_iter().collect();
        Self::new(move |node| nodes.contains(node))
    }

    pub fn accepts(&self, node: &NodeId) -> bool {
        (self.0)(node)
    }
}

impl fmt::Debug for NodeFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("NodeFilter(..)")
    }
}

/// Describes one resolution request.
///
/// Constructed per request with the chained setters below, then handed to a
/// store by shared reference.
#[derive(Debug, Clone)]
pub struct DeploymentMetadata {
    alias: String,
    class_name: String,
    user_version: String,
    mode: DeploymentMode,
    sender: NodeId,
    context_id: Option<ContextId>,
    participants: Option<ParticipantMap>,
    node_filter: Option<NodeFilter>,
    record: bool,
    parent: Option<ContextId>,
}

impl DeploymentMetadata {
    /// New request for `alias` under `mode`, sent by `sender`.
    ///
    /// The class name defaults to the alias and the user version to `"0"`.
    pub fn new(alias: impl Into<String>, mode: DeploymentMode, sender: NodeId) -> Self {
        let alias = alias.into();
        Self {
            class_name: alias.clone(),
            alias,
            user_version: "0".to_string(),
            mode,
            sender,
            context_id: None,
            participants: None,
            node_filter: None,
            record: false,
            parent: None,
        }
    }

    pub fn with_class_name(mut self, class_name: impl Into<String>) -> Self {
        self.class_name = class_name.into();
        self
    }

    pub fn with_user_version(mut self, user_version: impl Into<String>) -> Self {
        self.user_version = user_version.into();
        self
    }

    pub fn with_mode(mut self, mode: DeploymentMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_context_id(mut self, context_id: ContextId) -> Self {
        self.context_id = Some(context_id);
        self
    }

    pub fn with_participants(mut self, participants: ParticipantMap) -> Self {
        self.participants = Some(participants);
        self
    }

    pub fn with_node_filter(mut self, filter: NodeFilter) -> Self {
        self.node_filter = Some(filter);
        self
    }

    pub fn with_record(mut self, record: bool) -> Self {
        self.record = record;
        self
    }

    pub fn with_parent(mut self, parent: ContextId) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    pub fn user_version(&self) -> &str {
        &self.user_version
    }

    pub fn mode(&self) -> DeploymentMode {
        self.mode
    }

    pub fn sender(&self) -> NodeId {
        self.sender
    }

    pub fn context_id(&self) -> Option<ContextId> {
        self.context_id
    }

    pub fn participants(&self) -> Option<&ParticipantMap> {
        self.participants.as_ref()
    }

    pub fn node_filter(&self) -> Option<&NodeFilter> {
        self.node_filter.as_ref()
    }

    /// Whether the resolution should be recorded in the store for later
    /// undeploy propagation
    pub fn record(&self) -> bool {
        self.record
    }

    pub fn parent(&self) -> Option<ContextId> {
        self.parent
    }

    /// True when the node filter (if any) admits `node`
    pub fn admits(&self, node: &NodeId) -> bool {
        self.node_filter
            .as_ref()
            .map(|f| f.accepts(node))
            .unwrap_or(true)
    }

    /// Checks the fields every resolution needs
    pub fn validate(&self) -> Result<(), String> {
        if self.alias.trim().is_empty() {
            return Err("alias must not be empty".into());
        }
        if self.class_name.trim().is_empty() {
            return Err("class name must not be empty".into());
        }
        if self.mode.is_per_version() && self.user_version.trim().is_empty() {
            return Err(format!("user version is required in {} mode", self.mode));
        }
        Ok(())
    }
}

impl fmt::Display for DeploymentMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[alias={}, class={}, version={}, mode={}, sender={}",
            self.alias, self.class_name, self.user_version, self.mode, self.sender
        )?;
        if let Some(ctx) = self.context_id {
            write!(f, ", context={}", ctx)?;
        }
        write!(f, ", record={}]", self.record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let sender = NodeId::generate();
        let meta = DeploymentMetadata::new("Task1", DeploymentMode::Shared, sender);
        assert_eq!(meta.class_name(), "Task1");
        assert_eq!(meta.sender(), sender);
        assert!(!meta.record());
        assert!(meta.admits(&NodeId::generate()));
        assert!(meta.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_empty_alias() {
        let meta = DeploymentMetadata::new(" ", DeploymentMode::Private, NodeId::generate());
        assert!(meta.validate().is_err());
    }

    #[test]
    fn test_validation_requires_version_for_sharing_modes() {
        let meta = DeploymentMetadata::new("Task1", DeploymentMode::Continuous, NodeId::generate())
            .with_user_version("");
        assert!(meta.validate().is_err());
        assert!(meta.with_mode(DeploymentMode::Isolated).validate().is_ok());
    }

    #[test]
    fn test_node_filter() {
        let allowed = NodeId::generate();
        let meta = DeploymentMetadata::new("Task1", DeploymentMode::Shared, allowed)
            .with_node_filter(NodeFilter::only([allowed]));
        assert!(meta.admits(&allowed));
        assert!(!meta.admits(&NodeId::generate()));
    }
}
