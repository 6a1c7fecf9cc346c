//! Strongly-typed identifiers for CDR entities
//!
//! All IDs are UUID-based but wrapped in newtype structs for type safety.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a node in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(Uuid);

impl NodeId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node:{}", self.0)
    }
}

/// Identifier of a loading context.
///
/// Exactly one deployment unit exists per context id within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContextId(Uuid);

impl ContextId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Context id of the immortal unit a node materializes when peer loading
    /// is disabled. Derived from the node id so every process agrees on it.
    pub fn for_node(node: &NodeId) -> Self {
        Self(*node.as_uuid())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx:{}", self.0)
    }
}

/// Correlation id for a request/response exchange between nodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(Uuid);

impl RequestId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req:{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_id_generation() {
        let id1 = ContextId::generate();
        let id2 = ContextId::generate();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_node_context_id_is_stable() {
        let node = NodeId::generate();
        assert_eq!(ContextId::for_node(&node), ContextId::for_node(&node));
        assert_eq!(ContextId::for_node(&node).as_uuid(), node.as_uuid());
    }

    #[test]
    fn test_display_prefixes() {
        assert!(NodeId::generate().to_string().starts_with("node:"));
        assert!(ContextId::generate().to_string().starts_with("ctx:"));
        assert!(RequestId::generate().to_string().starts_with("req:"));
    }
}
