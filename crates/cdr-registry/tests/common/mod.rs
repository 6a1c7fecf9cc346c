//! Multi-node harness on the in-memory network

#![allow(dead_code)]

use cdr_comm::InMemoryNetwork;
use cdr_registry::{DeploymentRegistry, DeploymentRegistryBuilder, RegistryConfig};
use cdr_store::InMemoryResourceProvider;
use cdr_types::{
    ContextId, DeploymentMetadata, DeploymentMode, DeploymentUnit, LoadingContext, NodeId,
    ResourceHandle,
};
use std::sync::Arc;
use std::time::Duration;

pub struct TestNode {
    pub id: NodeId,
    pub registry: Arc<DeploymentRegistry>,
    pub provider: Arc<InMemoryResourceProvider>,
}

impl TestNode {
    /// Explicitly deploy `name` at `version` in the local store
    pub async fn deploy(&self, name: &str, version: &str, body: &'static [u8]) -> Arc<DeploymentUnit> {
        self.registry
            .deploy_explicit(&ResourceHandle::task(name, version, body), &LoadingContext::Local)
            .await
            .unwrap()
            .unwrap()
    }

    /// Request metadata as this node would send it for `unit`
    pub fn request_for(&self, unit: &DeploymentUnit) -> DeploymentMetadata {
        DeploymentMetadata::new(unit.sample_resource(), unit.mode(), self.id)
            .with_user_version(unit.user_version())
            .with_context_id(unit.context_id())
    }
}

pub struct TestCluster {
    pub network: InMemoryNetwork,
}

impl TestCluster {
    pub fn new() -> Self {
        Self {
            network: InMemoryNetwork::new(),
        }
    }

    pub async fn node(&self, mode: DeploymentMode) -> TestNode {
        self.node_with(RegistryConfig::for_mode(mode)).await
    }

    pub async fn node_with(&self, config: RegistryConfig) -> TestNode {
        let id = NodeId::generate();
        let provider = Arc::new(InMemoryResourceProvider::new());
        let registry = DeploymentRegistryBuilder::new(config)
            .with_communication(self.network.connect(id))
            .with_resource_provider(provider.clone())
            .build()
            .unwrap();
        registry.start().await.unwrap();
        TestNode {
            id,
            registry,
            provider,
        }
    }

    /// Remove `node` from the network and deliver the departure to `survivors`
    pub async fn leave(&self, node: &TestNode, survivors: &[&TestNode]) {
        self.network.leave(node.id);
        for survivor in survivors {
            survivor.registry.on_node_left(node.id).await;
        }
    }
}

/// Poll until `id` no longer resolves on `node`
pub async fn wait_until_gone(node: &TestNode, id: ContextId) -> bool {
    for _ in 0..100 {
        if node.registry.unit_by_context_id(&id).is_none() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
