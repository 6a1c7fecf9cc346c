//! Collaborator seams: cluster transport, topology and inbound handling

use crate::error::TransportError;
use crate::messages::{DeploymentMessage, FetchRequest};
use async_trait::async_trait;
use cdr_types::{NodeId, ResourceBundle};
use futures::future::join_all;

/// Point-to-point message delivery between nodes.
///
/// No ordering guarantee holds across destinations.
#[async_trait]
pub trait ClusterTransport: Send + Sync {
    /// Hand a message to the transport for delivery to `node`
    async fn send(&self, node: NodeId, message: DeploymentMessage) -> Result<(), TransportError>;

    /// Send to every node, returning the failed deliveries
    async fn broadcast(
        &self,
        nodes: &[NodeId],
        message: DeploymentMessage,
    ) -> Vec<(NodeId, TransportError)> {
        let sends = nodes.iter().map(|node| {
            let message = message.clone();
            async move { (*node, self.send(*node, message).await) }
        });

        join_all(sends)
            .await
            .into_iter()
            .filter_map(|(node, result)| result.err().map(|e| (node, e)))
            .collect()
    }
}

/// Membership view of the cluster
pub trait TopologyProvider: Send + Sync {
    fn local_node(&self) -> NodeId;

    fn live_nodes(&self) -> Vec<NodeId>;

    fn is_alive(&self, node: &NodeId) -> bool {
        self.live_nodes().contains(node)
    }
}

/// Receiver of inbound protocol requests, implemented by the registry
#[async_trait]
pub trait InboundHandler: Send + Sync {
    /// Answer a fetch request with the bundle of the requested unit
    async fn serve_fetch(&self, from: NodeId, request: &FetchRequest)
        -> Result<ResourceBundle, String>;

    /// A remote node asked this node to undeploy `resource_name`
    async fn on_undeploy(&self, from: NodeId, resource_name: &str);
}
