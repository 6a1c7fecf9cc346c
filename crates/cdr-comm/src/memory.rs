//! In-process cluster network
//!
//! Joins several nodes in one process for development and testing. Delivery
//! is asynchronous (one spawned task per message), so it needs a tokio
//! runtime.

use crate::communication::DeploymentCommunication;
use crate::error::TransportError;
use crate::messages::DeploymentMessage;
use crate::transport::{ClusterTransport, TopologyProvider};
use async_trait::async_trait;
use cdr_types::NodeId;
use dashmap::{DashMap, DashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info};

#[derive(Default)]
struct NetworkInner {
    members: DashMap<NodeId, Option<Weak<DeploymentCommunication>>>,
    black_holed: DashSet<NodeId>,
    messages_sent: AtomicU64,
    fetch_requests: DashMap<NodeId, u64>,
    undeploy_notices: DashMap<NodeId, u64>,
}

/// Shared in-memory network
#[derive(Clone, Default)]
pub struct InMemoryNetwork {
    inner: Arc<NetworkInner>,
}

impl InMemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `node` to the membership and hand out its transport and topology
    pub fn join(&self, node: NodeId) -> (Arc<InMemoryTransport>, Arc<InMemoryTopology>) {
        self.inner.members.entry(node).or_insert(None);
        debug!(node = %node, "Node joined in-memory network");
        (
            Arc::new(InMemoryTransport {
                network: self.inner.clone(),
                local: node,
            }),
            Arc::new(InMemoryTopology {
                network: self.inner.clone(),
                local: node,
            }),
        )
    }

    /// Route messages addressed to `node` into `comm`
    pub fn attach(&self, node: NodeId, comm: &Arc<DeploymentCommunication>) {
        self.inner.members.insert(node, Some(Arc::downgrade(comm)));
    }

    /// Join `node` and build its communication layer in one step
    pub fn connect(&self, node: NodeId) -> Arc<DeploymentCommunication> {
        let (transport, topology) = self.join(node);
        let comm = Arc::new(DeploymentCommunication::new(transport, topology));
        self.attach(node, &comm);
        comm
    }

    /// Remove `node` and tell every remaining member it left
    pub fn leave(&self, node: NodeId) {
        if self.inner.members.remove(&node).is_none() {
            return;
        }
        info!(node = %node, "Node left in-memory network");

        let survivors: Vec<Arc<DeploymentCommunication>> = self
            .inner
            .members
            .iter()
            .filter_map(|entry| entry.value().as_ref().and_then(Weak::upgrade))
            .collect();
        for comm in survivors {
            comm.on_node_left(node);
        }
    }

    /// Silently drop every message addressed to `node`
    pub fn black_hole(&self, node: NodeId) {
        self.inner.black_holed.insert(node);
    }

    pub fn restore(&self, node: NodeId) {
        self.inner.black_holed.remove(&node);
    }

    pub fn members(&self) -> Vec<NodeId> {
        self.inner.members.iter().map(|e| *e.key()).collect()
    }

    pub fn messages_sent(&self) -> u64 {
        self.inner.messages_sent.load(Ordering::SeqCst)
    }

    /// Fetch requests addressed to `node`
    pub fn fetch_requests_to(&self, node: &NodeId) -> u64 {
        self.inner.fetch_requests.get(node).map(|c| *c).unwrap_or(0)
    }

    /// Undeploy notices addressed to `node`
    pub fn undeploy_notices_to(&self, node: &NodeId) -> u64 {
        self.inner.undeploy_notices.get(node).map(|c| *c).unwrap_or(0)
    }
}

/// One node's view of the transport
pub struct InMemoryTransport {
    network: Arc<NetworkInner>,
    local: NodeId,
}

#[async_trait]
impl ClusterTransport for InMemoryTransport {
    async fn send(&self, node: NodeId, message: DeploymentMessage) -> Result<(), TransportError> {
        let endpoint = self
            .network
            .members
            .get(&node)
            .map(|entry| entry.value().clone())
            .ok_or(TransportError::Unreachable(node))?;

        self.network.messages_sent.fetch_add(1, Ordering::SeqCst);
        match &message {
            DeploymentMessage::FetchRequest(_) => {
                *self.network.fetch_requests.entry(node).or_insert(0) += 1
            }
            DeploymentMessage::UndeployNotice { .. } => {
                *self.network.undeploy_notices.entry(node).or_insert(0) += 1
            }
            DeploymentMessage::FetchResponse { .. } => {}
        }

        if self.network.black_holed.contains(&node) {
            debug!(from = %self.local, to = %node, kind = message.kind(), "Message black-holed");
            return Ok(());
        }

        let comm = endpoint
            .and_then(|weak| weak.upgrade())
            .ok_or(TransportError::Unreachable(node))?;
        let from = self.local;
        tokio::spawn(async move {
            comm.on_message(from, message).await;
        });
        Ok(())
    }
}

/// One node's view of the membership
pub struct InMemoryTopology {
    network: Arc<NetworkInner>,
    local: NodeId,
}

impl TopologyProvider for InMemoryTopology {
    fn local_node(&self) -> NodeId {
        self.local
    }

    fn live_nodes(&self) -> Vec<NodeId> {
        self.network.members.iter().map(|e| *e.key()).collect()
    }

    fn is_alive(&self, node: &NodeId) -> bool {
        self.network.members.contains_key(node)
    }
}
