//! Deployment communication layer
//!
//! Correlates fetch requests with their responses, bounds each fetch by a
//! timeout and fans undeploy notices out to remote nodes. Nothing here
//! retries; callers treat a failed fetch as not-found.

use crate::error::{CommError, Result};
use crate::messages::{DeploymentMessage, FetchRequest};
use crate::transport::{ClusterTransport, InboundHandler, TopologyProvider};
use cdr_types::{ContextId, NodeId, RequestId, ResourceBundle};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, instrument, warn};

struct PendingFetch {
    node: NodeId,
    tx: oneshot::Sender<Result<ResourceBundle>>,
}

/// Removes a pending fetch entry on every exit from `fetch`, including
/// when the caller drops the future
struct PendingGuard<'a> {
    pending: &'a DashMap<RequestId, PendingFetch>,
    request_id: RequestId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.request_id);
    }
}

struct RegisteredHandler {
    token: u64,
    handler: Weak<dyn InboundHandler>,
}

/// Request/response and broadcast plumbing over a [`ClusterTransport`]
pub struct DeploymentCommunication {
    transport: Arc<dyn ClusterTransport>,
    topology: Arc<dyn TopologyProvider>,
    pending: DashMap<RequestId, PendingFetch>,
    accepting: AtomicBool,
    handler: RwLock<Option<RegisteredHandler>>,
    next_token: AtomicU64,
}

impl DeploymentCommunication {
    pub fn new(transport: Arc<dyn ClusterTransport>, topology: Arc<dyn TopologyProvider>) -> Self {
        Self {
            transport,
            topology,
            pending: DashMap::new(),
            accepting: AtomicBool::new(false),
            handler: RwLock::new(None),
            next_token: AtomicU64::new(1),
        }
    }

    pub fn local_node(&self) -> NodeId {
        self.topology.local_node()
    }

    pub fn topology(&self) -> &Arc<dyn TopologyProvider> {
        &self.topology
    }

    /// Start accepting new fetches and inbound requests
    pub fn start(&self) {
        self.accepting.store(true, Ordering::SeqCst);
        info!(node = %self.local_node(), "Deployment communication started");
    }

    /// Stop accepting new fetches. In-flight fetches are left to complete or
    /// fail on their own.
    pub fn stop(&self) {
        self.accepting.store(false, Ordering::SeqCst);
        info!(
            node = %self.local_node(),
            in_flight = self.pending.len(),
            "Deployment communication stopped"
        );
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Number of fetches awaiting a response
    pub fn pending_fetches(&self) -> usize {
        self.pending.len()
    }

    /// Route inbound requests to `handler` until the returned guard drops
    pub fn register(self: &Arc<Self>, handler: Weak<dyn InboundHandler>) -> HandlerRegistration {
        let token = self.next_token.fetch_add(1, Ordering::SeqCst);
        *self.handler.write() = Some(RegisteredHandler { token, handler });
        debug!(node = %self.local_node(), token, "Inbound handler registered");
        HandlerRegistration {
            comm: Arc::downgrade(self),
            token,
        }
    }

    fn deregister(&self, token: u64) {
        let mut slot = self.handler.write();
        if slot.as_ref().map(|h| h.token) == Some(token) {
            *slot = None;
            debug!(node = %self.local_node(), token, "Inbound handler deregistered");
        }
    }

    pub fn has_handler(&self) -> bool {
        self.current_handler().is_some()
    }

    fn current_handler(&self) -> Option<Arc<dyn InboundHandler>> {
        self.handler.read().as_ref().and_then(|h| h.handler.upgrade())
    }

    /// Fetch the bundle of `context_id` from `target`
    #[instrument(skip(self, timeout), fields(node = %target, context_id = %context_id))]
    pub async fn fetch(
        &self,
        target: NodeId,
        context_id: ContextId,
        resource_name: &str,
        timeout: Duration,
    ) -> Result<ResourceBundle> {
        if !self.is_accepting() {
            return Err(CommError::Stopped);
        }
        if !self.topology.is_alive(&target) {
            return Err(CommError::NodeLeft(target));
        }

        let request_id = RequestId::generate();
        let (tx, rx) = oneshot::channel();
        self.pending
            .insert(request_id, PendingFetch { node: target, tx });
        let _guard = PendingGuard {
            pending: &self.pending,
            request_id,
        };

        let request = DeploymentMessage::FetchRequest(FetchRequest {
            request_id,
            context_id,
            resource_name: resource_name.to_string(),
        });

        if let Err(e) = self.transport.send(target, request).await {
            warn!(resource = %resource_name, error = %e, "Failed to send fetch request");
            return Err(e.into());
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            // Sender dropped without an answer
            Ok(Err(_)) => Err(CommError::NodeLeft(target)),
            Err(_) => {
                let timeout_ms = timeout.as_millis() as u64;
                warn!(resource = %resource_name, timeout_ms, "Fetch timed out");
                Err(CommError::Timeout {
                    node: target,
                    timeout_ms,
                })
            }
        }
    }

    /// Notify `nodes` to undeploy `resource_name`. The local node is always
    /// skipped and failures are only logged.
    ///
    /// Returns the number of nodes the notice was handed to.
    #[instrument(skip(self, nodes))]
    pub async fn broadcast_undeploy(&self, nodes: &[NodeId], resource_name: &str) -> usize {
        let local = self.local_node();
        let targets: Vec<NodeId> = nodes.iter().copied().filter(|n| *n != local).collect();
        if targets.is_empty() {
            return 0;
        }

        let failures = self
            .transport
            .broadcast(
                &targets,
                DeploymentMessage::UndeployNotice {
                    resource_name: resource_name.to_string(),
                },
            )
            .await;

        for (node, error) in &failures {
            warn!(node = %node, resource = %resource_name, error = %error, "Failed to send undeploy notice");
        }

        targets.len() - failures.len()
    }

    /// Dispatch one inbound message
    pub async fn on_message(&self, from: NodeId, message: DeploymentMessage) {
        match message {
            DeploymentMessage::FetchRequest(request) => self.serve_fetch(from, request).await,
            DeploymentMessage::FetchResponse { request_id, result } => {
                self.complete_fetch(from, request_id, result)
            }
            DeploymentMessage::UndeployNotice { resource_name } => {
                match self.current_handler() {
                    Some(handler) => handler.on_undeploy(from, &resource_name).await,
                    None => {
                        debug!(from = %from, resource = %resource_name, "Undeploy notice with no handler registered")
                    }
                }
            }
        }
    }

    async fn serve_fetch(&self, from: NodeId, request: FetchRequest) {
        let result = if !self.is_accepting() {
            Err("node is not accepting deployment requests".to_string())
        } else {
            match self.current_handler() {
                Some(handler) => handler.serve_fetch(from, &request).await,
                None => Err("no deployment handler registered".to_string()),
            }
        };

        if let Err(reason) = &result {
            debug!(
                from = %from,
                context_id = %request.context_id,
                resource = %request.resource_name,
                reason = %reason,
                "Refusing fetch request"
            );
        }

        let response = DeploymentMessage::FetchResponse {
            request_id: request.request_id,
            result,
        };
        if let Err(e) = self.transport.send(from, response).await {
            warn!(node = %from, error = %e, "Failed to send fetch response");
        }
    }

    fn complete_fetch(
        &self,
        from: NodeId,
        request_id: RequestId,
        result: std::result::Result<ResourceBundle, String>,
    ) {
        match self.pending.remove_if(&request_id, |_, pending| pending.node == from) {
            Some((_, pending)) => {
                let _ = pending.tx.send(result.map_err(CommError::Remote));
            }
            None => {
                debug!(from = %from, request_id = %request_id, "Dropping unmatched fetch response")
            }
        }
    }

    /// Abort every pending fetch that targets `node`
    pub fn on_node_left(&self, node: NodeId) -> usize {
        let doomed: Vec<RequestId> = self
            .pending
            .iter()
            .filter(|entry| entry.value().node == node)
            .map(|entry| *entry.key())
            .collect();

        let mut aborted = 0;
        for request_id in doomed {
            if let Some((_, pending)) = self.pending.remove(&request_id) {
                let _ = pending.tx.send(Err(CommError::NodeLeft(node)));
                aborted += 1;
            }
        }

        if aborted > 0 {
            info!(node = %node, aborted, "Aborted fetches to departed node");
        }
        aborted
    }
}

/// Keeps an inbound handler registered; deregisters on drop
#[must_use = "the handler is deregistered when the registration is dropped"]
pub struct HandlerRegistration {
    comm: Weak<DeploymentCommunication>,
    token: u64,
}

impl HandlerRegistration {
    /// Deregister now
    pub fn release(self) {}
}

impl Drop for HandlerRegistration {
    fn drop(&mut self) {
        if let Some(comm) = self.comm.upgrade() {
            comm.deregister(self.token);
        }
    }
}
