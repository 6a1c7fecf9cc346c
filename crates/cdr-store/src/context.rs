//! Per-context store
//!
//! Holds units for the isolation modes. Each unit is scoped to the loading
//! context it was requested under and is keyed by that context id. Missing
//! units are fetched from the sending node.

use crate::error::{Result, StoreError};
use crate::inflight::{FetchOutcome, InFlight};
use crate::store::{DeploymentStore, StoreKind};
use async_trait::async_trait;
use cdr_comm::DeploymentCommunication;
use cdr_types::{
    ContextId, DeploymentMetadata, DeploymentUnit, LoadingContext, NodeId, ObsoleteHook,
    ResourceHandle,
};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::FutureExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

struct ContextInner {
    node: NodeId,
    comm: Arc<DeploymentCommunication>,
    network_timeout: Duration,
    /// Keyed by the context id the unit was requested under
    units: DashMap<ContextId, Arc<DeploymentUnit>>,
    /// Unit context id -> key
    local_ids: DashMap<ContextId, ContextId>,
    in_flight: InFlight<ContextId>,
    started: AtomicBool,
}

impl ObsoleteHook for ContextInner {
    fn on_obsolete(&self, unit: &DeploymentUnit) {
        let id = unit.context_id();
        if let Some((_, key)) = self.local_ids.remove(&id) {
            self.units.remove_if(&key, |_, held| held.context_id() == id);
            debug!(context_id = %id, key = %key, "Removed obsolete per-context unit");
        }
    }
}

impl ContextInner {
    fn install(&self, key: ContextId, unit: Arc<DeploymentUnit>) -> Arc<DeploymentUnit> {
        match self.units.entry(key) {
            Entry::Occupied(entry) if entry.get().is_active() => return entry.get().clone(),
            Entry::Occupied(mut entry) => {
                entry.insert(unit.clone());
            }
            Entry::Vacant(entry) => {
                entry.insert(unit.clone());
            }
        }
        self.local_ids.insert(unit.context_id(), key);
        unit
    }

    async fn fetch(self: Arc<Self>, meta: DeploymentMetadata, key: ContextId) -> FetchOutcome {
        let sender = meta.sender();
        let bundle = match self
            .comm
            .fetch(sender, key, meta.class_name(), self.network_timeout)
            .await
        {
            Ok(bundle) => bundle,
            Err(e) => {
                warn!(
                    alias = %meta.alias(),
                    context_id = %key,
                    node = %sender,
                    mode = %meta.mode(),
                    error = %e,
                    "Failed to fetch per-context deployment"
                );
                return None;
            }
        };

        let unit = DeploymentUnit::builder(meta.mode(), meta.alias(), bundle.user_version)
            .resources(bundle.resources)
            .origin(sender, key)
            .parent(meta.parent())
            .on_obsolete(&self)
            .build();
        let unit = self.install(key, unit);

        info!(
            alias = %meta.alias(),
            context_id = %unit.context_id(),
            origin = %key,
            node = %sender,
            "Materialized per-context deployment"
        );
        Some(unit)
    }
}

/// Store for isolation-mode units
pub struct ContextStore {
    inner: Arc<ContextInner>,
}

impl ContextStore {
    pub fn new(node: NodeId, comm: Arc<DeploymentCommunication>, network_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                node,
                comm,
                network_timeout,
                units: DashMap::new(),
                local_ids: DashMap::new(),
                in_flight: InFlight::new(),
                started: AtomicBool::new(false),
            }),
        }
    }

    fn active(&self, key: &ContextId) -> Option<Arc<DeploymentUnit>> {
        self.inner
            .units
            .get(key)
            .map(|u| u.value().clone())
            .filter(|u| u.is_active())
    }

    fn all(&self) -> Vec<Arc<DeploymentUnit>> {
        self.inner.units.iter().map(|e| e.value().clone()).collect()
    }
}

#[async_trait]
impl DeploymentStore for ContextStore {
    fn kind(&self) -> StoreKind {
        StoreKind::PerContext
    }

    async fn start(&self) -> Result<()> {
        self.inner.started.store(true, Ordering::SeqCst);
        debug!(node = %self.inner.node, "Per-context store started");
        Ok(())
    }

    async fn stop(&self) {
        self.inner.started.store(false, Ordering::SeqCst);
        let units = self.all();
        for unit in &units {
            unit.undeploy();
        }
        self.inner.units.clear();
        self.inner.local_ids.clear();
        debug!(node = %self.inner.node, undeployed = units.len(), "Per-context store stopped");
    }

    fn get_by_context_id(&self, id: &ContextId) -> Option<Arc<DeploymentUnit>> {
        let key = self.inner.local_ids.get(id).map(|k| *k.value())?;
        self.active(&key).filter(|u| u.context_id() == *id)
    }

    #[instrument(skip(self, meta), fields(alias = %meta.alias(), node = %meta.sender()))]
    async fn get_by_metadata(&self, meta: &DeploymentMetadata) -> Option<Arc<DeploymentUnit>> {
        let Some(key) = meta.context_id() else {
            warn!(mode = %meta.mode(), "Per-context resolution without a context id");
            return None;
        };

        if let Some(unit) = self.active(&key) {
            return Some(unit);
        }
        if !self.inner.started.load(Ordering::SeqCst) {
            return None;
        }
        if meta.sender() == self.inner.node {
            debug!(context_id = %key, "Not fetching from the local node");
            return None;
        }
        if !meta.admits(&meta.sender()) {
            debug!(context_id = %key, "Sender excluded by node filter");
            return None;
        }

        let inner = self.inner.clone();
        let meta = meta.clone();
        self.inner
            .in_flight
            .run(key, move || inner.fetch(meta, key).boxed())
            .await
    }

    async fn explicit_deploy(
        &self,
        resource: &ResourceHandle,
        context: &LoadingContext,
    ) -> Result<Arc<DeploymentUnit>> {
        let LoadingContext::Cluster { id, mode } = *context else {
            return Err(StoreError::InvalidContext {
                store: "per-context",
                reason: "a cluster-managed context is required".into(),
            });
        };
        if !mode.is_per_context() {
            return Err(StoreError::InvalidContext {
                store: "per-context",
                reason: format!("context mode {} is a sharing mode", mode),
            });
        }

        let unit = DeploymentUnit::builder(mode, &resource.name, &resource.user_version)
            .context_id(id)
            .resources(resource.resources.clone())
            .on_obsolete(&self.inner)
            .build();
        Ok(self.inner.install(id, unit))
    }

    async fn explicit_undeploy(&self, node: Option<NodeId>, name: &str) -> usize {
        let local = self.inner.node;
        let doomed: Vec<Arc<DeploymentUnit>> = self
            .all()
            .into_iter()
            .filter(|u| u.matches_name(name))
            .filter(|u| match node {
                None => true,
                Some(n) => u.origin().map(|o| o.node).unwrap_or(local) == n,
            })
            .collect();

        let mut count = 0;
        for unit in doomed {
            if unit.schedule_undeploy() {
                count += 1;
                info!(alias = %name, context_id = %unit.context_id(), "Undeployed per-context unit");
            }
        }
        count
    }

    async fn on_node_left(&self, node: NodeId) {
        for unit in self.all() {
            if unit.origin().map(|o| o.node) == Some(node) && unit.schedule_undeploy() {
                info!(
                    node = %node,
                    context_id = %unit.context_id(),
                    alias = %unit.sample_resource(),
                    "Undeployed per-context unit of departed node"
                );
            }
        }
    }

    fn units(&self) -> Vec<Arc<DeploymentUnit>> {
        self.all().into_iter().filter(|u| u.is_active()).collect()
    }

    fn evict_idle(&self, max_idle: Duration) -> usize {
        let now = Instant::now();
        self.all()
            .into_iter()
            .filter(|u| u.idle_for(now).is_some_and(|idle| idle > max_idle))
            .filter(|u| u.schedule_undeploy())
            .inspect(|u| debug!(context_id = %u.context_id(), "Evicted idle per-context unit"))
            .count()
    }
}
