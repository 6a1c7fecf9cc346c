//! Deployment Registry - cluster-aware resolution and lifecycle
//!
//! The registry is the public entry point. It routes each request to the
//! store that owns it, based on deployment mode, and enforces the rules that
//! keep sharing and isolation semantics consistent across nodes. Units are
//! only ever changed through store operations.

use crate::config::RegistryConfig;
use crate::error::{RegistryError, ResolveRejection, Result};
use crate::exclusions::LocalExclusions;
use async_trait::async_trait;
use cdr_comm::{DeploymentCommunication, FetchRequest, HandlerRegistration, InboundHandler};
use cdr_store::{
    ContextStore, DeploymentStore, LocalStore, ResourceProvider, StoreKind, VersionStore,
};
use cdr_types::{
    ContextId, DeployedResource, DeploymentMetadata, DeploymentMode, DeploymentUnit,
    LoadingContext, NodeId, ParticipantMap, ResourceBundle, ResourceHandle, ResourceMap,
    UnitState,
};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

/// Sample resource name of the immortal unit
pub const IMMORTAL_SAMPLE_RESOURCE: &str = "cdr.local";

/// Cluster deployment registry for one node
pub struct DeploymentRegistry {
    node: NodeId,
    mode: DeploymentMode,
    config: RegistryConfig,
    exclusions: LocalExclusions,
    comm: Arc<DeploymentCommunication>,
    provider: Arc<dyn ResourceProvider>,
    local_store: LocalStore,
    context_store: ContextStore,
    version_store: VersionStore,
    /// Set when peer loading is off and deployment is static
    immortal: RwLock<Option<Arc<DeploymentUnit>>>,
    registration: Mutex<Option<HandlerRegistration>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
}

impl DeploymentRegistry {
    pub(crate) fn new(
        config: RegistryConfig,
        mode: DeploymentMode,
        comm: Arc<DeploymentCommunication>,
        provider: Arc<dyn ResourceProvider>,
    ) -> Self {
        let node = comm.local_node();
        let timeout = config.network_timeout();
        Self {
            node,
            mode,
            exclusions: LocalExclusions::new(&config.local_exclusions),
            local_store: LocalStore::new(node, mode, provider.clone()),
            context_store: ContextStore::new(node, comm.clone(), timeout),
            version_store: VersionStore::new(node, comm.clone(), timeout),
            config,
            comm,
            provider,
            immortal: RwLock::new(None),
            registration: Mutex::new(None),
            sweeper: Mutex::new(None),
            started: AtomicBool::new(false),
        }
    }

    pub fn local_node(&self) -> NodeId {
        self.node
    }

    pub fn mode(&self) -> DeploymentMode {
        self.mode
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn communication(&self) -> &Arc<DeploymentCommunication> {
        &self.comm
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// False when this node serves everything from its immortal unit
    pub fn is_enabled(&self) -> bool {
        self.immortal.read().is_none()
    }

    fn immortal(&self) -> Option<Arc<DeploymentUnit>> {
        self.immortal.read().clone()
    }

    /// Stores in start order
    fn stores(&self) -> [&dyn DeploymentStore; 3] {
        [&self.local_store, &self.context_store, &self.version_store]
    }

    /// Store owning cluster resolutions of the given kind
    fn cluster_store(&self, kind: StoreKind) -> &dyn DeploymentStore {
        match kind {
            StoreKind::Local => &self.local_store,
            StoreKind::PerContext => &self.context_store,
            StoreKind::PerVersion => &self.version_store,
        }
    }

    // ---- Lifecycle ----

    /// Register the inbound handler, start communication and the stores, and
    /// begin idle sweeping
    #[instrument(skip(self), fields(node = %self.node, mode = %self.mode))]
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        // 1. Route inbound protocol messages here
        let this: Arc<dyn InboundHandler> = self.clone();
        let weak: Weak<dyn InboundHandler> = Arc::downgrade(&this);
        *self.registration.lock() = Some(self.comm.register(weak));

        // 2. Communication, then stores in order
        self.comm.start();
        for store in self.stores() {
            if let Err(e) = store.start().await {
                self.started.store(false, Ordering::SeqCst);
                self.registration.lock().take();
                return Err(e.into());
            }
        }

        // 3. Immortal unit
        if self.config.uses_immortal_unit() {
            let unit = self.build_immortal().await;
            info!(context_id = %unit.context_id(), resources = unit.resources().len(), "Serving from local deployment only");
            *self.immortal.write() = Some(unit);
        }

        // 4. Idle sweeper
        if let (Some(max_idle), true) = (self.config.idle_timeout(), self.is_enabled()) {
            *self.sweeper.lock() = Some(self.spawn_sweeper(max_idle));
        }

        info!(peer_loading = self.config.peer_loading_enabled, "Deployment registry started");
        Ok(())
    }

    /// Stop accepting requests, drain the stores in reverse start order and
    /// release the inbound handler
    #[instrument(skip(self), fields(node = %self.node))]
    pub async fn stop(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }

        if let Some(sweeper) = self.sweeper.lock().take() {
            sweeper.abort();
        }

        self.comm.stop();
        for store in self.stores().into_iter().rev() {
            store.stop().await;
        }
        self.registration.lock().take();

        info!("Deployment registry stopped");
    }

    pub async fn on_cluster_start(&self) {
        for store in self.stores() {
            store.on_cluster_start().await;
        }
    }

    pub async fn on_cluster_stop(&self) {
        for store in self.stores().into_iter().rev() {
            store.on_cluster_stop().await;
        }
    }

    /// Abort fetches to `node` and drop units that depended on it
    pub async fn on_node_left(&self, node: NodeId) {
        self.comm.on_node_left(node);
        self.context_store.on_node_left(node).await;
        self.version_store.on_node_left(node).await;
    }

    async fn build_immortal(&self) -> Arc<DeploymentUnit> {
        let mut resources = ResourceMap::new();
        for name in self.provider.list() {
            if let Some(provided) = self.provider.load(&name).await {
                resources.insert(
                    name.clone(),
                    DeployedResource::new(name, provided.kind, provided.content),
                );
            }
        }
        DeploymentUnit::immortal(
            self.mode,
            &self.node,
            "0",
            IMMORTAL_SAMPLE_RESOURCE,
            resources,
        )
    }

    fn spawn_sweeper(self: &Arc<Self>, max_idle: std::time::Duration) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let period = self.config.sweep_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // First tick fires immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(registry) = weak.upgrade() else {
                    break;
                };
                registry.sweep_idle(max_idle);
            }
        })
    }

    /// Evict per-context and per-version units idle longer than `max_idle`
    pub fn sweep_idle(&self, max_idle: std::time::Duration) -> usize {
        let evicted =
            self.context_store.evict_idle(max_idle) + self.version_store.evict_idle(max_idle);
        if evicted > 0 {
            info!(evicted, "Evicted idle deployments");
        }
        evicted
    }

    // ---- Queries ----

    /// Task resources matching `predicate`, by name
    pub fn find_all_units<P>(&self, predicate: P) -> BTreeMap<String, DeployedResource>
    where
        P: Fn(&DeployedResource) -> bool,
    {
        let units = match self.immortal() {
            Some(unit) => vec![unit],
            None => self.local_store.units(),
        };

        let mut tasks = BTreeMap::new();
        for unit in units {
            for task in unit.tasks().filter(|t| predicate(t)) {
                tasks.insert(task.name.clone(), task.clone());
            }
        }
        tasks
    }

    /// Resolve from the local resource path only; never fetches
    pub async fn resolve_local(&self, name: &str) -> Option<Arc<DeploymentUnit>> {
        if let Some(unit) = self.immortal() {
            return Some(unit);
        }
        let meta = DeploymentMetadata::new(name, self.mode, self.node).with_record(true);
        self.local_store.get_by_metadata(&meta).await
    }

    /// Local resolution, falling back to the unit behind the caller's current
    /// cluster context
    pub async fn resolve_in_context(
        &self,
        name: &str,
        current: &LoadingContext,
    ) -> Option<Arc<DeploymentUnit>> {
        if let Some(unit) = self.resolve_local(name).await {
            return Some(unit);
        }
        let id = current.context_id()?;
        self.context_store
            .get_by_context_id(&id)
            .or_else(|| self.version_store.get_by_context_id(&id))
    }

    /// Unit with context id `id` in the local store
    pub fn local_unit_by_context_id(&self, id: &ContextId) -> Option<Arc<DeploymentUnit>> {
        if let Some(unit) = self.immortal() {
            return (unit.context_id() == *id).then_some(unit);
        }
        self.local_store.get_by_context_id(id)
    }

    /// Unit with context id `id` in any store
    pub fn unit_by_context_id(&self, id: &ContextId) -> Option<Arc<DeploymentUnit>> {
        if let Some(unit) = self.immortal() {
            return (unit.context_id() == *id).then_some(unit);
        }
        self.stores()
            .into_iter()
            .find_map(|store| store.get_by_context_id(id))
    }

    /// Cluster-aware resolution
    #[instrument(skip(self, meta), fields(alias = %meta.alias(), mode = %meta.mode(), node = %meta.sender()))]
    pub async fn resolve_global(&self, meta: DeploymentMetadata) -> Option<Arc<DeploymentUnit>> {
        // 1. Immortal unit wins unconditionally
        if let Some(unit) = self.immortal() {
            return Some(unit);
        }

        // 2. Validate the request
        if let Err(reason) = meta.validate() {
            warn!(meta = %meta, reason = %reason, "Rejecting invalid deployment metadata");
            return None;
        }

        // 3. Local resources only
        if !self.config.peer_loading_enabled {
            return self.local_store.get_by_metadata(&meta.with_record(true)).await;
        }

        if meta.mode().is_per_version() {
            self.resolve_shared(meta.with_record(true)).await
        } else {
            self.resolve_isolated(meta).await
        }
    }

    /// 4. Sharing modes: reuse a compatible local unit, else go to the cluster
    async fn resolve_shared(&self, meta: DeploymentMetadata) -> Option<Arc<DeploymentUnit>> {
        let reuse = meta.sender() == self.node
            || !self.exclusions.excludes(meta.alias(), meta.class_name());
        if !reuse {
            debug!(meta = %meta, "Local reuse excluded by pattern");
        }

        if reuse {
            let mut candidate = self.local_store.get_by_metadata(&meta).await;
            if candidate.is_none() {
                if let Some(ctx) = meta.participants().and_then(|p| p.get(&self.node)) {
                    candidate = self.local_store.get_by_context_id(ctx);
                }
            }

            if let Some(local) = candidate {
                return match ResolveRejection::check(&local, &meta) {
                    Ok(()) => {
                        debug!(context_id = %local.context_id(), "Reusing local deployment");
                        Some(local)
                    }
                    Err(rejection) => {
                        warn!(
                            alias = %meta.alias(),
                            class = %meta.class_name(),
                            context_id = %local.context_id(),
                            node = %meta.sender(),
                            rejection = %rejection,
                            "Refusing to reuse local deployment"
                        );
                        None
                    }
                };
            }
        }

        self.cluster_store(StoreKind::for_mode(meta.mode()))
            .get_by_metadata(&meta)
            .await
    }

    /// 5. Isolation modes: nested execution, else the sender's context
    async fn resolve_isolated(&self, meta: DeploymentMetadata) -> Option<Arc<DeploymentUnit>> {
        let meta = meta.with_record(false);
        let local = self.local_store.get_by_metadata(&meta).await;

        if meta.sender() == self.node {
            if local.is_none() {
                warn!(meta = %meta, "Unit undeployed while resolution was in progress");
            }
            return local;
        }

        let mut meta = meta.with_record(true);
        if let Some(parent) = &local {
            meta = meta.with_parent(parent.context_id());
        }

        self.cluster_store(StoreKind::for_mode(meta.mode()))
            .get_by_metadata(&meta)
            .await
    }

    // ---- Deployment ----

    /// Register a resource set deployed by this node.
    ///
    /// Resources loaded under a cluster context resolve to the unit already
    /// serving that context (nested execution), if any.
    #[instrument(skip(self, resource), fields(alias = %resource.name, version = %resource.user_version))]
    pub async fn deploy_explicit(
        &self,
        resource: &ResourceHandle,
        context: &LoadingContext,
    ) -> Result<Option<Arc<DeploymentUnit>>> {
        if !self.is_started() {
            return Err(RegistryError::NotStarted);
        }

        match *context {
            LoadingContext::Cluster { id, mode } => {
                if mode.is_per_version() != self.mode.is_per_version() && !resource.internal {
                    return Err(RegistryError::CrossModeConflict {
                        resource: resource.name.clone(),
                        context_mode: mode,
                        local_mode: self.mode,
                    });
                }

                let meta = DeploymentMetadata::new(&resource.name, self.mode, self.node);
                if let Some(unit) = self.local_store.get_by_metadata(&meta).await {
                    return Ok(Some(unit));
                }
                Ok(self
                    .context_store
                    .get_by_context_id(&id)
                    .or_else(|| self.version_store.get_by_context_id(&id)))
            }
            LoadingContext::Local => {
                if let Some(unit) = self.immortal() {
                    return Ok(Some(unit));
                }
                let unit = self.local_store.explicit_deploy(resource, context).await?;
                Ok(Some(unit))
            }
        }
    }

    /// Undeploy `name` locally (if `local`) and notify `remote_nodes`.
    ///
    /// Notification failures are logged, never retried. Returns the number of
    /// remote nodes notified.
    #[instrument(skip(self, remote_nodes), fields(node = %self.node))]
    pub async fn undeploy(&self, name: &str, local: bool, remote_nodes: &[NodeId]) -> usize {
        if self.immortal().is_some() {
            return 0;
        }

        if local {
            let count = self.local_store.explicit_undeploy(None, name).await;
            info!(resource = %name, count, "Undeployed locally");
        }

        self.comm.broadcast_undeploy(remote_nodes, name).await
    }

    /// Handle an undeploy notice from `node`
    #[instrument(skip(self), fields(local = %self.node))]
    pub async fn undeploy_from_remote(&self, node: NodeId, name: &str) {
        if self.immortal().is_some() {
            warn!(from = %node, resource = %name, "Ignoring undeploy request on node with local deployment only");
            return;
        }

        let mut count = 0;
        for store in self.stores() {
            count += store.explicit_undeploy(Some(node), name).await;
        }
        info!(from = %node, resource = %name, count, "Processed remote undeploy");
    }

    /// Merge `added` into the participants of every sharing-mode unit related
    /// to `all`
    pub fn add_participants(&self, all: &ParticipantMap, added: &ParticipantMap) -> usize {
        self.local_store.add_participants(all, added) + self.version_store.add_participants(all, added)
    }

    pub fn context_id_of(&self, context: &LoadingContext) -> Option<ContextId> {
        context.context_id()
    }

    pub fn is_cluster_managed_context(&self, context: &LoadingContext) -> bool {
        context.is_cluster_managed()
    }

    // ---- Diagnostics ----

    /// Point-in-time view of every held unit
    pub fn snapshot(&self) -> RegistrySnapshot {
        let immortal = self.immortal();
        let stores = match &immortal {
            Some(_) => Vec::new(),
            None => self
                .stores()
                .into_iter()
                .map(|store| StoreSnapshot {
                    kind: store.kind(),
                    units: store.units().iter().map(|u| UnitSummary::of(u)).collect(),
                })
                .collect(),
        };

        RegistrySnapshot {
            node: self.node,
            mode: self.mode,
            started: self.is_started(),
            immortal: immortal.as_deref().map(UnitSummary::of),
            stores,
        }
    }
}

#[async_trait]
impl InboundHandler for DeploymentRegistry {
    async fn serve_fetch(
        &self,
        from: NodeId,
        request: &FetchRequest,
    ) -> std::result::Result<ResourceBundle, String> {
        match self.unit_by_context_id(&request.context_id) {
            Some(unit) => {
                debug!(
                    from = %from,
                    context_id = %request.context_id,
                    resource = %request.resource_name,
                    "Serving deployment"
                );
                Ok(unit.bundle())
            }
            None => Err(format!(
                "no active deployment for context {}",
                request.context_id
            )),
        }
    }

    async fn on_undeploy(&self, from: NodeId, resource_name: &str) {
        self.undeploy_from_remote(from, resource_name).await;
    }
}

/// Serializable registry state
#[derive(Debug, Clone, Serialize)]
pub struct RegistrySnapshot {
    pub node: NodeId,
    pub mode: DeploymentMode,
    pub started: bool,
    pub immortal: Option<UnitSummary>,
    pub stores: Vec<StoreSnapshot>,
}

impl RegistrySnapshot {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    pub fn unit_count(&self) -> usize {
        self.stores.iter().map(|s| s.units.len()).sum()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreSnapshot {
    pub kind: StoreKind,
    pub units: Vec<UnitSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UnitSummary {
    pub context_id: ContextId,
    pub sample_resource: String,
    pub user_version: String,
    pub mode: DeploymentMode,
    pub state: UnitState,
    pub participants: Option<ParticipantMap>,
    pub resources: Vec<String>,
}

impl UnitSummary {
    fn of(unit: &DeploymentUnit) -> Self {
        Self {
            context_id: unit.context_id(),
            sample_resource: unit.sample_resource().to_string(),
            user_version: unit.user_version().to_string(),
            mode: unit.mode(),
            state: unit.state(),
            participants: unit.participants().map(|p| p.snapshot()),
            resources: unit.resources().keys().cloned().collect(),
        }
    }
}
