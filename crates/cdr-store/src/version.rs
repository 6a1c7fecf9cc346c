//! Per-version store
//!
//! Holds units for the sharing modes, one per alias and user version. Each
//! unit tracks which node uses which context id for it. Missing units are
//! fetched from the sender first, then from any other live participant.
//!
//! In `Shared` mode a newly installed version supersedes older versions of
//! the same alias, and a unit is undeployed once every remote participant has
//! left the cluster. `Continuous` units survive both.

use crate::error::{Result, StoreError};
use crate::inflight::{FetchOutcome, InFlight};
use crate::local::merge_participants;
use crate::store::{DeploymentStore, StoreKind};
use async_trait::async_trait;
use cdr_comm::DeploymentCommunication;
use cdr_types::{
    ContextId, DeploymentMetadata, DeploymentMode, DeploymentUnit, LoadingContext, NodeId,
    ObsoleteHook, ParticipantMap, ResourceHandle,
};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::FutureExt;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

/// Alias and user version
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VersionKey {
    pub alias: String,
    pub user_version: String,
}

impl VersionKey {
    pub fn new(alias: impl Into<String>, user_version: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
            user_version: user_version.into(),
        }
    }
}

impl fmt::Display for VersionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.alias, self.user_version)
    }
}

struct VersionInner {
    node: NodeId,
    comm: Arc<DeploymentCommunication>,
    network_timeout: Duration,
    units: DashMap<VersionKey, Arc<DeploymentUnit>>,
    by_context: DashMap<ContextId, VersionKey>,
    in_flight: InFlight<VersionKey>,
    started: AtomicBool,
}

impl ObsoleteHook for VersionInner {
    fn on_obsolete(&self, unit: &DeploymentUnit) {
        let id = unit.context_id();
        if let Some((_, key)) = self.by_context.remove(&id) {
            self.units.remove_if(&key, |_, held| held.context_id() == id);
            debug!(key = %key, context_id = %id, "Removed obsolete per-version unit");
        }
    }
}

impl VersionInner {
    fn active(&self, key: &VersionKey) -> Option<Arc<DeploymentUnit>> {
        self.units
            .get(key)
            .map(|u| u.value().clone())
            .filter(|u| u.is_active())
    }

    /// Install `unit` under `key` unless an active unit already holds it.
    ///
    /// Returns the installed unit and whether it is the one passed in.
    fn install(&self, key: &VersionKey, unit: Arc<DeploymentUnit>) -> (Arc<DeploymentUnit>, bool) {
        match self.units.entry(key.clone()) {
            Entry::Occupied(entry) if entry.get().is_active() => {
                return (entry.get().clone(), false)
            }
            Entry::Occupied(mut entry) => {
                entry.insert(unit.clone());
            }
            Entry::Vacant(entry) => {
                entry.insert(unit.clone());
            }
        }
        self.by_context.insert(unit.context_id(), key.clone());
        (unit, true)
    }

    /// Schedule every other version of `key.alias` for undeploy
    fn supersede(&self, key: &VersionKey) {
        let stale: Vec<Arc<DeploymentUnit>> = self
            .units
            .iter()
            .filter(|e| e.key().alias == key.alias && e.key().user_version != key.user_version)
            .map(|e| e.value().clone())
            .collect();

        for unit in stale {
            if unit.schedule_undeploy() {
                info!(
                    alias = %key.alias,
                    old_version = %unit.user_version(),
                    new_version = %key.user_version,
                    "Superseded shared deployment"
                );
            }
        }
    }

    /// Nodes to fetch from, in order: the sender, then other participants
    fn sources(&self, meta: &DeploymentMetadata) -> Vec<(NodeId, ContextId)> {
        let topology = self.comm.topology();
        let mut sources = Vec::new();

        let sender = meta.sender();
        let sender_ctx = meta
            .context_id()
            .or_else(|| meta.participants().and_then(|p| p.get(&sender).copied()));
        if let Some(ctx) = sender_ctx {
            sources.push((sender, ctx));
        }

        if let Some(participants) = meta.participants() {
            for (node, ctx) in participants {
                if *node != sender {
                    sources.push((*node, *ctx));
                }
            }
        }

        sources.retain(|(node, _)| {
            *node != self.node && meta.admits(node) && topology.is_alive(node)
        });
        sources
    }

    async fn fetch(self: Arc<Self>, meta: DeploymentMetadata, key: VersionKey) -> FetchOutcome {
        let sources = self.sources(&meta);
        if sources.is_empty() {
            debug!(key = %key, "No live source to fetch shared deployment from");
            return None;
        }

        for (node, ctx) in sources {
            let bundle = match self
                .comm
                .fetch(node, ctx, meta.class_name(), self.network_timeout)
                .await
            {
                Ok(bundle) => bundle,
                Err(e) => {
                    warn!(
                        key = %key,
                        node = %node,
                        context_id = %ctx,
                        mode = %meta.mode(),
                        error = %e,
                        "Failed to fetch shared deployment"
                    );
                    continue;
                }
            };

            if bundle.user_version != key.user_version {
                warn!(
                    key = %key,
                    node = %node,
                    served_version = %bundle.user_version,
                    "Source served a different version"
                );
                continue;
            }

            let context_id = ContextId::generate();
            let mut participants = meta.participants().cloned().unwrap_or_default();
            participants.entry(node).or_insert(ctx);
            if let Some(sender_ctx) = meta.context_id() {
                participants.entry(meta.sender()).or_insert(sender_ctx);
            }
            participants.insert(self.node, context_id);

            let unit = DeploymentUnit::builder(meta.mode(), &key.alias, &key.user_version)
                .context_id(context_id)
                .resources(bundle.resources)
                .participants(participants.clone())
                .origin(node, ctx)
                .parent(meta.parent())
                .on_obsolete(&self)
                .build();

            let (unit, installed) = self.install(&key, unit);
            if !installed {
                // Lost the race; keep what we learned
                if let Some(existing) = unit.participants() {
                    existing.merge(&participants);
                }
                return Some(unit);
            }

            info!(
                key = %key,
                context_id = %unit.context_id(),
                node = %node,
                mode = %unit.mode(),
                "Materialized shared deployment"
            );
            if unit.mode() == DeploymentMode::Shared {
                self.supersede(&key);
            }
            return Some(unit);
        }
        None
    }
}

/// Merge the requester's participants and its own (sender, context) entry
fn record_requester(unit: &DeploymentUnit, meta: &DeploymentMetadata) {
    let Some(participants) = unit.participants() else {
        return;
    };
    if let Some(supplied) = meta.participants() {
        participants.merge(supplied);
    }
    if let Some(ctx) = meta.context_id() {
        participants.insert_if_absent(meta.sender(), ctx);
    }
}

/// Store for sharing-mode units
pub struct VersionStore {
    inner: Arc<VersionInner>,
}

impl VersionStore {
    pub fn new(node: NodeId, comm: Arc<DeploymentCommunication>, network_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(VersionInner {
                node,
                comm,
                network_timeout,
                units: DashMap::new(),
                by_context: DashMap::new(),
                in_flight: InFlight::new(),
                started: AtomicBool::new(false),
            }),
        }
    }

    /// Merge `added` into every unit that shares a participant entry with
    /// `all`. Existing entries are never overwritten.
    pub fn add_participants(&self, all: &ParticipantMap, added: &ParticipantMap) -> usize {
        merge_participants(self.units(), all, added)
    }

    pub fn get(&self, alias: &str, user_version: &str) -> Option<Arc<DeploymentUnit>> {
        self.inner.active(&VersionKey::new(alias, user_version))
    }

    fn all(&self) -> Vec<Arc<DeploymentUnit>> {
        self.inner.units.iter().map(|e| e.value().clone()).collect()
    }
}

#[async_trait]
impl DeploymentStore for VersionStore {
    fn kind(&self) -> StoreKind {
        StoreKind::PerVersion
    }

    async fn start(&self) -> Result<()> {
        self.inner.started.store(true, Ordering::SeqCst);
        debug!(node = %self.inner.node, "Per-version store started");
        Ok(())
    }

    async fn stop(&self) {
        self.inner.started.store(false, Ordering::SeqCst);
        let units = self.all();
        for unit in &units {
            unit.undeploy();
        }
        self.inner.units.clear();
        self.inner.by_context.clear();
        debug!(node = %self.inner.node, undeployed = units.len(), "Per-version store stopped");
    }

    fn get_by_context_id(&self, id: &ContextId) -> Option<Arc<DeploymentUnit>> {
        let key = self.inner.by_context.get(id).map(|k| k.value().clone())?;
        self.inner.active(&key).filter(|u| u.context_id() == *id)
    }

    #[instrument(skip(self, meta), fields(alias = %meta.alias(), version = %meta.user_version(), node = %meta.sender()))]
    async fn get_by_metadata(&self, meta: &DeploymentMetadata) -> Option<Arc<DeploymentUnit>> {
        let key = VersionKey::new(meta.alias(), meta.user_version());

        if let Some(unit) = self.inner.active(&key) {
            record_requester(&unit, meta);
            return Some(unit);
        }
        if !self.inner.started.load(Ordering::SeqCst) {
            return None;
        }

        let inner = self.inner.clone();
        let fetch_meta = meta.clone();
        let fetch_key = key.clone();
        let unit = self
            .inner
            .in_flight
            .run(key, move || inner.fetch(fetch_meta, fetch_key).boxed())
            .await?;

        // Callers that joined an in-flight fetch still become participants
        record_requester(&unit, meta);
        Some(unit)
    }

    async fn explicit_deploy(
        &self,
        resource: &ResourceHandle,
        context: &LoadingContext,
    ) -> Result<Arc<DeploymentUnit>> {
        let LoadingContext::Cluster { id, mode } = *context else {
            return Err(StoreError::InvalidContext {
                store: "per-version",
                reason: "a cluster-managed context is required".into(),
            });
        };
        if !mode.is_per_version() {
            return Err(StoreError::InvalidContext {
                store: "per-version",
                reason: format!("context mode {} is an isolation mode", mode),
            });
        }

        let key = VersionKey::new(&resource.name, &resource.user_version);
        let unit = DeploymentUnit::builder(mode, &resource.name, &resource.user_version)
            .context_id(id)
            .resources(resource.resources.clone())
            .participants(ParticipantMap::from([(self.inner.node, id)]))
            .on_obsolete(&self.inner)
            .build();

        let (unit, installed) = self.inner.install(&key, unit);
        if installed && mode == DeploymentMode::Shared {
            self.inner.supersede(&key);
        }
        Ok(unit)
    }

    async fn explicit_undeploy(&self, node: Option<NodeId>, name: &str) -> usize {
        let doomed: Vec<Arc<DeploymentUnit>> = self
            .all()
            .into_iter()
            .filter(|u| u.matches_name(name))
            .filter(|u| match node {
                None => true,
                Some(n) => {
                    u.origin().map(|o| o.node) == Some(n)
                        || u.participants().is_some_and(|p| p.contains(&n))
                }
            })
            .collect();

        let mut count = 0;
        for unit in doomed {
            if unit.schedule_undeploy() {
                count += 1;
                info!(
                    alias = %name,
                    version = %unit.user_version(),
                    context_id = %unit.context_id(),
                    "Undeployed per-version unit"
                );
            }
        }
        count
    }

    /// In `Shared` mode, undeploy units left without any live remote
    /// participant
    async fn on_node_left(&self, node: NodeId) {
        let topology = self.inner.comm.topology();
        for unit in self.all() {
            if unit.mode() != DeploymentMode::Shared {
                continue;
            }
            let Some(participants) = unit.participants() else {
                continue;
            };
            if !participants.contains(&node) {
                continue;
            }
            let orphaned = participants
                .nodes()
                .iter()
                .filter(|n| **n != self.inner.node)
                .all(|n| *n == node || !topology.is_alive(n));
            if orphaned && unit.schedule_undeploy() {
                info!(
                    node = %node,
                    alias = %unit.sample_resource(),
                    version = %unit.user_version(),
                    "Undeployed shared unit after last remote participant left"
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
            .inspect(|u| debug!(context_id = %u.context_id(), "Evicted idle per-version unit"))
            .count()
    }
}
