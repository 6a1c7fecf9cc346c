//! Local store
//!
//! Units sourced from the node's own resource path, keyed by alias. They are
//! never fetched over the network and never expire except by explicit
//! undeploy.

use crate::error::{Result, StoreError};
use crate::provider::ResourceProvider;
use crate::store::{DeploymentStore, StoreKind};
use async_trait::async_trait;
use cdr_types::{
    ContextId, DeployedResource, DeploymentMetadata, DeploymentMode, DeploymentUnit,
    LoadingContext, NodeId, ObsoleteHook, ParticipantMap, ResourceHandle, ResourceMap,
};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, instrument};

struct LocalInner {
    node: NodeId,
    mode: DeploymentMode,
    provider: Arc<dyn ResourceProvider>,
    units: DashMap<String, Arc<DeploymentUnit>>,
    by_context: DashMap<ContextId, String>,
    started: AtomicBool,
}

impl ObsoleteHook for LocalInner {
    fn on_obsolete(&self, unit: &DeploymentUnit) {
        let id = unit.context_id();
        if let Some((_, alias)) = self.by_context.remove(&id) {
            self.units.remove_if(&alias, |_, held| held.context_id() == id);
            debug!(alias = %alias, context_id = %id, "Removed obsolete local unit");
        }
    }
}

/// Store of locally sourced units
pub struct LocalStore {
    inner: Arc<LocalInner>,
}

impl LocalStore {
    /// Create a store for a node running in `mode`
    pub fn new(node: NodeId, mode: DeploymentMode, provider: Arc<dyn ResourceProvider>) -> Self {
        Self {
            inner: Arc::new(LocalInner {
                node,
                mode,
                provider,
                units: DashMap::new(),
                by_context: DashMap::new(),
                started: AtomicBool::new(false),
            }),
        }
    }

    pub fn mode(&self) -> DeploymentMode {
        self.inner.mode
    }

    fn active(&self, alias: &str) -> Option<Arc<DeploymentUnit>> {
        self.inner
            .units
            .get(alias)
            .map(|u| u.value().clone())
            .filter(|u| u.is_active())
    }

    fn build_unit(
        &self,
        alias: &str,
        user_version: &str,
        resources: ResourceMap,
        parent: Option<ContextId>,
    ) -> Arc<DeploymentUnit> {
        let context_id = ContextId::generate();
        DeploymentUnit::builder(self.inner.mode, alias, user_version)
            .context_id(context_id)
            .resources(resources)
            .participants(ParticipantMap::from([(self.inner.node, context_id)]))
            .parent(parent)
            .on_obsolete(&self.inner)
            .build()
    }

    /// Insert `unit` unless an active unit for its alias already exists.
    ///
    /// Returns whichever unit ends up installed.
    fn install(&self, unit: Arc<DeploymentUnit>) -> Arc<DeploymentUnit> {
        let alias = unit.sample_resource().to_string();
        let replaced = match self.inner.units.entry(alias.clone()) {
            Entry::Occupied(entry) if entry.get().is_active() => return entry.get().clone(),
            Entry::Occupied(mut entry) => Some(entry.insert(unit.clone())),
            Entry::Vacant(entry) => {
                entry.insert(unit.clone());
                None
            }
        };
        self.inner.by_context.insert(unit.context_id(), alias);
        if let Some(old) = replaced {
            self.inner.by_context.remove(&old.context_id());
        }
        unit
    }

    /// Materialize a unit for `meta` from the resource provider
    async fn materialize(&self, meta: &DeploymentMetadata) -> Option<Arc<DeploymentUnit>> {
        let provided = self.inner.provider.load(meta.class_name()).await?;

        let mut resources = ResourceMap::new();
        resources.insert(
            meta.class_name().to_string(),
            DeployedResource::new(meta.class_name(), provided.kind, provided.content),
        );
        let unit = self.install(self.build_unit(
            meta.alias(),
            &provided.user_version,
            resources,
            meta.parent(),
        ));

        info!(
            alias = %meta.alias(),
            context_id = %unit.context_id(),
            version = %unit.user_version(),
            mode = %unit.mode(),
            "Materialized local deployment"
        );
        Some(unit)
    }

    /// Merge `added` into every unit that shares a participant entry with
    /// `all`
    pub fn add_participants(&self, all: &ParticipantMap, added: &ParticipantMap) -> usize {
        merge_participants(self.units(), all, added)
    }
}

/// Shared by the local and per-version stores
pub(crate) fn merge_participants(
    units: Vec<Arc<DeploymentUnit>>,
    all: &ParticipantMap,
    added: &ParticipantMap,
) -> usize {
    let mut merged = 0;
    for unit in units {
        let Some(participants) = unit.participants() else {
            continue;
        };
        let related = all
            .iter()
            .any(|(node, ctx)| participants.get(node) == Some(*ctx));
        if related {
            let count = participants.merge(added);
            if count > 0 {
                debug!(context_id = %unit.context_id(), added = count, "Merged participants");
            }
            merged += count;
        }
    }
    merged
}

#[async_trait]
impl DeploymentStore for LocalStore {
    fn kind(&self) -> StoreKind {
        StoreKind::Local
    }

    async fn start(&self) -> Result<()> {
        self.inner.started.store(true, Ordering::SeqCst);
        debug!(node = %self.inner.node, mode = %self.inner.mode, "Local store started");
        Ok(())
    }

    async fn stop(&self) {
        self.inner.started.store(false, Ordering::SeqCst);
        let units = self.units();
        for unit in &units {
            unit.undeploy();
        }
        self.inner.units.clear();
        self.inner.by_context.clear();
        debug!(node = %self.inner.node, undeployed = units.len(), "Local store stopped");
    }

    fn get_by_context_id(&self, id: &ContextId) -> Option<Arc<DeploymentUnit>> {
        let alias = self.inner.by_context.get(id).map(|a| a.value().clone())?;
        self.active(&alias).filter(|u| u.context_id() == *id)
    }

    /// Active unit for the alias. With `record` set, a missing unit is
    /// materialized from the resource provider.
    async fn get_by_metadata(&self, meta: &DeploymentMetadata) -> Option<Arc<DeploymentUnit>> {
        if let Some(unit) = self.active(meta.alias()) {
            return Some(unit);
        }
        if meta.record() {
            return self.materialize(meta).await;
        }
        None
    }

    #[instrument(skip(self, resource), fields(alias = %resource.name, version = %resource.user_version))]
    async fn explicit_deploy(
        &self,
        resource: &ResourceHandle,
        context: &LoadingContext,
    ) -> Result<Arc<DeploymentUnit>> {
        if !self.inner.started.load(Ordering::SeqCst) {
            return Err(StoreError::NotStarted("local"));
        }
        if context.is_cluster_managed() {
            return Err(StoreError::InvalidContext {
                store: "local",
                reason: "cluster-managed contexts are not deployed locally".into(),
            });
        }

        // Reuse check and replacement happen under one entry lock
        let (unit, replaced) = match self.inner.units.entry(resource.name.clone()) {
            Entry::Occupied(entry)
                if entry.get().is_active()
                    && entry.get().user_version() == resource.user_version
                    && entry.get().resources() == &resource.resources =>
            {
                let existing = entry.get().clone();
                debug!(context_id = %existing.context_id(), "Reusing identical local deployment");
                return Ok(existing);
            }
            Entry::Occupied(mut entry) => {
                let unit = self.build_unit(
                    &resource.name,
                    &resource.user_version,
                    resource.resources.clone(),
                    None,
                );
                let old = entry.insert(unit.clone());
                (unit, Some(old))
            }
            Entry::Vacant(entry) => {
                let unit = self.build_unit(
                    &resource.name,
                    &resource.user_version,
                    resource.resources.clone(),
                    None,
                );
                entry.insert(unit.clone());
                (unit, None)
            }
        };

        self.inner
            .by_context
            .insert(unit.context_id(), resource.name.clone());
        if let Some(old) = replaced {
            self.inner.by_context.remove(&old.context_id());
            old.schedule_undeploy();
            info!(old = %old.context_id(), new = %unit.context_id(), "Replaced local deployment");
        }

        info!(context_id = %unit.context_id(), mode = %unit.mode(), "Deployed locally");
        Ok(unit)
    }

    async fn explicit_undeploy(&self, _node: Option<NodeId>, name: &str) -> usize {
        let doomed: Vec<String> = self
            .inner
            .units
            .iter()
            .filter(|e| e.key() == name || e.value().matches_name(name))
            .map(|e| e.key().clone())
            .collect();

        let mut count = 0;
        for alias in doomed {
            if let Some((_, unit)) = self.inner.units.remove(&alias) {
                self.inner.by_context.remove(&unit.context_id());
                unit.schedule_undeploy();
                count += 1;
                info!(alias = %alias, context_id = %unit.context_id(), "Undeployed local unit");
            }
        }
        count
    }

    fn units(&self) -> Vec<Arc<DeploymentUnit>> {
        self.inner
            .units
            .iter()
            .map(|e| e.value().clone())
            .filter(|u| u.is_active())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::InMemoryResourceProvider;
    use cdr_types::ResourceKind;

    async fn started_store(mode: DeploymentMode) -> (LocalStore, Arc<InMemoryResourceProvider>, NodeId) {
        let node = NodeId::generate();
        let provider = Arc::new(InMemoryResourceProvider::new());
        let store = LocalStore::new(node, mode, provider.clone());
        store.start().await.unwrap();
        (store, provider, node)
    }

    #[tokio::test]
    async fn test_lookup_without_record_does_not_materialize() {
        let (store, provider, node) = started_store(DeploymentMode::Shared).await;
        provider.insert("Task1", ResourceKind::Task, &b"body"[..]);

        let meta = DeploymentMetadata::new("Task1", DeploymentMode::Shared, node);
        assert!(store.get_by_metadata(&meta).await.is_none());

        let unit = store.get_by_metadata(&meta.clone().with_record(true)).await.unwrap();
        assert!(unit.has_resource("Task1"));
        assert_eq!(unit.participants().and_then(|p| p.get(&node)), Some(unit.context_id()));

        // Now held, plain lookups see it
        let again = store.get_by_metadata(&meta).await.unwrap();
        assert!(Arc::ptr_eq(&unit, &again));
        assert!(store.get_by_context_id(&unit.context_id()).is_some());
    }

    #[tokio::test]
    async fn test_explicit_deploy_reuses_identical_content() {
        let (store, _provider, _node) = started_store(DeploymentMode::Continuous).await;
        let handle = ResourceHandle::task("Task1", "v1", &b"body"[..]);

        let first = store.explicit_deploy(&handle, &LoadingContext::Local).await.unwrap();
        let second = store.explicit_deploy(&handle, &LoadingContext::Local).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let changed = ResourceHandle::task("Task1", "v2", &b"body2"[..]);
        let third = store.explicit_deploy(&changed, &LoadingContext::Local).await.unwrap();
        assert_ne!(first.context_id(), third.context_id());
        assert!(first.is_obsolete());
        assert!(store.get_by_context_id(&first.context_id()).is_none());
        assert_eq!(store.units().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_identical_deploys_install_one_unit() {
        let (store, _provider, _node) = started_store(DeploymentMode::Shared).await;
        let store = Arc::new(store);

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move {
                    let handle = ResourceHandle::task("Task1", "v1", &b"body"[..]);
                    store.explicit_deploy(&handle, &LoadingContext::Local).await.unwrap()
                })
            })
            .collect();

        let mut units = Vec::new();
        for task in tasks {
            units.push(task.await.unwrap());
        }

        assert!(units.iter().all(|u| Arc::ptr_eq(u, &units[0])));
        assert!(units[0].is_active());
        assert_eq!(store.units().len(), 1);
        assert_eq!(
            store.get_by_context_id(&units[0].context_id()).map(|u| u.context_id()),
            Some(units[0].context_id())
        );
    }

    #[tokio::test]
    async fn test_undeploy_waits_for_references() {
        let (store, _provider, _node) = started_store(DeploymentMode::Private).await;
        let handle = ResourceHandle::task("Task1", "v1", &b"body"[..]);
        let unit = store.explicit_deploy(&handle, &LoadingContext::Local).await.unwrap();

        assert!(unit.acquire());
        assert_eq!(store.explicit_undeploy(None, "Task1").await, 1);
        assert!(unit.is_pending_undeploy());
        assert!(store.units().is_empty());

        unit.release();
        assert!(unit.is_obsolete());
    }

    #[tokio::test]
    async fn test_cluster_context_is_rejected() {
        let (store, _provider, _node) = started_store(DeploymentMode::Private).await;
        let handle = ResourceHandle::task("Task1", "v1", &b"body"[..]);
        let ctx = LoadingContext::cluster(ContextId::generate(), DeploymentMode::Private);

        let err = store.explicit_deploy(&handle, &ctx).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidContext { .. }));
    }

    #[tokio::test]
    async fn test_add_participants_only_touches_related_units() {
        let (store, _provider, node) = started_store(DeploymentMode::Continuous).await;
        let task1 = store
            .explicit_deploy(&ResourceHandle::task("Task1", "v1", &b"1"[..]), &LoadingContext::Local)
            .await
            .unwrap();
        let task2 = store
            .explicit_deploy(&ResourceHandle::task("Task2", "v1", &b"2"[..]), &LoadingContext::Local)
            .await
            .unwrap();

        let remote = NodeId::generate();
        let remote_ctx = ContextId::generate();
        let all = ParticipantMap::from([(node, task1.context_id()), (remote, remote_ctx)]);
        let added = ParticipantMap::from([(remote, remote_ctx)]);

        assert_eq!(store.add_participants(&all, &added), 1);
        assert_eq!(task1.participants().unwrap().get(&remote), Some(remote_ctx));
        assert!(!task2.participants().unwrap().contains(&remote));
    }
}
