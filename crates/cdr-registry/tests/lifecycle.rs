//! Undeploy propagation, static deployment and registry lifecycle

mod common;

use cdr_registry::{RegistryConfig, RegistryError, IMMORTAL_SAMPLE_RESOURCE};
use cdr_types::{
    ContextId, DeploymentMetadata, DeploymentMode, LoadingContext, ParticipantMap, ResourceHandle,
    ResourceKind,
};
use common::{wait_until_gone, TestCluster};
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Undeploy
// ---------------------------------------------------------------------------

#[tokio::test]
async fn continuous_deploy_fetch_and_undeploy_round() {
    let cluster = TestCluster::new();
    let a = cluster.node(DeploymentMode::Continuous).await;
    let b = cluster.node(DeploymentMode::Continuous).await;

    // A deploys locally
    let origin = a.deploy("Task1", "v1", b"task one").await;
    assert_eq!(
        origin.participants().unwrap().snapshot(),
        ParticipantMap::from([(a.id, origin.context_id())])
    );

    // B resolves, fetching from A
    let unit = b.registry.resolve_global(a.request_for(&origin)).await.unwrap();
    b.registry.add_participants(
        &ParticipantMap::from([(a.id, origin.context_id())]),
        &ParticipantMap::from([(b.id, unit.context_id())]),
    );
    assert_eq!(
        unit.participants().unwrap().snapshot(),
        ParticipantMap::from([(a.id, origin.context_id()), (b.id, unit.context_id())])
    );
    assert_eq!(cluster.network.fetch_requests_to(&a.id), 1);

    // A undeploys everywhere
    a.registry.undeploy("Task1", true, &[b.id]).await;
    assert!(a.registry.resolve_local("Task1").await.is_none());
    assert!(wait_until_gone(&b, unit.context_id()).await);

    assert!(b.registry.resolve_global(a.request_for(&origin)).await.is_none());
}

#[tokio::test]
async fn undeploy_propagates_to_remote_nodes() {
    let cluster = TestCluster::new();
    let a = cluster.node(DeploymentMode::Isolated).await;
    let b = cluster.node(DeploymentMode::Isolated).await;
    let c = cluster.node(DeploymentMode::Isolated).await;

    let origin = a.deploy("Task1", "v1", b"one").await;
    let on_b = b.registry.resolve_global(a.request_for(&origin)).await.unwrap();
    let on_c = c.registry.resolve_global(a.request_for(&origin)).await.unwrap();

    let notified = a.registry.undeploy("Task1", true, &[a.id, b.id, c.id]).await;

    assert_eq!(notified, 2);
    assert_eq!(cluster.network.undeploy_notices_to(&a.id), 0);
    assert_eq!(cluster.network.undeploy_notices_to(&b.id), 1);
    assert!(origin.is_obsolete());
    assert!(a.registry.unit_by_context_id(&origin.context_id()).is_none());
    assert!(a.registry.resolve_local("Task1").await.is_none());
    assert!(wait_until_gone(&b, on_b.context_id()).await);
    assert!(wait_until_gone(&c, on_c.context_id()).await);
}

#[tokio::test]
async fn remote_undeploy_only_touches_units_from_that_node() {
    let cluster = TestCluster::new();
    let a = cluster.node(DeploymentMode::Private).await;
    let b = cluster.node(DeploymentMode::Private).await;
    let c = cluster.node(DeploymentMode::Private).await;

    let from_a = a.deploy("Task1", "v1", b"a").await;
    let from_c = c.deploy("Task1", "v1", b"c").await;
    let a_unit = b.registry.resolve_global(a.request_for(&from_a)).await.unwrap();
    let c_unit = b.registry.resolve_global(c.request_for(&from_c)).await.unwrap();

    b.registry.undeploy_from_remote(a.id, "Task1").await;

    assert!(a_unit.is_obsolete());
    assert!(c_unit.is_active());
}

#[tokio::test]
async fn undeploy_without_local_keeps_own_unit() {
    let cluster = TestCluster::new();
    let a = cluster.node(DeploymentMode::Continuous).await;
    let b = cluster.node(DeploymentMode::Continuous).await;

    let origin = a.deploy("Task1", "v1", b"one").await;
    let on_b = b.registry.resolve_global(a.request_for(&origin)).await.unwrap();

    a.registry.undeploy("Task1", false, &[b.id]).await;

    assert!(origin.is_active());
    assert!(wait_until_gone(&b, on_b.context_id()).await);
}

#[tokio::test]
async fn redeploy_after_undeploy_resolves_again() {
    let cluster = TestCluster::new();
    let a = cluster.node(DeploymentMode::Shared).await;
    let b = cluster.node(DeploymentMode::Shared).await;

    let first = a.deploy("Task1", "v1", b"one").await;
    let old = b.registry.resolve_global(a.request_for(&first)).await.unwrap();
    a.registry.undeploy("Task1", true, &[b.id]).await;
    assert!(wait_until_gone(&b, old.context_id()).await);

    let second = a.deploy("Task1", "v1", b"one").await;
    let new = b.registry.resolve_global(a.request_for(&second)).await.unwrap();

    assert!(!Arc::ptr_eq(&old, &new));
    assert_eq!(new.origin().unwrap().context_id, second.context_id());
}

// ---------------------------------------------------------------------------
// Static deployment
// ---------------------------------------------------------------------------

fn static_config(mode: DeploymentMode) -> RegistryConfig {
    let mut config = RegistryConfig::for_mode(mode);
    config.peer_loading_enabled = false;
    config.static_deployment = true;
    config
}

#[tokio::test]
async fn static_node_serves_everything_from_one_unit() {
    let cluster = TestCluster::new();
    let a = cluster.node_with(static_config(DeploymentMode::Shared)).await;
    assert!(!a.registry.is_enabled());

    let unit = a
        .registry
        .resolve_global(DeploymentMetadata::new("Anything", DeploymentMode::Isolated, a.id))
        .await
        .unwrap();

    assert_eq!(unit.context_id(), ContextId::for_node(&a.id));
    assert_eq!(unit.sample_resource(), IMMORTAL_SAMPLE_RESOURCE);
    assert_eq!(unit.user_version(), "0");
    assert!(unit.is_local());

    let again = a.registry.resolve_local("Other").await.unwrap();
    assert!(Arc::ptr_eq(&unit, &again));
}

#[tokio::test]
async fn static_node_ignores_undeploy() {
    let cluster = TestCluster::new();
    let a = cluster.node_with(static_config(DeploymentMode::Continuous)).await;
    let b = cluster.node(DeploymentMode::Continuous).await;

    let unit = a.registry.resolve_local("Task1").await.unwrap();

    assert_eq!(a.registry.undeploy("Task1", true, &[b.id]).await, 0);
    a.registry.undeploy_from_remote(b.id, "Task1").await;

    assert!(unit.is_active());
    assert_eq!(cluster.network.undeploy_notices_to(&b.id), 0);
}

#[tokio::test]
async fn static_unit_lists_provider_tasks() {
    let cluster = TestCluster::new();
    let a = cluster.node_with(static_config(DeploymentMode::Private)).await;

    // Built at start; later additions are not picked up
    a.provider.insert("Late", ResourceKind::Task, &b"late"[..]);
    assert!(a.registry.find_all_units(|_| true).is_empty());

    let snapshot = a.registry.snapshot();
    assert!(snapshot.immortal.is_some());
    assert!(snapshot.stores.is_empty());
}

#[tokio::test]
async fn static_unit_includes_resources_present_at_start() {
    let network = cdr_comm::InMemoryNetwork::new();
    let provider = Arc::new(cdr_store::InMemoryResourceProvider::new());
    provider.insert("Task1", ResourceKind::Task, &b"one"[..]);
    provider.insert("Helper", ResourceKind::Class, &b"helper"[..]);

    let node = cdr_types::NodeId::generate();
    let registry =
        cdr_registry::DeploymentRegistryBuilder::new(static_config(DeploymentMode::Shared))
            .with_communication(network.connect(node))
            .with_resource_provider(provider)
            .build()
            .unwrap();
    registry.start().await.unwrap();

    let tasks = registry.find_all_units(|_| true);
    assert_eq!(tasks.keys().collect::<Vec<_>>(), vec!["Task1"]);

    let unit = registry.resolve_local("Task1").await.unwrap();
    assert!(unit.has_resource("Helper"));

    let handle = ResourceHandle::task("Task2", "v1", &b"two"[..]);
    let deployed = registry
        .deploy_explicit(&handle, &LoadingContext::Local)
        .await
        .unwrap()
        .unwrap();
    assert!(Arc::ptr_eq(&unit, &deployed));
}

#[tokio::test]
async fn peer_loading_off_without_static_deployment_keeps_stores() {
    let cluster = TestCluster::new();
    let mut config = RegistryConfig::for_mode(DeploymentMode::Shared);
    config.peer_loading_enabled = false;
    let a = cluster.node_with(config).await;
    let b = cluster.node(DeploymentMode::Shared).await;

    assert!(a.registry.is_enabled());
    let origin = b.deploy("Task1", "v1", b"one").await;
    assert!(a.registry.resolve_global(b.request_for(&origin)).await.is_none());
    assert_eq!(cluster.network.fetch_requests_to(&b.id), 0);
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn stopped_node_refuses_to_serve() {
    let cluster = TestCluster::new();
    let a = cluster.node(DeploymentMode::Isolated).await;
    let b = cluster.node(DeploymentMode::Isolated).await;

    let origin = a.deploy("Task1", "v1", b"one").await;
    a.registry.stop().await;

    assert!(!a.registry.is_started());
    assert!(origin.is_obsolete());
    assert!(b.registry.resolve_global(a.request_for(&origin)).await.is_none());
}

#[tokio::test]
async fn start_and_stop_are_idempotent() {
    let cluster = TestCluster::new();
    let a = cluster.node(DeploymentMode::Continuous).await;

    a.registry.start().await.unwrap();
    assert!(a.registry.is_started());

    a.registry.stop().await;
    a.registry.stop().await;
    assert!(!a.registry.is_started());

    a.registry.start().await.unwrap();
    assert!(a.registry.communication().has_handler());
    a.deploy("Task1", "v1", b"one").await;
}

#[tokio::test]
async fn cluster_context_of_other_family_is_rejected() {
    let cluster = TestCluster::new();
    let a = cluster.node(DeploymentMode::Isolated).await;

    let handle = ResourceHandle::task("Task1", "v1", &b"one"[..]);
    let context = LoadingContext::cluster(ContextId::generate(), DeploymentMode::Continuous);
    let err = a.registry.deploy_explicit(&handle, &context).await.unwrap_err();

    assert!(matches!(err, RegistryError::CrossModeConflict { .. }));
    assert!(err.to_string().contains("continuous"));
    assert!(err.to_string().contains("isolated"));
}

#[tokio::test]
async fn snapshot_reports_units_per_store() {
    let cluster = TestCluster::new();
    let a = cluster.node(DeploymentMode::Shared).await;
    let b = cluster.node(DeploymentMode::Shared).await;

    let origin = a.deploy("Task1", "v1", b"one").await;
    b.registry.resolve_global(a.request_for(&origin)).await.unwrap();

    let json = b.registry.snapshot().to_json();
    assert_eq!(json["mode"], "shared");
    assert_eq!(json["started"], true);
    assert!(json["immortal"].is_null());

    let stores = json["stores"].as_array().unwrap();
    assert_eq!(stores.len(), 3);
    assert_eq!(stores[2]["kind"], "per_version");
    assert_eq!(stores[2]["units"][0]["user_version"], "v1");
    assert_eq!(
        stores[2]["units"][0]["participants"].as_object().unwrap().len(),
        2
    );
}
