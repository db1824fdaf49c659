//! Integration tests for full reconcile passes on a live API server

use std::sync::Arc;
use std::time::Duration;

use kube::api::{Api, DeleteParams, PostParams};

use azurecluster_controller::cloud::InMemoryCloud;
use azurecluster_controller::controller::AzureClusterReconciler;
use azurecluster_controller::crd::{AzureCluster, ClusterPhase};
use azurecluster_controller::rate_limit::{RateLimitConfig, RateLimiter};
use azurecluster_controller::scope::ExecutionScope;
use azurecluster_controller::state::{KubeStateAccessor, StateAccessor};
use azurecluster_controller::ResourceKey;

use super::helpers::{cleanup_cluster, ensure_test_cluster, owned_cluster, TEST_NAMESPACE};

/// Story: A platform operator creates an AzureCluster and later deletes it.
/// The controller provisions, reports Ready, then tears down and releases the
/// record.
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_cluster_is_provisioned_and_released() {
    let client = ensure_test_cluster()
        .await
        .expect("failed to setup cluster");
    let api: Api<AzureCluster> = Api::namespaced(client.clone(), TEST_NAMESPACE);
    let name = "test-azc-lifecycle";
    cleanup_cluster(&client, name).await;

    api.create(&PostParams::default(), &owned_cluster(name))
        .await
        .expect("failed to create AzureCluster");

    let state = Arc::new(KubeStateAccessor::new(client.clone()));
    let cloud = Arc::new(InMemoryCloud::new());
    let reconciler = AzureClusterReconciler::builder(state.clone(), cloud.clone())
        .limiter(Arc::new(RateLimiter::new(RateLimitConfig::default())))
        .reconcile_timeout(Duration::from_secs(10))
        .build();
    let key = ResourceKey::new(TEST_NAMESPACE, name);

    // Act: reconcile until nothing is scheduled
    for _ in 0..10 {
        let result = reconciler
            .reconcile(&ExecutionScope::background(), &key)
            .await
            .expect("reconcile should succeed");
        if !result.is_requeue() {
            break;
        }
    }

    let ready = api.get(name).await.expect("failed to get AzureCluster");
    assert_eq!(ready.phase(), ClusterPhase::Ready);
    assert!(cloud.resource_group(&format!("{}-rg", name)).is_some());

    // Act: the operator deletes the cluster
    api.delete(name, &DeleteParams::default())
        .await
        .expect("failed to delete AzureCluster");
    for _ in 0..10 {
        let result = reconciler
            .reconcile(&ExecutionScope::background(), &key)
            .await
            .expect("reconcile should succeed");
        if !result.is_requeue() {
            break;
        }
    }

    // Give the API server a moment to finish the deletion
    tokio::time::sleep(Duration::from_secs(1)).await;
    let gone = state
        .get(&ExecutionScope::background(), &key)
        .await
        .expect("lookup should succeed");
    assert!(gone.is_none());
    assert!(cloud.resource_group(&format!("{}-rg", name)).is_none());
}
