//! Reconcile contract tests
//!
//! These tests drive the reconciler through its public API against the
//! in-memory State Accessor and in-memory cloud. They tell the story of what a
//! scheduler observes when it calls `reconcile(key)`: benign absence, deadline
//! enforcement, idempotence, budget-aware failure and key independence.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use tokio::time::Instant;

use azurecluster_controller::cloud::{CloudAction, InMemoryCloud};
use azurecluster_controller::controller::AzureClusterReconciler;
use azurecluster_controller::crd::{
    AzureCluster, AzureClusterSpec, AzureClusterStatus, ClusterPhase, NetworkSpec, SubnetRole,
    SubnetSpec, VnetSpec,
};
use azurecluster_controller::error::{ErrorCategory, Step, DEADLINE_EXCEEDED};
use azurecluster_controller::logger::{ReconcileLogger, TracingLogger};
use azurecluster_controller::rate_limit::{RateLimitConfig, RateLimiter};
use azurecluster_controller::scope::ExecutionScope;
use azurecluster_controller::state::InMemoryStateStore;
use azurecluster_controller::{Error, ReconcileResult, ResourceKey, ASYNC_OPERATION_REQUEUE};

// =============================================================================
// Test Fixtures
// =============================================================================

fn cluster_spec(prefix: &str) -> AzureClusterSpec {
    AzureClusterSpec {
        location: "westeurope".to_string(),
        resource_group: format!("{}-rg", prefix),
        network_spec: NetworkSpec {
            vnet: VnetSpec {
                name: format!("{}-vnet", prefix),
                cidr_block: "10.0.0.0/8".to_string(),
            },
            subnets: vec![
                SubnetSpec {
                    name: format!("{}-controlplane", prefix),
                    role: SubnetRole::ControlPlane,
                    cidr_block: "10.0.0.0/16".to_string(),
                },
                SubnetSpec {
                    name: format!("{}-node", prefix),
                    role: SubnetRole::Node,
                    cidr_block: "10.1.0.0/16".to_string(),
                },
            ],
        },
        additional_tags: Default::default(),
    }
}

/// An AzureCluster adopted by a CAPI Cluster of the same name
fn owned_cluster(name: &str, spec: AzureClusterSpec) -> AzureCluster {
    let mut cluster = AzureCluster::new(name, spec);
    cluster.metadata.namespace = Some("default".to_string());
    cluster.metadata.owner_references = Some(vec![OwnerReference {
        api_version: "cluster.x-k8s.io/v1alpha3".to_string(),
        kind: "Cluster".to_string(),
        name: name.to_string(),
        uid: format!("{}-uid", name),
        ..Default::default()
    }]);
    cluster
}

struct Harness {
    store: Arc<InMemoryStateStore>,
    cloud: Arc<InMemoryCloud>,
}

impl Harness {
    fn new() -> Self {
        Self::with(InMemoryStateStore::new(), InMemoryCloud::new())
    }

    fn with(store: InMemoryStateStore, cloud: InMemoryCloud) -> Self {
        Self {
            store: Arc::new(store),
            cloud: Arc::new(cloud),
        }
    }

    fn reconciler(&self) -> AzureClusterReconciler {
        AzureClusterReconciler::builder(self.store.clone(), self.cloud.clone())
            .limiter(Arc::new(RateLimiter::new(RateLimitConfig::unlimited())))
            .build()
    }

    async fn converge(&self, reconciler: &AzureClusterReconciler, key: &ResourceKey) {
        for _ in 0..10 {
            let result = reconciler
                .reconcile(&ExecutionScope::background(), key)
                .await
                .expect("convergence should succeed");
            if !result.is_requeue() {
                return;
            }
        }
        panic!("{} did not converge", key);
    }
}

/// Logger whose `with_values` blocks the calling thread
struct SlowLogger(Duration);

impl ReconcileLogger for SlowLogger {
    fn with_values(&self, _values: &[(&str, &str)]) -> Arc<dyn ReconcileLogger> {
        std::thread::sleep(self.0);
        Arc::new(TracingLogger::new())
    }

    fn info(&self, _msg: &str) {}

    fn error(&self, _err: &Error, _msg: &str) {}
}

// =============================================================================
// Benign absence
// =============================================================================

/// Story: The scheduler delivers a key whose record was already deleted. The
/// reconciler reports success with nothing scheduled.
#[tokio::test]
async fn story_missing_record_succeeds_without_requeue() {
    let harness = Harness::new();
    let reconciler = AzureClusterReconciler::builder(harness.store.clone(), harness.cloud.clone())
        .reconcile_timeout(Duration::from_secs(5))
        .build();

    let result = reconciler
        .reconcile(&ExecutionScope::background(), &ResourceKey::new("default", "foo"))
        .await
        .expect("absent record is not an error");

    assert_eq!(result, ReconcileResult { requeue_after: Duration::ZERO });
    assert!(harness.cloud.actions().is_empty());
}

// =============================================================================
// Deadline enforcement
// =============================================================================

/// Story: Building the per-call logger takes as long as the whole budget. The
/// call fails with the stable deadline message.
#[tokio::test]
async fn story_slow_logger_reports_context_deadline_exceeded() {
    let harness = Harness::new();
    harness.store.insert(owned_cluster("foo", cluster_spec("foo")));
    let reconciler = AzureClusterReconciler::builder(harness.store.clone(), harness.cloud.clone())
        .logger(Arc::new(SlowLogger(Duration::from_secs(1))))
        .reconcile_timeout(Duration::from_secs(1))
        .build();

    let err = reconciler
        .reconcile(&ExecutionScope::background(), &ResourceKey::new("default", "foo"))
        .await
        .unwrap_err();

    assert_eq!(err.to_string(), "context deadline exceeded");
    assert_eq!(err.to_string(), DEADLINE_EXCEEDED);
    assert!(harness.cloud.actions().is_empty());
}

/// Story: The backing store hangs. The call returns at the deadline instead of
/// waiting for the lookup.
#[tokio::test(start_paused = true)]
async fn story_slow_lookup_is_cut_off_at_the_deadline() {
    let harness = Harness::with(
        InMemoryStateStore::new().with_latency(Duration::from_secs(30)),
        InMemoryCloud::new(),
    );
    let key = harness.store.insert(owned_cluster("foo", cluster_spec("foo")));
    let reconciler = AzureClusterReconciler::builder(harness.store.clone(), harness.cloud.clone())
        .reconcile_timeout(Duration::from_secs(1))
        .build();

    let started = Instant::now();
    let err = reconciler
        .reconcile(&ExecutionScope::background(), &key)
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    assert!(err.is_deadline_exceeded());
    assert_eq!(err.step(), Some(Step::Lookup));
    assert_eq!(err.key(), Some("default/foo"));
    assert!(elapsed >= Duration::from_secs(1), "returned early: {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(1100), "returned late: {:?}", elapsed);
}

/// Story: The caller's own deadline is tighter than the configured timeout;
/// the tighter one wins.
#[tokio::test(start_paused = true)]
async fn story_caller_deadline_bounds_the_call() {
    let harness = Harness::with(
        InMemoryStateStore::new().with_latency(Duration::from_secs(30)),
        InMemoryCloud::new(),
    );
    let key = harness.store.insert(owned_cluster("foo", cluster_spec("foo")));
    let reconciler = AzureClusterReconciler::builder(harness.store.clone(), harness.cloud.clone())
        .reconcile_timeout(Duration::from_secs(60))
        .build();
    let (caller, _guard) = ExecutionScope::background().child(Some(Duration::from_millis(200)));

    let started = Instant::now();
    let err = reconciler.reconcile(&caller, &key).await.unwrap_err();

    assert!(err.is_deadline_exceeded());
    assert!(started.elapsed() < Duration::from_millis(300));
}

/// Story: The process is shutting down. In-flight calls return a cancellation
/// error promptly.
#[tokio::test(start_paused = true)]
async fn story_shutdown_cancels_in_flight_calls() {
    let harness = Harness::with(
        InMemoryStateStore::new().with_latency(Duration::from_secs(30)),
        InMemoryCloud::new(),
    );
    let key = harness.store.insert(owned_cluster("foo", cluster_spec("foo")));
    let reconciler = Arc::new(harness.reconciler());
    let root = ExecutionScope::background();

    let call = {
        let reconciler = reconciler.clone();
        let root = root.clone();
        tokio::spawn(async move { reconciler.reconcile(&root, &key).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    root.cancel();

    let err = call.await.unwrap().unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Cancelled);
    assert_eq!(err.to_string(), "context canceled");
}

// =============================================================================
// Idempotence
// =============================================================================

/// Story: A converged cluster is reconciled twice. Both calls succeed with no
/// requeue and neither issues a cloud action or a record write.
#[tokio::test]
async fn story_converged_cluster_is_left_alone() {
    let harness = Harness::new();
    let key = harness.store.insert(owned_cluster("foo", cluster_spec("foo")));
    let reconciler = harness.reconciler();
    harness.converge(&reconciler, &key).await;

    let record = harness.store.record(&key).unwrap();
    assert_eq!(record.status.as_ref().map(|s| s.phase.clone()), Some(ClusterPhase::Ready));
    let actions = harness.cloud.actions();
    let writes = harness.store.write_count();

    let first = reconciler
        .reconcile(&ExecutionScope::background(), &key)
        .await
        .unwrap();
    let second = reconciler
        .reconcile(&ExecutionScope::background(), &key)
        .await
        .unwrap();

    assert_eq!(first, ReconcileResult::done());
    assert_eq!(second, first);
    assert_eq!(harness.cloud.actions(), actions);
    assert_eq!(harness.store.write_count(), writes);
}

/// Story: An earlier pass ran out of time and the failure was rendered onto
/// the status. The next converged pass clears it, and the pass after that has
/// nothing left to write.
#[tokio::test]
async fn story_converged_pass_clears_an_earlier_failure() {
    let harness = Harness::new();
    let mut cluster = owned_cluster("foo", cluster_spec("foo"));
    cluster.status = Some(
        AzureClusterStatus::with_phase(ClusterPhase::Provisioning)
            .failure("DeadlineExceeded", "context deadline exceeded during lookup"),
    );
    let key = harness.store.insert(cluster);
    let reconciler = harness.reconciler();

    harness.converge(&reconciler, &key).await;

    let status = harness.store.record(&key).unwrap().status.unwrap();
    assert_eq!(status.phase, ClusterPhase::Ready);
    assert_eq!(status.failure_reason, None);
    assert_eq!(status.failure_message, None);

    let writes = harness.store.write_count();
    let again = reconciler
        .reconcile(&ExecutionScope::background(), &key)
        .await
        .unwrap();
    assert_eq!(again, ReconcileResult::done());
    assert_eq!(harness.store.write_count(), writes);
}

// =============================================================================
// Asynchronous operations
// =============================================================================

/// Story: Azure takes a minute to create the resource group. Calls made in
/// the meantime re-check and ask to be requeued without repeating the create;
/// once the group exists the next call moves on to the network.
#[tokio::test(start_paused = true)]
async fn story_in_progress_operations_requeue_until_done() {
    let harness = Harness::with(
        InMemoryStateStore::new(),
        InMemoryCloud::new().with_operation_duration(Duration::from_secs(60)),
    );
    let key = harness.store.insert(owned_cluster("foo", cluster_spec("foo")));
    let reconciler = harness.reconciler();

    let first = reconciler
        .reconcile(&ExecutionScope::background(), &key)
        .await
        .unwrap();
    assert_eq!(first, ReconcileResult::requeue_after(ASYNC_OPERATION_REQUEUE));

    tokio::time::advance(Duration::from_secs(15)).await;
    let second = reconciler
        .reconcile(&ExecutionScope::background(), &key)
        .await
        .unwrap();
    assert!(second.requeue_after > Duration::ZERO);
    assert_eq!(harness.cloud.actions().len(), 1);

    tokio::time::advance(Duration::from_secs(60)).await;
    reconciler
        .reconcile(&ExecutionScope::background(), &key)
        .await
        .unwrap();
    assert_eq!(
        harness.cloud.actions().last(),
        Some(&CloudAction::CreateOrUpdateVirtualNetwork {
            resource_group: "foo-rg".to_string(),
            name: "foo-vnet".to_string(),
        })
    );
    assert_eq!(
        harness.store.record(&key).unwrap().phase(),
        ClusterPhase::Provisioning
    );
}

// =============================================================================
// Budget-aware fast fail
// =============================================================================

/// Story: Two reconcilers share the process-wide cloud budget. The first
/// spends it; the second would have to wait longer than its deadline, so it
/// fails at once with a deadline error instead of sleeping.
#[tokio::test(start_paused = true)]
async fn story_shared_budget_fails_fast_past_the_deadline() {
    let harness = Harness::new();
    let a = harness.store.insert(owned_cluster("a", cluster_spec("a")));
    let b = harness.store.insert(owned_cluster("b", cluster_spec("b")));

    let limiter = Arc::new(RateLimiter::new(RateLimitConfig { qps: 0.5, burst: 2 }));
    let build = || {
        AzureClusterReconciler::builder(harness.store.clone(), harness.cloud.clone())
            .limiter(limiter.clone())
            .reconcile_timeout(Duration::from_secs(1))
            .build()
    };
    let (first, second) = (build(), build());

    // Resource group lookup and create spend both tokens
    let result = first
        .reconcile(&ExecutionScope::background(), &a)
        .await
        .unwrap();
    assert!(result.is_requeue());

    let started = Instant::now();
    let err = second
        .reconcile(&ExecutionScope::background(), &b)
        .await
        .unwrap_err();

    assert!(err.is_deadline_exceeded());
    assert_eq!(err.step(), Some(Step::RateLimit));
    assert_eq!(err.key(), Some("default/b"));
    assert_eq!(started.elapsed(), Duration::ZERO);
    assert!(harness.cloud.resource_group("b-rg").is_none());
}

/// Story: When the budget refills within the deadline the call waits for it
/// and succeeds.
#[tokio::test(start_paused = true)]
async fn story_budget_wait_within_deadline_succeeds() {
    let harness = Harness::new();
    let key = harness.store.insert(owned_cluster("foo", cluster_spec("foo")));
    let limiter = Arc::new(RateLimiter::new(RateLimitConfig { qps: 10.0, burst: 1 }));
    let reconciler = AzureClusterReconciler::builder(harness.store.clone(), harness.cloud.clone())
        .limiter(limiter)
        .reconcile_timeout(Duration::from_secs(5))
        .build();

    let started = Instant::now();
    let result = reconciler
        .reconcile(&ExecutionScope::background(), &key)
        .await
        .unwrap();

    assert!(result.is_requeue());
    assert!(started.elapsed() >= Duration::from_millis(99));
    assert!(harness.cloud.resource_group("foo-rg").is_some());
}

// =============================================================================
// Key independence
// =============================================================================

/// Story: Many keys are reconciled at once, some healthy and some with broken
/// specs. Each call sees only its own record and its own error.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn story_concurrent_keys_do_not_interfere() {
    let harness = Harness::new();
    let mut keys = Vec::new();
    for i in 0..16 {
        let name = format!("cluster-{}", i);
        let mut spec = cluster_spec(&name);
        if i % 2 == 1 {
            spec.location.clear();
        }
        keys.push(harness.store.insert(owned_cluster(&name, spec)));
    }
    let reconciler = Arc::new(harness.reconciler());

    let handles: Vec<_> = keys
        .iter()
        .cloned()
        .map(|key| {
            let reconciler = reconciler.clone();
            tokio::spawn(async move {
                let result = reconciler.reconcile(&ExecutionScope::background(), &key).await;
                (key, result)
            })
        })
        .collect();

    for (i, handle) in handles.into_iter().enumerate() {
        let (key, result) = handle.await.unwrap();
        assert_eq!(key, keys[i]);
        if i % 2 == 1 {
            let err = result.unwrap_err();
            assert_eq!(err.category(), ErrorCategory::Fatal);
            assert_eq!(err.key(), Some(key.to_string().as_str()));
        } else {
            assert!(result.unwrap().is_requeue(), "{} should be provisioning", key);
            let group = format!("{}-rg", key.name);
            assert!(harness.cloud.resource_group(&group).is_some());
        }
    }

    // Broken specs never reached the cloud
    for key in keys.iter().skip(1).step_by(2) {
        assert!(harness.cloud.resource_group(&format!("{}-rg", key.name)).is_none());
        assert!(!harness.store.record(key).unwrap().has_finalizer());
    }
}

// =============================================================================
// Deletion
// =============================================================================

/// Story: A converged cluster is deleted. Its resource group goes away and the
/// record is released once nothing is left in Azure.
#[tokio::test]
async fn story_deleted_cluster_releases_its_record() {
    let harness = Harness::new();
    let key = harness.store.insert(owned_cluster("foo", cluster_spec("foo")));
    let reconciler = harness.reconciler();
    harness.converge(&reconciler, &key).await;

    assert!(harness.store.request_deletion(&key));
    assert!(harness.store.record(&key).is_some(), "finalizer holds the record");

    harness.converge(&reconciler, &key).await;

    assert!(harness.store.record(&key).is_none());
    assert!(harness.cloud.resource_group("foo-rg").is_none());
    assert!(harness.cloud.virtual_network("foo-rg", "foo-vnet").is_none());
}
