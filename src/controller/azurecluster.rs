//! AzureCluster reconciler
//!
//! One call converges one resource key: re-read the record, then walk the
//! finalizer, resource group, virtual network and status in order, stopping
//! at the first step that is still waiting on Azure. Every blocking call runs
//! inside the per-call [`ExecutionScope`], so the configured timeout bounds the
//! whole pass.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use kube::ResourceExt;
use tracing::{debug, instrument};

use crate::cloud::{CloudApi, CloudClient, ProvisioningState, ResourceGroup, Subnet, VirtualNetwork};
use crate::crd::{AzureCluster, AzureClusterStatus, ClusterPhase, Condition, ConditionStatus};
use crate::error::{Error, Step};
use crate::key::{ReconcileResult, ResourceKey};
use crate::logger::{ReconcileLogger, TracingLogger};
use crate::rate_limit::{RateLimitConfig, RateLimiter};
use crate::scope::ExecutionScope;
use crate::state::StateAccessor;
use crate::{ASYNC_OPERATION_REQUEUE, OWNED_TAG_PREFIX};

/// Condition type summarizing infrastructure readiness
const READY_CONDITION: &str = "Ready";

/// Outcome of converging one cloud resource
#[derive(Debug, PartialEq)]
enum Progress {
    /// The resource matches the spec
    Ready,
    /// An Azure operation is running; carries a description for status
    Waiting(String),
}

/// Drives AzureCluster records toward their spec
///
/// Safe to call concurrently for different keys. Calls for the same key may
/// race; a lost write surfaces as a conflict error and the next call re-reads.
pub struct AzureClusterReconciler {
    state: Arc<dyn StateAccessor>,
    cloud: CloudClient,
    log: Arc<dyn ReconcileLogger>,
    reconcile_timeout: Option<Duration>,
}

impl AzureClusterReconciler {
    /// Create a builder for constructing a reconciler
    pub fn builder(
        state: Arc<dyn StateAccessor>,
        cloud: Arc<dyn CloudApi>,
    ) -> AzureClusterReconcilerBuilder {
        AzureClusterReconcilerBuilder::new(state, cloud)
    }

    /// Per-call timeout, `None` when calls inherit the caller's deadline
    pub fn reconcile_timeout(&self) -> Option<Duration> {
        self.reconcile_timeout
    }

    /// The State Accessor this reconciler reads through
    pub fn state(&self) -> &Arc<dyn StateAccessor> {
        &self.state
    }

    /// Reconcile the AzureCluster identified by `key`
    ///
    /// Returns `Ok` with a zero requeue when the record is absent, paused, not
    /// yet owned, or fully converged. Returns a positive requeue while an
    /// Azure operation is in progress. Errors carry the key and the step that
    /// failed.
    #[instrument(skip(self, scope, key), fields(key = %key))]
    pub async fn reconcile(
        &self,
        scope: &ExecutionScope,
        key: &ResourceKey,
    ) -> Result<ReconcileResult, Error> {
        // The guard cancels the derived scope on every exit path
        let (scope, _guard) = scope.child(self.reconcile_timeout);

        let log = self
            .log
            .with_values(&[("namespace", key.namespace.as_str()), ("name", key.name.as_str())]);

        match self.reconcile_in_scope(&scope, key, log.as_ref()).await {
            Ok(result) => Ok(result),
            Err(e) => {
                let err = e.for_key(key);
                log.error(&err, "reconcile failed");
                Err(err)
            }
        }
    }

    async fn reconcile_in_scope(
        &self,
        scope: &ExecutionScope,
        key: &ResourceKey,
        log: &dyn ReconcileLogger,
    ) -> Result<ReconcileResult, Error> {
        // Building the logger may itself have used up the budget
        scope.check(Step::Logging)?;

        let Some(cluster) = scope.run(Step::Lookup, self.state.get(scope, key)).await? else {
            log.info("AzureCluster not found, nothing to reconcile");
            return Ok(ReconcileResult::done());
        };

        if cluster.is_paused() {
            log.info("reconciliation is paused");
            return Ok(ReconcileResult::done());
        }

        if cluster.is_being_deleted() {
            return self.reconcile_delete(scope, key, &cluster, log).await;
        }

        let Some(cluster_name) = cluster.owner_cluster_name() else {
            log.info("waiting for the Cluster controller to set the owner reference");
            return Ok(ReconcileResult::done());
        };

        cluster.spec.validate()?;

        if !cluster.has_finalizer() {
            scope
                .run(Step::Finalizer, self.state.add_finalizer(scope, &cluster))
                .await?;
            log.info("added finalizer");
        }

        if let Progress::Waiting(message) = self
            .reconcile_resource_group(scope, &cluster, cluster_name, log)
            .await?
        {
            return self.wait_for_operation(scope, key, &cluster, message).await;
        }

        if let Progress::Waiting(message) = self
            .reconcile_virtual_network(scope, &cluster, cluster_name, log)
            .await?
        {
            return self.wait_for_operation(scope, key, &cluster, message).await;
        }

        let ready = AzureClusterStatus::with_phase(ClusterPhase::Ready)
            .ready(true)
            .observed_generation(cluster.metadata.generation)
            .condition(Condition::new(
                READY_CONDITION,
                ConditionStatus::True,
                "InfrastructureReady",
                "resource group and virtual network are provisioned",
            ));
        if self.update_status(scope, key, &cluster, ready).await? {
            log.info("infrastructure is ready");
        }

        Ok(ReconcileResult::done())
    }

    /// Record provisioning progress and ask to be called again
    async fn wait_for_operation(
        &self,
        scope: &ExecutionScope,
        key: &ResourceKey,
        cluster: &AzureCluster,
        message: String,
    ) -> Result<ReconcileResult, Error> {
        let provisioning = AzureClusterStatus::with_phase(ClusterPhase::Provisioning)
            .observed_generation(cluster.metadata.generation)
            .condition(Condition::new(
                READY_CONDITION,
                ConditionStatus::False,
                "Provisioning",
                message,
            ));
        self.update_status(scope, key, cluster, provisioning).await?;
        Ok(ReconcileResult::requeue_after(ASYNC_OPERATION_REQUEUE))
    }

    async fn reconcile_resource_group(
        &self,
        scope: &ExecutionScope,
        cluster: &AzureCluster,
        cluster_name: &str,
        log: &dyn ReconcileLogger,
    ) -> Result<Progress, Error> {
        let spec = &cluster.spec;
        let desired = ResourceGroup {
            name: spec.resource_group.clone(),
            location: spec.location.clone(),
            tags: cluster.desired_tags(cluster_name),
            provisioning_state: ProvisioningState::Succeeded,
        };

        let Some(existing) = self.cloud.get_resource_group(scope, &desired.name).await? else {
            self.cloud
                .create_or_update_resource_group(scope, &desired)
                .await?;
            log.info("creating resource group");
            return Ok(Progress::Waiting(format!(
                "creating resource group {}",
                desired.name
            )));
        };

        match existing.provisioning_state {
            ProvisioningState::Failed => Err(Error::transient(
                Step::ResourceGroup,
                format!("resource group {} is in state Failed", existing.name),
            )),
            state if state.is_in_progress() => Ok(Progress::Waiting(format!(
                "resource group {} is {}",
                existing.name, state
            ))),
            _ if !is_owned(&existing.tags, cluster_name) => {
                debug!(resource_group = %existing.name, "resource group is not managed, leaving it as is");
                Ok(Progress::Ready)
            }
            _ if has_tags(&existing.tags, &desired.tags) => Ok(Progress::Ready),
            _ => {
                let mut updated = existing.clone();
                updated.tags.extend(desired.tags);
                self.cloud
                    .create_or_update_resource_group(scope, &updated)
                    .await?;
                log.info("updating resource group tags");
                Ok(Progress::Waiting(format!(
                    "updating resource group {}",
                    existing.name
                )))
            }
        }
    }

    async fn reconcile_virtual_network(
        &self,
        scope: &ExecutionScope,
        cluster: &AzureCluster,
        cluster_name: &str,
        log: &dyn ReconcileLogger,
    ) -> Result<Progress, Error> {
        let spec = &cluster.spec;
        let network = &spec.network_spec;
        let desired = VirtualNetwork {
            resource_group: spec.resource_group.clone(),
            name: network.vnet.name.clone(),
            location: spec.location.clone(),
            address_space: network.vnet.cidr_block.clone(),
            subnets: network
                .subnets
                .iter()
                .map(|s| Subnet {
                    name: s.name.clone(),
                    address_prefix: s.cidr_block.clone(),
                })
                .collect(),
            tags: cluster.desired_tags(cluster_name),
            provisioning_state: ProvisioningState::Succeeded,
        };

        let Some(existing) = self
            .cloud
            .get_virtual_network(scope, &desired.resource_group, &desired.name)
            .await?
        else {
            self.cloud
                .create_or_update_virtual_network(scope, &desired)
                .await?;
            log.info("creating virtual network");
            return Ok(Progress::Waiting(format!(
                "creating virtual network {}",
                desired.name
            )));
        };

        match existing.provisioning_state {
            ProvisioningState::Failed => Err(Error::transient(
                Step::VirtualNetwork,
                format!("virtual network {} is in state Failed", existing.name),
            )),
            state if state.is_in_progress() => Ok(Progress::Waiting(format!(
                "virtual network {} is {}",
                existing.name, state
            ))),
            _ if !is_owned(&existing.tags, cluster_name) => {
                debug!(vnet = %existing.name, "virtual network is not managed, leaving it as is");
                Ok(Progress::Ready)
            }
            _ if existing.same_layout(&desired) => Ok(Progress::Ready),
            _ => {
                self.cloud
                    .create_or_update_virtual_network(scope, &desired)
                    .await?;
                log.info("updating virtual network layout");
                Ok(Progress::Waiting(format!(
                    "updating virtual network {}",
                    desired.name
                )))
            }
        }
    }

    async fn reconcile_delete(
        &self,
        scope: &ExecutionScope,
        key: &ResourceKey,
        cluster: &AzureCluster,
        log: &dyn ReconcileLogger,
    ) -> Result<ReconcileResult, Error> {
        if !cluster.has_finalizer() {
            return Ok(ReconcileResult::done());
        }

        let resource_group = &cluster.spec.resource_group;
        let existing = match cluster.owner_cluster_name() {
            Some(cluster_name) if !resource_group.is_empty() => self
                .cloud
                .get_resource_group(scope, resource_group)
                .await?
                .filter(|group| is_owned(&group.tags, cluster_name)),
            _ => None,
        };

        let Some(group) = existing else {
            scope
                .run(Step::Finalizer, self.state.remove_finalizer(scope, cluster))
                .await?;
            log.info("cloud resources are gone, removed finalizer");
            return Ok(ReconcileResult::done());
        };

        if group.provisioning_state != ProvisioningState::Deleting {
            self.cloud.delete_resource_group(scope, &group.name).await?;
            log.info("deleting resource group");
        }

        let deleting = AzureClusterStatus::with_phase(ClusterPhase::Deleting)
            .observed_generation(cluster.metadata.generation)
            .condition(Condition::new(
                READY_CONDITION,
                ConditionStatus::False,
                "Deleting",
                format!("deleting resource group {}", group.name),
            ));
        self.update_status(scope, key, cluster, deleting).await?;
        Ok(ReconcileResult::requeue_after(ASYNC_OPERATION_REQUEUE))
    }

    /// Write `desired` unless the record already says the same thing
    ///
    /// Returns whether a write happened.
    async fn update_status(
        &self,
        scope: &ExecutionScope,
        key: &ResourceKey,
        cluster: &AzureCluster,
        desired: AzureClusterStatus,
    ) -> Result<bool, Error> {
        if cluster
            .status
            .as_ref()
            .is_some_and(|current| current.same_state(&desired))
        {
            debug!(cluster = %cluster.name_any(), "Status unchanged, skipping update");
            return Ok(false);
        }
        let desired = desired.keep_transition_times(cluster.status.as_ref());
        scope
            .run(Step::Status, self.state.patch_status(scope, key, &desired))
            .await?;
        Ok(true)
    }
}

/// Whether `tags` mark a resource as owned by `cluster_name`
fn is_owned(tags: &BTreeMap<String, String>, cluster_name: &str) -> bool {
    tags.get(&format!("{}{}", OWNED_TAG_PREFIX, cluster_name))
        .is_some_and(|v| v == "owned")
}

/// Whether `actual` carries every tag in `wanted`
fn has_tags(actual: &BTreeMap<String, String>, wanted: &BTreeMap<String, String>) -> bool {
    wanted.iter().all(|(k, v)| actual.get(k) == Some(v))
}

/// Builder for constructing [`AzureClusterReconciler`] instances
///
/// ```ignore
/// let reconciler = AzureClusterReconciler::builder(state, cloud)
///     .limiter(Arc::new(RateLimiter::new(RateLimitConfig::default())))
///     .reconcile_timeout(Duration::from_secs(30))
///     .build();
/// ```
pub struct AzureClusterReconcilerBuilder {
    state: Arc<dyn StateAccessor>,
    cloud: Arc<dyn CloudApi>,
    limiter: Option<Arc<RateLimiter>>,
    log: Option<Arc<dyn ReconcileLogger>>,
    reconcile_timeout: Option<Duration>,
}

impl AzureClusterReconcilerBuilder {
    fn new(state: Arc<dyn StateAccessor>, cloud: Arc<dyn CloudApi>) -> Self {
        Self {
            state,
            cloud,
            limiter: None,
            log: None,
            reconcile_timeout: None,
        }
    }

    /// Share a process-wide limiter instead of creating a private one
    pub fn limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Override the logger (primarily for testing)
    pub fn logger(mut self, log: Arc<dyn ReconcileLogger>) -> Self {
        self.log = Some(log);
        self
    }

    /// Bound every call by `timeout`; zero leaves calls unbounded
    pub fn reconcile_timeout(mut self, timeout: Duration) -> Self {
        self.reconcile_timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    /// Build the reconciler
    pub fn build(self) -> AzureClusterReconciler {
        let limiter = self
            .limiter
            .unwrap_or_else(|| Arc::new(RateLimiter::new(RateLimitConfig::default())));
        AzureClusterReconciler {
            state: self.state,
            cloud: CloudClient::new(self.cloud, limiter),
            log: self.log.unwrap_or_else(|| Arc::new(TracingLogger::new())),
            reconcile_timeout: self.reconcile_timeout,
        }
    }
}
