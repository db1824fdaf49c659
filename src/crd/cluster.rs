//! AzureCluster Custom Resource Definition
//!
//! An AzureCluster is the infrastructure half of a Cluster API cluster: it
//! describes the resource group and virtual network the cluster's machines
//! run in. The owning CAPI `Cluster` links to it through an ownerReference.

use std::collections::BTreeMap;

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{ClusterPhase, Condition, NetworkSpec};
use crate::{Error, CAPI_GROUP, CLUSTER_FINALIZER, OWNED_TAG_PREFIX, PAUSED_ANNOTATION};

/// Specification for an AzureCluster
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "infrastructure.cluster.x-k8s.io",
    version = "v1alpha3",
    kind = "AzureCluster",
    plural = "azureclusters",
    shortname = "azc",
    status = "AzureClusterStatus",
    namespaced,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.ready"}"#,
    printcolumn = r#"{"name":"Location","type":"string","jsonPath":".spec.location"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct AzureClusterSpec {
    /// Azure region (e.g., "westeurope")
    pub location: String,

    /// Resource group holding all of the cluster's cloud resources
    pub resource_group: String,

    /// Virtual network and subnet layout
    #[serde(default)]
    pub network_spec: NetworkSpec,

    /// Extra tags applied to every cloud resource the controller creates
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub additional_tags: BTreeMap<String, String>,
}

impl AzureClusterSpec {
    /// Validate the cluster specification
    pub fn validate(&self) -> Result<(), Error> {
        if self.location.trim().is_empty() {
            return Err(Error::invalid_field(
                "spec.location",
                "location must not be empty",
            ));
        }
        if self.resource_group.trim().is_empty() {
            return Err(Error::invalid_field(
                "spec.resourceGroup",
                "resource group must not be empty",
            ));
        }
        if self.resource_group.len() > 90 {
            return Err(Error::invalid_field(
                "spec.resourceGroup",
                "resource group name must be at most 90 characters",
            ));
        }
        self.network_spec.validate()
    }
}

impl AzureCluster {
    /// Name of the owning CAPI Cluster, once the Cluster controller set it
    pub fn owner_cluster_name(&self) -> Option<&str> {
        self.metadata
            .owner_references
            .as_ref()?
            .iter()
            .find(|owner| {
                owner.kind == "Cluster"
                    && owner
                        .api_version
                        .split('/')
                        .next()
                        .is_some_and(|group| group == CAPI_GROUP)
            })
            .map(|owner| owner.name.as_str())
    }

    /// Returns true if reconciliation is paused by annotation
    pub fn is_paused(&self) -> bool {
        self.annotations().contains_key(PAUSED_ANNOTATION)
    }

    /// Returns true once deletion has been requested
    pub fn is_being_deleted(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Returns true if the controller's finalizer is present
    pub fn has_finalizer(&self) -> bool {
        self.finalizers().iter().any(|f| f == CLUSTER_FINALIZER)
    }

    /// Tags every cloud resource of this cluster must carry
    ///
    /// User-supplied tags first, then the ownership tag, which always wins.
    pub fn desired_tags(&self, cluster_name: &str) -> BTreeMap<String, String> {
        let mut tags = self.spec.additional_tags.clone();
        tags.insert(
            format!("{}{}", OWNED_TAG_PREFIX, cluster_name),
            "owned".to_string(),
        );
        tags
    }

    /// Current phase, defaulting to Pending when no status was written yet
    pub fn phase(&self) -> ClusterPhase {
        self.status
            .as_ref()
            .map(|s| s.phase.clone())
            .unwrap_or_default()
    }
}

/// Status for an AzureCluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AzureClusterStatus {
    /// True once the cluster's infrastructure is fully provisioned
    #[serde(default)]
    pub ready: bool,

    /// Current phase of the infrastructure lifecycle
    #[serde(default)]
    pub phase: ClusterPhase,

    /// Conditions representing the infrastructure state
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Machine-readable category of the last reconcile failure
    ///
    /// Serialized as `null` when cleared so a merge patch removes it.
    #[serde(default)]
    pub failure_reason: Option<String>,

    /// Human-readable description of the last reconcile failure
    #[serde(default)]
    pub failure_message: Option<String>,

    /// Generation of the spec the status was computed from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl AzureClusterStatus {
    /// Create a new status with the given phase
    pub fn with_phase(phase: ClusterPhase) -> Self {
        Self {
            phase,
            ..Default::default()
        }
    }

    /// Set the ready flag and return self for chaining
    pub fn ready(mut self, ready: bool) -> Self {
        self.ready = ready;
        self
    }

    /// Set the observed generation and return self for chaining
    pub fn observed_generation(mut self, generation: Option<i64>) -> Self {
        self.observed_generation = generation;
        self
    }

    /// Record a failure and return self for chaining
    pub fn failure(mut self, reason: impl Into<String>, message: impl Into<String>) -> Self {
        self.failure_reason = Some(reason.into());
        self.failure_message = Some(message.into());
        self
    }

    /// Add a condition and return self for chaining
    pub fn condition(mut self, condition: Condition) -> Self {
        // Remove existing condition of the same type
        self.conditions.retain(|c| c.type_ != condition.type_);
        self.conditions.push(condition);
        self
    }

    /// Carry over transition times from `previous` for conditions whose
    /// status did not change
    pub fn keep_transition_times(mut self, previous: Option<&AzureClusterStatus>) -> Self {
        let Some(previous) = previous else {
            return self;
        };
        for condition in &mut self.conditions {
            if let Some(old) = previous
                .conditions
                .iter()
                .find(|c| c.type_ == condition.type_ && c.status == condition.status)
            {
                condition.last_transition_time = old.last_transition_time;
            }
        }
        self
    }

    /// Returns true if `other` carries the same observable state
    ///
    /// Condition timestamps are ignored so re-deriving the same status never
    /// causes a write.
    pub fn same_state(&self, other: &AzureClusterStatus) -> bool {
        self.ready == other.ready
            && self.phase == other.phase
            && self.failure_reason == other.failure_reason
            && self.failure_message == other.failure_message
            && self.observed_generation == other.observed_generation
            && self.conditions.len() == other.conditions.len()
            && self.conditions.iter().all(|c| {
                other
                    .conditions
                    .iter()
                    .any(|o| o.type_ == c.type_ && o.same_state(c))
            })
    }
}
