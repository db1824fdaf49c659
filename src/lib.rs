//! AzureCluster controller - deadline-bounded reconciliation of Cluster API
//! infrastructure
//!
//! The controller converges one `AzureCluster` per call: it re-reads the
//! record by key, provisions the resource group and virtual network the
//! record describes, and reports whether (and when) it wants to be called
//! again. Every call runs inside an [`scope::ExecutionScope`] bounded by an
//! optional timeout, and every cloud call draws from one process-wide
//! [`rate_limit::RateLimiter`].
//!
//! # Modules
//!
//! - [`controller`] - The reconciler and its kube-runtime adapter
//! - [`state`] - State Accessor trait plus kube-backed and in-memory stores
//! - [`cloud`] - Cloud API trait, rate-limited client and in-memory backend
//! - [`scope`] - Execution scopes (deadline + cancellation)
//! - [`rate_limit`] - Shared token bucket for the cloud API budget
//! - [`logger`] - Injectable key/value logger
//! - [`crd`] - The AzureCluster Custom Resource Definition
//! - [`key`] - Resource keys and reconcile results
//! - [`error`] - Error types for the controller

#![deny(missing_docs)]

pub mod cloud;
pub mod controller;
pub mod crd;
pub mod error;
pub mod key;
pub mod logger;
pub mod rate_limit;
pub mod scope;
pub mod state;

pub use error::Error;
pub use key::{ReconcileResult, ResourceKey};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================

/// Finalizer guarding cloud resources until they are torn down
pub const CLUSTER_FINALIZER: &str = "azurecluster.infrastructure.cluster.x-k8s.io";

/// Annotation that pauses reconciliation of a cluster
pub const PAUSED_ANNOTATION: &str = "cluster.x-k8s.io/paused";

/// API group of the owning Cluster API `Cluster`
pub const CAPI_GROUP: &str = "cluster.x-k8s.io";

/// Prefix of the tag marking cloud resources as owned by a cluster
pub const OWNED_TAG_PREFIX: &str = "sigs.k8s.io_cluster-api-provider-azure_cluster_";

/// Address space used when a cluster does not specify one
pub const DEFAULT_VNET_CIDR: &str = "10.0.0.0/8";

/// Field manager name for server-side apply and status patches
pub const FIELD_MANAGER: &str = "azurecluster-controller";

/// Delay before re-checking a cloud operation that is still in progress
pub const ASYNC_OPERATION_REQUEUE: std::time::Duration = std::time::Duration::from_secs(15);
