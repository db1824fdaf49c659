//! State Accessor: reads and writes AzureCluster records by key
//!
//! The reconciler never caches a record across calls. It re-reads through
//! [`StateAccessor::get`] at the start of every pass, and writes back only the
//! finalizer list and the status subresource.
//!
//! Two implementations ship with the crate: [`KubeStateAccessor`] talks to the
//! API server, [`InMemoryStateStore`] backs tests and local runs.

mod memory;

use async_trait::async_trait;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, ResourceExt};

#[cfg(test)]
use mockall::automock;

use crate::crd::{AzureCluster, AzureClusterStatus};
use crate::error::{Error, Step};
use crate::key::ResourceKey;
use crate::scope::ExecutionScope;
use crate::{CLUSTER_FINALIZER, FIELD_MANAGER};

pub use memory::InMemoryStateStore;

/// Trait abstracting record storage for AzureCluster
///
/// This trait allows mocking the backing store in tests while using the
/// Kubernetes API in production. Callers bind every call to their scope, so
/// implementations need not enforce deadlines themselves.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StateAccessor: Send + Sync {
    /// Read the record for `key`
    ///
    /// Returns `Ok(None)` when no record exists; that is not an error.
    async fn get(
        &self,
        scope: &ExecutionScope,
        key: &ResourceKey,
    ) -> Result<Option<AzureCluster>, Error>;

    /// Replace the status subresource of the record for `key`
    async fn patch_status(
        &self,
        scope: &ExecutionScope,
        key: &ResourceKey,
        status: &AzureClusterStatus,
    ) -> Result<(), Error>;

    /// Add the controller's finalizer to `cluster`
    ///
    /// The write is conditional on the record's resourceVersion; a concurrent
    /// modification surfaces as [`Error::Conflict`].
    async fn add_finalizer(&self, scope: &ExecutionScope, cluster: &AzureCluster)
        -> Result<(), Error>;

    /// Remove the controller's finalizer from `cluster`
    ///
    /// Removing it from a record that is already gone succeeds.
    async fn remove_finalizer(
        &self,
        scope: &ExecutionScope,
        cluster: &AzureCluster,
    ) -> Result<(), Error>;
}

/// Real Kubernetes State Accessor
pub struct KubeStateAccessor {
    client: Client,
}

impl KubeStateAccessor {
    /// Create a new accessor wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<AzureCluster> {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn patch_finalizers(
        &self,
        cluster: &AzureCluster,
        finalizers: Vec<String>,
    ) -> Result<(), Error> {
        let key = ResourceKey::from_object(cluster);
        // Including resourceVersion makes the API server reject stale writes
        let patch = serde_json::json!({
            "metadata": {
                "finalizers": finalizers,
                "resourceVersion": cluster.resource_version(),
            }
        });

        match self
            .api(&key.namespace)
            .patch(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(Error::kube(Step::Finalizer, e)),
        }
    }
}

#[async_trait]
impl StateAccessor for KubeStateAccessor {
    async fn get(
        &self,
        _scope: &ExecutionScope,
        key: &ResourceKey,
    ) -> Result<Option<AzureCluster>, Error> {
        self.api(&key.namespace)
            .get_opt(&key.name)
            .await
            .map_err(|e| Error::kube(Step::Lookup, e))
    }

    async fn patch_status(
        &self,
        _scope: &ExecutionScope,
        key: &ResourceKey,
        status: &AzureClusterStatus,
    ) -> Result<(), Error> {
        let status_patch = serde_json::json!({
            "status": status
        });

        self.api(&key.namespace)
            .patch_status(
                &key.name,
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&status_patch),
            )
            .await
            .map_err(|e| Error::kube(Step::Status, e))?;

        Ok(())
    }

    async fn add_finalizer(
        &self,
        _scope: &ExecutionScope,
        cluster: &AzureCluster,
    ) -> Result<(), Error> {
        let mut finalizers = cluster.finalizers().to_vec();
        if finalizers.iter().any(|f| f == CLUSTER_FINALIZER) {
            return Ok(());
        }
        finalizers.push(CLUSTER_FINALIZER.to_string());
        self.patch_finalizers(cluster, finalizers).await
    }

    async fn remove_finalizer(
        &self,
        _scope: &ExecutionScope,
        cluster: &AzureCluster,
    ) -> Result<(), Error> {
        let finalizers: Vec<String> = cluster
            .finalizers()
            .iter()
            .filter(|f| f.as_str() != CLUSTER_FINALIZER)
            .cloned()
            .collect();
        if finalizers.len() == cluster.finalizers().len() {
            return Ok(());
        }
        self.patch_finalizers(cluster, finalizers).await
    }
}
