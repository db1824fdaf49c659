//! In-memory State Accessor
//!
//! Mirrors the API server behaviors the reconciler depends on: resourceVersion
//! bumps on every write, optimistic concurrency on finalizer writes, status
//! writes applied as JSON merge patches, and deletion that waits for
//! finalizers to be removed.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::ResourceExt;

use super::StateAccessor;
use crate::crd::{AzureCluster, AzureClusterStatus};
use crate::error::{Error, Step};
use crate::key::ResourceKey;
use crate::scope::ExecutionScope;
use crate::CLUSTER_FINALIZER;

/// DashMap-backed store of AzureCluster records
#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    records: DashMap<ResourceKey, AzureCluster>,
    next_version: AtomicU64,
    latency: Duration,
    pending_conflicts: AtomicUsize,
    writes: AtomicUsize,
}

impl InMemoryStateStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every lookup by `latency`
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Store `cluster`, filling in the metadata the API server would assign
    pub fn insert(&self, mut cluster: AzureCluster) -> ResourceKey {
        if cluster.metadata.namespace.is_none() {
            cluster.metadata.namespace = Some("default".to_string());
        }
        if cluster.metadata.generation.is_none() {
            cluster.metadata.generation = Some(1);
        }
        let key = ResourceKey::from_object(&cluster);
        if cluster.metadata.uid.is_none() {
            cluster.metadata.uid = Some(format!("uid-{}", key));
        }
        self.bump(&mut cluster);
        self.records.insert(key.clone(), cluster);
        key
    }

    /// Current copy of the record for `key`
    pub fn record(&self, key: &ResourceKey) -> Option<AzureCluster> {
        self.records.get(key).map(|r| r.value().clone())
    }

    /// Mark the record for deletion
    ///
    /// A record without finalizers is removed at once. Returns false if there
    /// was no record.
    pub fn request_deletion(&self, key: &ResourceKey) -> bool {
        let remove_now = match self.records.get_mut(key) {
            Some(mut record) => {
                if record.metadata.deletion_timestamp.is_none() {
                    record.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
                    self.bump(&mut record);
                }
                record.finalizers().is_empty()
            }
            None => return false,
        };
        if remove_now {
            self.records.remove(key);
        }
        true
    }

    /// Make the next finalizer write fail as if the record changed underneath
    pub fn inject_conflict(&self) {
        self.pending_conflicts.fetch_add(1, Ordering::SeqCst);
    }

    /// Number of successful writes since the store was created
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn bump(&self, cluster: &mut AzureCluster) {
        let version = self.next_version.fetch_add(1, Ordering::SeqCst) + 1;
        cluster.metadata.resource_version = Some(version.to_string());
    }

    fn take_conflict(&self) -> bool {
        self.pending_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Apply `update` to the stored record if `expected` is still current
    fn write_finalizers(
        &self,
        expected: &AzureCluster,
        update: impl FnOnce(&mut Vec<String>),
    ) -> Result<(), Error> {
        let key = ResourceKey::from_object(expected);
        if self.take_conflict() {
            return Err(Error::conflict(
                Step::Finalizer,
                "the object has been modified; please apply your changes to the latest version",
            ));
        }

        let release = {
            let Some(mut record) = self.records.get_mut(&key) else {
                return Ok(());
            };
            if record.resource_version() != expected.resource_version() {
                return Err(Error::conflict(
                    Step::Finalizer,
                    format!(
                        "resourceVersion {} is stale",
                        expected.resource_version().unwrap_or_default()
                    ),
                ));
            }
            update(record.metadata.finalizers.get_or_insert_with(Vec::new));
            self.bump(&mut record);
            self.writes.fetch_add(1, Ordering::SeqCst);
            record.metadata.deletion_timestamp.is_some() && record.finalizers().is_empty()
        };

        if release {
            self.records.remove(&key);
        }
        Ok(())
    }
}

#[async_trait]
impl StateAccessor for InMemoryStateStore {
    async fn get(
        &self,
        _scope: &ExecutionScope,
        key: &ResourceKey,
    ) -> Result<Option<AzureCluster>, Error> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        Ok(self.record(key))
    }

    async fn patch_status(
        &self,
        _scope: &ExecutionScope,
        key: &ResourceKey,
        status: &AzureClusterStatus,
    ) -> Result<(), Error> {
        let Some(mut record) = self.records.get_mut(key) else {
            return Err(Error::transient(Step::Status, "record not found"));
        };
        let patch =
            serde_json::to_value(status).map_err(|e| Error::serialization(e.to_string()))?;
        let mut merged = match &record.status {
            Some(current) => {
                serde_json::to_value(current).map_err(|e| Error::serialization(e.to_string()))?
            }
            None => serde_json::Value::Object(Default::default()),
        };
        json_patch::merge(&mut merged, &patch);
        record.status = Some(
            serde_json::from_value(merged).map_err(|e| Error::serialization(e.to_string()))?,
        );
        self.bump(&mut record);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn add_finalizer(
        &self,
        _scope: &ExecutionScope,
        cluster: &AzureCluster,
    ) -> Result<(), Error> {
        if cluster.metadata.deletion_timestamp.is_some() {
            return Err(Error::transient(
                Step::Finalizer,
                "cannot add a finalizer to a record being deleted",
            ));
        }
        self.write_finalizers(cluster, |finalizers| {
            if !finalizers.iter().any(|f| f == CLUSTER_FINALIZER) {
                finalizers.push(CLUSTER_FINALIZER.to_string());
            }
        })
    }

    async fn remove_finalizer(
        &self,
        _scope: &ExecutionScope,
        cluster: &AzureCluster,
    ) -> Result<(), Error> {
        self.write_finalizers(cluster, |finalizers| {
            finalizers.retain(|f| f != CLUSTER_FINALIZER);
        })
    }
}
