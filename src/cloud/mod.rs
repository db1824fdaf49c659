//! Cloud API seam and the rate-limited client the reconciler calls through
//!
//! [`CloudApi`] is the transport-level interface (one method per Azure REST
//! operation the controller needs). [`CloudClient`] wraps it: every call first
//! draws one token from the shared [`RateLimiter`] and then runs bounded by the
//! caller's [`ExecutionScope`]. The reconciler only ever holds a
//! [`CloudClient`], so no cloud call can skip the budget.

mod memory;

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[cfg(test)]
use mockall::automock;

use crate::error::{Error, Step};
use crate::rate_limit::RateLimiter;
use crate::scope::ExecutionScope;

pub use memory::{CloudAction, InMemoryCloud};

/// Lifecycle state Azure reports for a resource
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProvisioningState {
    /// Creation accepted, still running
    Creating,
    /// Update accepted, still running
    Updating,
    /// The last operation finished
    #[default]
    Succeeded,
    /// Deletion accepted, still running
    Deleting,
    /// The last operation failed
    Failed,
}

impl ProvisioningState {
    /// Whether an asynchronous operation is still running
    pub fn is_in_progress(&self) -> bool {
        matches!(self, Self::Creating | Self::Updating | Self::Deleting)
    }
}

impl fmt::Display for ProvisioningState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Creating => write!(f, "Creating"),
            Self::Updating => write!(f, "Updating"),
            Self::Succeeded => write!(f, "Succeeded"),
            Self::Deleting => write!(f, "Deleting"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// An Azure resource group
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceGroup {
    /// Resource group name
    pub name: String,
    /// Azure region
    pub location: String,
    /// Resource tags
    pub tags: BTreeMap<String, String>,
    /// Lifecycle state
    pub provisioning_state: ProvisioningState,
}

/// A subnet of a virtual network
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Subnet {
    /// Subnet name
    pub name: String,
    /// Subnet address range
    pub address_prefix: String,
}

/// An Azure virtual network
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualNetwork {
    /// Resource group the network lives in
    pub resource_group: String,
    /// Network name
    pub name: String,
    /// Azure region
    pub location: String,
    /// Network address range
    pub address_space: String,
    /// Subnets carved out of the address space
    pub subnets: Vec<Subnet>,
    /// Resource tags
    pub tags: BTreeMap<String, String>,
    /// Lifecycle state
    pub provisioning_state: ProvisioningState,
}

impl VirtualNetwork {
    /// Whether the address layout matches `desired`, ignoring subnet order
    pub fn same_layout(&self, desired: &VirtualNetwork) -> bool {
        let mut actual = self.subnets.clone();
        let mut wanted = desired.subnets.clone();
        actual.sort();
        wanted.sort();
        self.address_space == desired.address_space && actual == wanted
    }
}

/// Trait abstracting the Azure operations the controller issues
///
/// Mutating operations are asynchronous on the Azure side: they return once
/// the request is accepted, and the resource reports a [`ProvisioningState`]
/// in progress until the operation finishes.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CloudApi: Send + Sync {
    /// Fetch a resource group, `None` if it does not exist
    async fn get_resource_group(&self, name: &str) -> Result<Option<ResourceGroup>, Error>;

    /// Create or update a resource group
    async fn create_or_update_resource_group(&self, group: &ResourceGroup) -> Result<(), Error>;

    /// Start deleting a resource group and everything in it
    async fn delete_resource_group(&self, name: &str) -> Result<(), Error>;

    /// Fetch a virtual network, `None` if it does not exist
    async fn get_virtual_network(
        &self,
        resource_group: &str,
        name: &str,
    ) -> Result<Option<VirtualNetwork>, Error>;

    /// Create or update a virtual network
    async fn create_or_update_virtual_network(&self, vnet: &VirtualNetwork) -> Result<(), Error>;
}

/// Rate-limited, scope-bound access to a [`CloudApi`]
#[derive(Clone)]
pub struct CloudClient {
    api: Arc<dyn CloudApi>,
    limiter: Arc<RateLimiter>,
}

impl CloudClient {
    /// Wrap `api`, drawing budget from `limiter`
    pub fn new(api: Arc<dyn CloudApi>, limiter: Arc<RateLimiter>) -> Self {
        Self { api, limiter }
    }

    /// The shared limiter this client draws from
    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    async fn call<T, F>(&self, scope: &ExecutionScope, step: Step, request: F) -> Result<T, Error>
    where
        F: Future<Output = Result<T, Error>>,
    {
        self.limiter.wait(scope, 1).await?;
        scope.run(step, request).await
    }

    /// Fetch a resource group
    pub async fn get_resource_group(
        &self,
        scope: &ExecutionScope,
        name: &str,
    ) -> Result<Option<ResourceGroup>, Error> {
        self.call(scope, Step::ResourceGroup, self.api.get_resource_group(name))
            .await
    }

    /// Create or update a resource group
    pub async fn create_or_update_resource_group(
        &self,
        scope: &ExecutionScope,
        group: &ResourceGroup,
    ) -> Result<(), Error> {
        self.call(
            scope,
            Step::ResourceGroup,
            self.api.create_or_update_resource_group(group),
        )
        .await
    }

    /// Start deleting a resource group
    pub async fn delete_resource_group(
        &self,
        scope: &ExecutionScope,
        name: &str,
    ) -> Result<(), Error> {
        self.call(scope, Step::Delete, self.api.delete_resource_group(name))
            .await
    }

    /// Fetch a virtual network
    pub async fn get_virtual_network(
        &self,
        scope: &ExecutionScope,
        resource_group: &str,
        name: &str,
    ) -> Result<Option<VirtualNetwork>, Error> {
        self.call(
            scope,
            Step::VirtualNetwork,
            self.api.get_virtual_network(resource_group, name),
        )
        .await
    }

    /// Create or update a virtual network
    pub async fn create_or_update_virtual_network(
        &self,
        scope: &ExecutionScope,
        vnet: &VirtualNetwork,
    ) -> Result<(), Error> {
        self.call(
            scope,
            Step::VirtualNetwork,
            self.api.create_or_update_virtual_network(vnet),
        )
        .await
    }
}
