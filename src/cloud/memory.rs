//! In-memory cloud backend
//!
//! Simulates Azure's asynchronous operations: a mutating call is accepted at
//! once and the resource reports Creating/Updating/Deleting until the
//! configured operation duration has elapsed on the tokio clock. Every
//! mutating call is appended to an action journal so callers can tell which
//! actions a reconcile pass issued.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::{CloudApi, ProvisioningState, ResourceGroup, VirtualNetwork};
use crate::error::{Error, Step};

/// A mutating call received by [`InMemoryCloud`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CloudAction {
    /// Resource group create or update
    CreateOrUpdateResourceGroup(String),
    /// Resource group deletion
    DeleteResourceGroup(String),
    /// Virtual network create or update
    CreateOrUpdateVirtualNetwork {
        /// Resource group of the network
        resource_group: String,
        /// Network name
        name: String,
    },
}

#[derive(Debug)]
struct Tracked<T> {
    resource: T,
    settles_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct CloudState {
    groups: HashMap<String, Tracked<ResourceGroup>>,
    vnets: HashMap<(String, String), Tracked<VirtualNetwork>>,
    actions: Vec<CloudAction>,
    fail_next: Option<String>,
}

impl CloudState {
    /// Finish every operation whose duration has elapsed
    fn settle(&mut self, now: Instant) {
        let mut removed = Vec::new();
        for (name, group) in self.groups.iter_mut() {
            if group.settles_at.is_some_and(|at| at <= now) {
                group.settles_at = None;
                if group.resource.provisioning_state == ProvisioningState::Deleting {
                    removed.push(name.clone());
                } else {
                    group.resource.provisioning_state = ProvisioningState::Succeeded;
                }
            }
        }
        for name in removed {
            self.groups.remove(&name);
            self.vnets.retain(|(group, _), _| *group != name);
        }

        for vnet in self.vnets.values_mut() {
            if vnet.settles_at.is_some_and(|at| at <= now) {
                vnet.settles_at = None;
                vnet.resource.provisioning_state = ProvisioningState::Succeeded;
            }
        }
    }

    fn take_failure(&mut self, step: Step) -> Result<(), Error> {
        match self.fail_next.take() {
            Some(message) => Err(Error::transient(step, message)),
            None => Ok(()),
        }
    }
}

/// Azure stand-in holding resource groups and virtual networks in memory
#[derive(Debug, Default)]
pub struct InMemoryCloud {
    state: Mutex<CloudState>,
    operation_duration: Duration,
}

impl InMemoryCloud {
    /// Create a cloud whose operations finish immediately
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep mutated resources in progress for `duration`
    pub fn with_operation_duration(mut self, duration: Duration) -> Self {
        self.operation_duration = duration;
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CloudState> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.settle(Instant::now());
        state
    }

    fn settles_at(&self) -> Option<Instant> {
        (!self.operation_duration.is_zero()).then(|| Instant::now() + self.operation_duration)
    }

    fn pending(&self, in_progress: ProvisioningState) -> ProvisioningState {
        if self.operation_duration.is_zero() {
            ProvisioningState::Succeeded
        } else {
            in_progress
        }
    }

    /// Mutating calls received so far, oldest first
    pub fn actions(&self) -> Vec<CloudAction> {
        self.lock().actions.clone()
    }

    /// Make the next call fail with a transient error carrying `message`
    pub fn fail_next(&self, message: impl Into<String>) {
        self.lock().fail_next = Some(message.into());
    }

    /// Current state of a resource group
    pub fn resource_group(&self, name: &str) -> Option<ResourceGroup> {
        self.lock().groups.get(name).map(|g| g.resource.clone())
    }

    /// Current state of a virtual network
    pub fn virtual_network(&self, resource_group: &str, name: &str) -> Option<VirtualNetwork> {
        self.lock()
            .vnets
            .get(&(resource_group.to_string(), name.to_string()))
            .map(|v| v.resource.clone())
    }

    /// Seed a resource group created outside the controller
    pub fn insert_resource_group(&self, group: ResourceGroup) {
        self.lock().groups.insert(
            group.name.clone(),
            Tracked {
                resource: group,
                settles_at: None,
            },
        );
    }

    /// Force the provisioning state of a resource group
    pub fn set_resource_group_state(&self, name: &str, provisioning_state: ProvisioningState) {
        if let Some(group) = self.lock().groups.get_mut(name) {
            group.resource.provisioning_state = provisioning_state;
            group.settles_at = None;
        }
    }
}

#[async_trait]
impl CloudApi for InMemoryCloud {
    async fn get_resource_group(&self, name: &str) -> Result<Option<ResourceGroup>, Error> {
        let mut state = self.lock();
        state.take_failure(Step::ResourceGroup)?;
        Ok(state.groups.get(name).map(|g| g.resource.clone()))
    }

    async fn create_or_update_resource_group(&self, group: &ResourceGroup) -> Result<(), Error> {
        let mut state = self.lock();
        state.take_failure(Step::ResourceGroup)?;
        state
            .actions
            .push(CloudAction::CreateOrUpdateResourceGroup(group.name.clone()));

        let in_progress = match state.groups.get(&group.name) {
            Some(existing) if existing.resource.provisioning_state == ProvisioningState::Deleting => {
                return Err(Error::transient(
                    Step::ResourceGroup,
                    format!("resource group {} is being deleted", group.name),
                ));
            }
            Some(_) => ProvisioningState::Updating,
            None => ProvisioningState::Creating,
        };

        let mut resource = group.clone();
        resource.provisioning_state = self.pending(in_progress);
        state.groups.insert(
            group.name.clone(),
            Tracked {
                resource,
                settles_at: self.settles_at(),
            },
        );
        Ok(())
    }

    async fn delete_resource_group(&self, name: &str) -> Result<(), Error> {
        let mut state = self.lock();
        state.take_failure(Step::Delete)?;
        if !state.groups.contains_key(name) {
            return Ok(());
        }
        state
            .actions
            .push(CloudAction::DeleteResourceGroup(name.to_string()));

        if self.operation_duration.is_zero() {
            state.groups.remove(name);
            state.vnets.retain(|(group, _), _| group != name);
            return Ok(());
        }
        let settles_at = self.settles_at();
        if let Some(group) = state.groups.get_mut(name) {
            group.resource.provisioning_state = ProvisioningState::Deleting;
            group.settles_at = settles_at;
        }
        Ok(())
    }

    async fn get_virtual_network(
        &self,
        resource_group: &str,
        name: &str,
    ) -> Result<Option<VirtualNetwork>, Error> {
        let mut state = self.lock();
        state.take_failure(Step::VirtualNetwork)?;
        Ok(state
            .vnets
            .get(&(resource_group.to_string(), name.to_string()))
            .map(|v| v.resource.clone()))
    }

    async fn create_or_update_virtual_network(&self, vnet: &VirtualNetwork) -> Result<(), Error> {
        let mut state = self.lock();
        state.take_failure(Step::VirtualNetwork)?;
        match state.groups.get(&vnet.resource_group) {
            Some(group) if group.resource.provisioning_state != ProvisioningState::Deleting => {}
            _ => {
                return Err(Error::transient(
                    Step::VirtualNetwork,
                    format!("resource group {} not found", vnet.resource_group),
                ));
            }
        }
        state.actions.push(CloudAction::CreateOrUpdateVirtualNetwork {
            resource_group: vnet.resource_group.clone(),
            name: vnet.name.clone(),
        });

        let id = (vnet.resource_group.clone(), vnet.name.clone());
        let in_progress = if state.vnets.contains_key(&id) {
            ProvisioningState::Updating
        } else {
            ProvisioningState::Creating
        };
        let mut resource = vnet.clone();
        resource.provisioning_state = self.pending(in_progress);
        state.vnets.insert(
            id,
            Tracked {
                resource,
                settles_at: self.settles_at(),
            },
        );
        Ok(())
    }
}
