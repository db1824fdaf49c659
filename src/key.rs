//! Resource keys and reconcile results
//!
//! These are the two values that cross the boundary between the scheduler and
//! the controller: the scheduler hands in a [`ResourceKey`], the controller
//! hands back a [`ReconcileResult`] (or an error).

use std::fmt;
use std::time::Duration;

use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};

/// Identifies one managed resource instance
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    /// Namespace of the resource
    pub namespace: String,
    /// Name of the resource
    pub name: String,
}

impl ResourceKey {
    /// Create a key from a namespace and name
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Build the key of a namespaced Kubernetes object
    ///
    /// Objects without a namespace map to `default`, which is where the API
    /// server places namespaced objects created without one.
    pub fn from_object<K: Resource>(obj: &K) -> Self {
        Self {
            namespace: obj.namespace().unwrap_or_else(|| "default".to_string()),
            name: obj.name_any(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Successful outcome of one reconcile pass
///
/// A zero `requeue_after` means the controller has nothing scheduled for this
/// key; the next pass happens only when the resource changes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReconcileResult {
    /// How long the scheduler should wait before reconciling the key again
    pub requeue_after: Duration,
}

impl ReconcileResult {
    /// Nothing further to do until the resource changes
    pub fn done() -> Self {
        Self::default()
    }

    /// Re-check the resource after the given delay
    pub fn requeue_after(delay: Duration) -> Self {
        Self {
            requeue_after: delay,
        }
    }

    /// Whether the scheduler should requeue the key on a timer
    pub fn is_requeue(&self) -> bool {
        !self.requeue_after.is_zero()
    }
}

impl From<ReconcileResult> for Action {
    fn from(result: ReconcileResult) -> Self {
        if result.is_requeue() {
            Action::requeue(result.requeue_after)
        } else {
            Action::await_change()
        }
    }
}
