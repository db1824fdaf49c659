//! Custom Resource Definitions reconciled by the controller

mod cluster;
mod types;

pub use cluster::{AzureCluster, AzureClusterSpec, AzureClusterStatus};
pub use types::{
    CidrError, ClusterPhase, Condition, ConditionStatus, Ipv4Cidr, NetworkSpec, SubnetRole,
    SubnetSpec, VnetSpec,
};
