//! Supporting types for the AzureCluster CRD

use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error as ThisError;

use crate::Error;

/// Network layout of the cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkSpec {
    /// Virtual network the cluster lives in
    #[serde(default)]
    pub vnet: VnetSpec,

    /// Subnets carved out of the virtual network
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subnets: Vec<SubnetSpec>,
}

impl NetworkSpec {
    /// Validates the network layout
    pub fn validate(&self) -> Result<(), Error> {
        self.vnet.validate()?;
        let vnet = Ipv4Cidr::parse(&self.vnet.cidr_block).map_err(|e| {
            Error::invalid_field("spec.networkSpec.vnet.cidrBlock", e.to_string())
        })?;

        for (i, subnet) in self.subnets.iter().enumerate() {
            let field = format!("spec.networkSpec.subnets[{}]", i);
            if subnet.name.is_empty() {
                return Err(Error::invalid_field(
                    format!("{}.name", field),
                    "subnet name must not be empty",
                ));
            }
            let cidr = Ipv4Cidr::parse(&subnet.cidr_block)
                .map_err(|e| Error::invalid_field(format!("{}.cidrBlock", field), e.to_string()))?;
            if !vnet.contains(&cidr) {
                return Err(Error::invalid_field(
                    format!("{}.cidrBlock", field),
                    format!(
                        "subnet {} ({}) is outside vnet {} ({})",
                        subnet.name, subnet.cidr_block, self.vnet.name, self.vnet.cidr_block
                    ),
                ));
            }
            if self.subnets[..i].iter().any(|s| s.name == subnet.name) {
                return Err(Error::invalid_field(
                    format!("{}.name", field),
                    format!("duplicate subnet name {}", subnet.name),
                ));
            }
            if self.subnets[..i].iter().any(|s| s.role == subnet.role) {
                return Err(Error::invalid_field(
                    format!("{}.role", field),
                    format!("more than one subnet with role {}", subnet.role),
                ));
            }
        }
        Ok(())
    }
}

/// Virtual network specification
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VnetSpec {
    /// Name of the virtual network
    pub name: String,

    /// Address space of the virtual network
    pub cidr_block: String,
}

impl Default for VnetSpec {
    fn default() -> Self {
        Self {
            name: String::new(),
            cidr_block: crate::DEFAULT_VNET_CIDR.to_string(),
        }
    }
}

impl VnetSpec {
    /// Validates the virtual network specification
    pub fn validate(&self) -> Result<(), Error> {
        if self.name.is_empty() {
            return Err(Error::invalid_field(
                "spec.networkSpec.vnet.name",
                "vnet name must not be empty",
            ));
        }
        Ok(())
    }
}

/// Role a subnet plays in the cluster
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SubnetRole {
    /// Subnet for control plane machines
    ControlPlane,
    /// Subnet for worker machines
    #[default]
    Node,
}

impl std::fmt::Display for SubnetRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ControlPlane => write!(f, "control-plane"),
            Self::Node => write!(f, "node"),
        }
    }
}

/// Subnet specification
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SubnetSpec {
    /// Name of the subnet
    pub name: String,

    /// Role of the machines placed in this subnet
    #[serde(default)]
    pub role: SubnetRole,

    /// Address range of the subnet, inside the vnet's range
    pub cidr_block: String,
}

/// Reason a CIDR string was rejected
#[derive(Debug, ThisError, PartialEq, Eq)]
#[error("{0}")]
pub struct CidrError(String);

/// An IPv4 network in CIDR notation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ipv4Cidr {
    network: u32,
    prefix: u8,
}

impl Ipv4Cidr {
    /// Parse `a.b.c.d/n`
    pub fn parse(s: &str) -> Result<Self, CidrError> {
        let (addr, prefix) = s
            .split_once('/')
            .ok_or_else(|| CidrError(format!("{} is not in CIDR notation", s)))?;
        let addr: Ipv4Addr = addr
            .parse()
            .map_err(|_| CidrError(format!("{} has an invalid IPv4 address", s)))?;
        let prefix: u8 = prefix
            .parse()
            .ok()
            .filter(|p| *p <= 32)
            .ok_or_else(|| CidrError(format!("{} has an invalid prefix length", s)))?;

        Ok(Self {
            network: u32::from(addr) & Self::mask(prefix),
            prefix,
        })
    }

    fn mask(prefix: u8) -> u32 {
        if prefix == 0 {
            0
        } else {
            u32::MAX << (32 - prefix)
        }
    }

    /// Returns true if `other` lies entirely within this network
    pub fn contains(&self, other: &Ipv4Cidr) -> bool {
        other.prefix >= self.prefix && (other.network & Self::mask(self.prefix)) == self.network
    }
}

/// Cluster infrastructure lifecycle phase
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[non_exhaustive]
pub enum ClusterPhase {
    /// Infrastructure has not been touched yet
    #[default]
    Pending,
    /// Cloud resources are being created or updated
    Provisioning,
    /// All cloud resources match the spec
    Ready,
    /// Cloud resources are being torn down
    Deleting,
    /// The spec cannot be reconciled without a change
    Failed,
}

impl std::fmt::Display for ClusterPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Provisioning => write!(f, "Provisioning"),
            Self::Ready => write!(f, "Ready"),
            Self::Deleting => write!(f, "Deleting"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Condition status following Kubernetes conventions
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Kubernetes-style condition for status reporting
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Condition {
    /// Type of condition (e.g., Ready, NetworkReady)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the condition transitioned
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition with the current timestamp
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }

    /// Returns true if both conditions say the same thing, ignoring timestamps
    pub fn same_state(&self, other: &Condition) -> bool {
        self.type_ == other.type_
            && self.status == other.status
            && self.reason == other.reason
            && self.message == other.message
    }
}
