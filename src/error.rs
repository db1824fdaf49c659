//! Error types for the AzureCluster controller
//!
//! Every error carries the resource key and the reconcile step it came from so
//! a failure can be traced back without log correlation. The display strings
//! of the deadline and cancellation variants are stable: callers that only see
//! the message can compare it against [`DEADLINE_EXCEEDED`] and [`CANCELLED`].

use std::fmt;

use thiserror::Error;

/// Placeholder used before an error has been attributed to a resource key
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Stable message of [`Error::DeadlineExceeded`]
pub const DEADLINE_EXCEEDED: &str = "context deadline exceeded";

/// Stable message of [`Error::Cancelled`]
pub const CANCELLED: &str = "context canceled";

/// The part of a reconcile pass an error originated from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Step {
    /// Building the per-call logger
    Logging,
    /// Reading the resource record
    Lookup,
    /// Adding or removing the finalizer
    Finalizer,
    /// Converging the resource group
    ResourceGroup,
    /// Converging the virtual network
    VirtualNetwork,
    /// Writing the status subresource
    Status,
    /// Tearing down cloud resources
    Delete,
    /// Waiting for cloud API budget
    RateLimit,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Logging => write!(f, "logging"),
            Self::Lookup => write!(f, "lookup"),
            Self::Finalizer => write!(f, "finalizer"),
            Self::ResourceGroup => write!(f, "resource-group"),
            Self::VirtualNetwork => write!(f, "virtual-network"),
            Self::Status => write!(f, "status"),
            Self::Delete => write!(f, "delete"),
            Self::RateLimit => write!(f, "rate-limit"),
        }
    }
}

/// Coarse classification of an error, used for backoff and status reporting
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCategory {
    /// The per-call deadline passed before the work finished
    DeadlineExceeded,
    /// The caller cancelled the execution scope
    Cancelled,
    /// Retryable failure of a lookup or action
    Transient,
    /// Resource state the controller cannot interpret
    Fatal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DeadlineExceeded => write!(f, "DeadlineExceeded"),
            Self::Cancelled => write!(f, "Cancelled"),
            Self::Transient => write!(f, "Transient"),
            Self::Fatal => write!(f, "Fatal"),
        }
    }
}

/// Main error type for reconcile operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The execution scope's deadline passed, or waiting would pass it
    #[error("context deadline exceeded")]
    DeadlineExceeded {
        /// Resource being reconciled
        key: String,
        /// Step that observed the deadline
        step: Step,
    },

    /// The execution scope was cancelled by the caller
    #[error("context canceled")]
    Cancelled {
        /// Resource being reconciled
        key: String,
        /// Step that observed the cancellation
        step: Step,
    },

    /// Retryable failure of a lookup or convergence action
    #[error("{step} failed for {key}: {message}")]
    Transient {
        /// Resource being reconciled
        key: String,
        /// Step that failed
        step: Step,
        /// Description of what failed
        message: String,
    },

    /// A write raced with a concurrent modification of the same record
    #[error("conflict during {step} for {key}: {message}")]
    Conflict {
        /// Resource being reconciled
        key: String,
        /// Step that hit the conflict
        step: Step,
        /// Description of the conflict
        message: String,
    },

    /// Malformed resource state
    #[error("invalid AzureCluster {key}: {message}")]
    Invalid {
        /// Resource being reconciled
        key: String,
        /// The invalid field path (e.g., "spec.networkSpec.vnet.cidrBlock")
        field: Option<String>,
        /// Description of what's invalid
        message: String,
    },

    /// Kubernetes API error
    #[error("kubernetes error during {step} for {key}: {source}")]
    Kube {
        /// Resource being reconciled
        key: String,
        /// Step that issued the request
        step: Step,
        /// The underlying kube-rs error
        #[source]
        source: kube::Error,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },
}

impl Error {
    /// Create a deadline error for the given step
    pub fn deadline_exceeded(step: Step) -> Self {
        Self::DeadlineExceeded {
            key: UNKNOWN_CONTEXT.to_string(),
            step,
        }
    }

    /// Create a cancellation error for the given step
    pub fn cancelled(step: Step) -> Self {
        Self::Cancelled {
            key: UNKNOWN_CONTEXT.to_string(),
            step,
        }
    }

    /// Create a transient error for the given step
    pub fn transient(step: Step, msg: impl Into<String>) -> Self {
        Self::Transient {
            key: UNKNOWN_CONTEXT.to_string(),
            step,
            message: msg.into(),
        }
    }

    /// Create a write conflict error for the given step
    pub fn conflict(step: Step, msg: impl Into<String>) -> Self {
        Self::Conflict {
            key: UNKNOWN_CONTEXT.to_string(),
            step,
            message: msg.into(),
        }
    }

    /// Create a validation error without a field path
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid {
            key: UNKNOWN_CONTEXT.to_string(),
            field: None,
            message: msg.into(),
        }
    }

    /// Create a validation error pointing at a field path
    pub fn invalid_field(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Invalid {
            key: UNKNOWN_CONTEXT.to_string(),
            field: Some(field.into()),
            message: msg.into(),
        }
    }

    /// Wrap a kube-rs error issued during the given step
    ///
    /// HTTP 409 responses become [`Error::Conflict`] so the caller treats a
    /// concurrently modified record as a normal retry.
    pub fn kube(step: Step, source: kube::Error) -> Self {
        match &source {
            kube::Error::Api(ae) if ae.code == 409 => Self::conflict(step, ae.message.clone()),
            _ => Self::Kube {
                key: UNKNOWN_CONTEXT.to_string(),
                step,
                source,
            },
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Attribute this error to a resource key
    ///
    /// Errors that already name a key keep it.
    pub fn for_key(mut self, resource: impl fmt::Display) -> Self {
        if let Self::DeadlineExceeded { key, .. }
        | Self::Cancelled { key, .. }
        | Self::Transient { key, .. }
        | Self::Conflict { key, .. }
        | Self::Invalid { key, .. }
        | Self::Kube { key, .. } = &mut self
        {
            if key.as_str() == UNKNOWN_CONTEXT {
                *key = resource.to_string();
            }
        }
        self
    }

    /// Resource key this error is attributed to, if any
    pub fn key(&self) -> Option<&str> {
        let key = match self {
            Self::DeadlineExceeded { key, .. }
            | Self::Cancelled { key, .. }
            | Self::Transient { key, .. }
            | Self::Conflict { key, .. }
            | Self::Invalid { key, .. }
            | Self::Kube { key, .. } => key,
            Self::Serialization { .. } => return None,
        };
        (key.as_str() != UNKNOWN_CONTEXT).then_some(key.as_str())
    }

    /// Step the error originated from, if known
    pub fn step(&self) -> Option<Step> {
        match self {
            Self::DeadlineExceeded { step, .. }
            | Self::Cancelled { step, .. }
            | Self::Transient { step, .. }
            | Self::Conflict { step, .. }
            | Self::Kube { step, .. } => Some(*step),
            Self::Invalid { .. } | Self::Serialization { .. } => None,
        }
    }

    /// Classify the error
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::DeadlineExceeded { .. } => ErrorCategory::DeadlineExceeded,
            Self::Cancelled { .. } => ErrorCategory::Cancelled,
            Self::Transient { .. } | Self::Conflict { .. } | Self::Kube { .. } => {
                ErrorCategory::Transient
            }
            Self::Invalid { .. } | Self::Serialization { .. } => ErrorCategory::Fatal,
        }
    }

    /// Whether redelivering the same key may succeed without a spec change
    pub fn is_retryable(&self) -> bool {
        !matches!(self.category(), ErrorCategory::Fatal)
    }

    /// Whether this is the deadline-exceeded category
    pub fn is_deadline_exceeded(&self) -> bool {
        matches!(self, Self::DeadlineExceeded { .. })
    }
}
