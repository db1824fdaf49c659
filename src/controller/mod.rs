//! Controller for AzureCluster resources
//!
//! [`AzureClusterReconciler`] holds the reconciliation logic and is driven by
//! resource key. The free functions [`reconcile`] and [`error_policy`] adapt
//! it to `kube::runtime::Controller`, which delivers whole objects and expects
//! an [`Action`] back.

mod azurecluster;

use std::sync::Arc;
use std::time::Duration;

use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use rand::Rng;
use tracing::{error, instrument, warn};

use crate::cloud::CloudApi;
use crate::crd::{AzureCluster, ClusterPhase};
use crate::error::{Error, ErrorCategory, Step};
use crate::key::ResourceKey;
use crate::rate_limit::RateLimiter;
use crate::scope::ExecutionScope;
use crate::state::{KubeStateAccessor, StateAccessor};

pub use azurecluster::{AzureClusterReconciler, AzureClusterReconcilerBuilder};

/// Base requeue delay after a retryable failure
pub const RETRY_DELAY: Duration = Duration::from_secs(5);

/// Requeue delay after a fatal failure; a spec change triggers a pass sooner
pub const FATAL_RETRY_DELAY: Duration = Duration::from_secs(300);

/// Budget for writing a failure onto the resource status
const STATUS_REPORT_TIMEOUT: Duration = Duration::from_secs(5);

/// Controller context shared by all reconcile calls
pub struct Context {
    /// Key-based reconciler
    pub reconciler: AzureClusterReconciler,
    /// Root scope of every call; cancelled on shutdown
    pub root: ExecutionScope,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client, cloud: Arc<dyn CloudApi>) -> ContextBuilder {
        ContextBuilder::new(client, cloud)
    }

    /// Create a context for testing around a prepared reconciler
    #[cfg(test)]
    pub fn for_testing(reconciler: AzureClusterReconciler) -> Self {
        Self {
            reconciler,
            root: ExecutionScope::background(),
        }
    }
}

/// Builder for constructing [`Context`] instances
///
/// ```ignore
/// let ctx = Context::builder(client, cloud)
///     .limiter(limiter)
///     .reconcile_timeout(Duration::from_secs(30))
///     .root(ExecutionScope::with_cancellation(shutdown))
///     .build();
/// ```
pub struct ContextBuilder {
    client: Client,
    cloud: Arc<dyn CloudApi>,
    state: Option<Arc<dyn StateAccessor>>,
    limiter: Option<Arc<RateLimiter>>,
    reconcile_timeout: Duration,
    root: ExecutionScope,
}

impl ContextBuilder {
    fn new(client: Client, cloud: Arc<dyn CloudApi>) -> Self {
        Self {
            client,
            cloud,
            state: None,
            limiter: None,
            reconcile_timeout: Duration::ZERO,
            root: ExecutionScope::background(),
        }
    }

    /// Override the State Accessor (primarily for testing)
    pub fn state(mut self, state: Arc<dyn StateAccessor>) -> Self {
        self.state = Some(state);
        self
    }

    /// Set the process-wide cloud API limiter
    pub fn limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Set the per-call timeout; zero leaves calls unbounded
    pub fn reconcile_timeout(mut self, timeout: Duration) -> Self {
        self.reconcile_timeout = timeout;
        self
    }

    /// Set the scope every call derives from
    pub fn root(mut self, root: ExecutionScope) -> Self {
        self.root = root;
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        let state = self
            .state
            .unwrap_or_else(|| Arc::new(KubeStateAccessor::new(self.client.clone())));
        let mut builder = AzureClusterReconciler::builder(state, self.cloud)
            .reconcile_timeout(self.reconcile_timeout);
        if let Some(limiter) = self.limiter {
            builder = builder.limiter(limiter);
        }
        Context {
            reconciler: builder.build(),
            root: self.root,
        }
    }
}

/// Reconcile an AzureCluster delivered by the kube-runtime Controller
///
/// The delivered object only names the key; the reconciler re-reads the
/// record. On failure the error is written onto the resource status (best
/// effort) and still returned so [`error_policy`] schedules the retry.
#[instrument(skip(cluster, ctx), fields(cluster = %cluster.name_any()))]
pub async fn reconcile(cluster: Arc<AzureCluster>, ctx: Arc<Context>) -> Result<Action, Error> {
    let key = ResourceKey::from_object(cluster.as_ref());

    match ctx.reconciler.reconcile(&ctx.root, &key).await {
        Ok(result) => Ok(result.into()),
        Err(err) => {
            report_failure(&ctx, &key, &err).await;
            Err(err)
        }
    }
}

/// Error policy for the AzureCluster controller
///
/// Retryable failures requeue after a jittered short delay so keys that failed
/// together do not retry in lockstep. Fatal failures wait much longer.
pub fn error_policy(cluster: Arc<AzureCluster>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        category = %error.category(),
        cluster = %cluster.name_any(),
        "reconciliation failed"
    );

    Action::requeue(retry_delay(error))
}

fn retry_delay(error: &Error) -> Duration {
    match error.category() {
        ErrorCategory::Fatal => FATAL_RETRY_DELAY,
        _ => {
            // Add jitter: 0.5x to 1.5x of the delay
            let jitter = rand::thread_rng().gen_range(0.5..1.5);
            Duration::from_secs_f64(RETRY_DELAY.as_secs_f64() * jitter)
        }
    }
}

/// Write `err` onto the resource status under its own short scope
///
/// Failures here are logged and dropped; the original error is what the
/// scheduler sees.
async fn report_failure(ctx: &Context, key: &ResourceKey, err: &Error) {
    if err.category() == ErrorCategory::Cancelled {
        return;
    }
    let (scope, _guard) = ctx.root.child(Some(STATUS_REPORT_TIMEOUT));
    if let Err(e) = write_failure_status(ctx.reconciler.state().as_ref(), &scope, key, err).await {
        warn!(error = %e, key = %key, "failed to record reconcile failure in status");
    }
}

async fn write_failure_status(
    state: &dyn StateAccessor,
    scope: &ExecutionScope,
    key: &ResourceKey,
    err: &Error,
) -> Result<(), Error> {
    let Some(cluster) = scope.run(Step::Lookup, state.get(scope, key)).await? else {
        return Ok(());
    };

    let current = cluster.status.clone().unwrap_or_default();
    let message = match err.step() {
        Some(step) if err.category() == ErrorCategory::DeadlineExceeded => {
            format!("{} during {}", err, step)
        }
        _ => err.to_string(),
    };
    let mut desired = current.clone().failure(err.category().to_string(), message);
    if err.category() == ErrorCategory::Fatal {
        desired.phase = ClusterPhase::Failed;
        desired.ready = false;
    }

    if current.same_state(&desired) {
        return Ok(());
    }
    scope
        .run(Step::Status, state.patch_status(scope, key, &desired))
        .await
}
