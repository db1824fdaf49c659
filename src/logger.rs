//! Injectable structured logger
//!
//! The reconciler logs through [`ReconcileLogger`] rather than calling
//! `tracing` macros directly, so tests can substitute a logger that records
//! lines or misbehaves (slow, panicking) without touching production wiring.
//! Logging is observability only: nothing the logger returns feeds control
//! flow.

use std::sync::Arc;

use tracing::field::Empty;
use tracing::{error, info, info_span, Span};

use crate::error::Error;

/// Key/value logging capability used by the reconciler
pub trait ReconcileLogger: Send + Sync {
    /// Return a logger that attaches `values` to every line it emits
    fn with_values(&self, values: &[(&str, &str)]) -> Arc<dyn ReconcileLogger>;

    /// Log an informational line
    fn info(&self, msg: &str);

    /// Log a failure together with its error
    fn error(&self, err: &Error, msg: &str);
}

/// [`ReconcileLogger`] backed by a `tracing` span
///
/// Each call to `with_values` opens a `reconcile_values` span under the span
/// that was current when the first values were attached. The span carries
/// every value attached so far: `namespace` and `name` as fields of their
/// own, anything else folded into `values`. Lines are emitted as events
/// inside that span.
#[derive(Clone, Debug)]
pub struct TracingLogger {
    /// Span the value spans hang off; captured on the first `with_values`
    parent: Option<Span>,
    span: Span,
    values: Vec<(String, String)>,
}

impl Default for TracingLogger {
    fn default() -> Self {
        Self {
            parent: None,
            span: Span::none(),
            values: Vec::new(),
        }
    }
}

impl TracingLogger {
    /// Create a logger with no attached values
    pub fn new() -> Self {
        Self::default()
    }

    /// The span lines are emitted in
    pub fn span(&self) -> &Span {
        &self.span
    }
}

impl ReconcileLogger for TracingLogger {
    fn with_values(&self, values: &[(&str, &str)]) -> Arc<dyn ReconcileLogger> {
        let parent = self.parent.clone().unwrap_or_else(Span::current);
        let span = info_span!(
            parent: &parent,
            "reconcile_values",
            namespace = Empty,
            name = Empty,
            values = Empty
        );

        let mut all = self.values.clone();
        all.extend(values.iter().map(|(k, v)| (k.to_string(), v.to_string())));

        let mut extra = Vec::new();
        for (key, value) in &all {
            match key.as_str() {
                "namespace" | "name" => {
                    span.record(key.as_str(), value.as_str());
                }
                _ => extra.push(format!("{}={}", key, value)),
            }
        }
        if !extra.is_empty() {
            span.record("values", extra.join(" ").as_str());
        }

        Arc::new(Self {
            parent: Some(parent),
            span,
            values: all,
        })
    }

    fn info(&self, msg: &str) {
        let _entered = self.span.enter();
        info!("{}", msg);
    }

    fn error(&self, err: &Error, msg: &str) {
        let _entered = self.span.enter();
        error!(error = %err, category = %err.category(), "{}", msg);
    }
}
