//! Execution scopes: explicit deadline and cancellation tokens
//!
//! An [`ExecutionScope`] is passed by reference into every blocking call a
//! reconcile pass makes (state lookup, cloud actions, rate-limit waits). Work
//! started through [`ExecutionScope::run`] returns as soon as the scope is
//! cancelled or its deadline passes, even if the wrapped future never checks
//! the scope itself.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::error::{Error, Step};

/// Deadline and cancellation carried through one reconcile pass
#[derive(Clone, Debug)]
pub struct ExecutionScope {
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl Default for ExecutionScope {
    fn default() -> Self {
        Self::background()
    }
}

impl ExecutionScope {
    /// A root scope with no deadline that is never cancelled on its own
    pub fn background() -> Self {
        Self {
            deadline: None,
            cancel: CancellationToken::new(),
        }
    }

    /// A root scope cancelled through an externally owned token
    ///
    /// Used to tie reconcile passes to process shutdown.
    pub fn with_cancellation(cancel: CancellationToken) -> Self {
        Self {
            deadline: None,
            cancel,
        }
    }

    /// Derive a child scope, optionally bounded by `timeout`
    ///
    /// The child's deadline is never later than this scope's. Cancelling this
    /// scope cancels the child. The returned guard cancels the child (and only
    /// the child) when dropped, so every exit path releases it.
    pub fn child(&self, timeout: Option<Duration>) -> (Self, DropGuard) {
        let cancel = self.cancel.child_token();
        let deadline = match timeout.filter(|t| !t.is_zero()) {
            Some(timeout) => {
                let own = Instant::now() + timeout;
                Some(self.deadline.map_or(own, |parent| parent.min(own)))
            }
            None => self.deadline,
        };
        let guard = cancel.clone().drop_guard();
        (Self { deadline, cancel }, guard)
    }

    /// The instant after which work in this scope must stop
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, `None` if the scope is unbounded
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Cancel this scope and every scope derived from it
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether the scope was cancelled
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Fail if the scope is already cancelled or past its deadline
    pub fn check(&self, step: Step) -> Result<(), Error> {
        if self.cancel.is_cancelled() {
            return Err(Error::cancelled(step));
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(Error::deadline_exceeded(step)),
            _ => Ok(()),
        }
    }

    /// Run `fut` bounded by this scope
    ///
    /// Cancellation wins over the deadline, and both win over a future that
    /// becomes ready at the same poll.
    pub async fn run<F, T>(&self, step: Step, fut: F) -> Result<T, Error>
    where
        F: Future<Output = Result<T, Error>>,
    {
        self.check(step)?;

        let expired = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::cancelled(step)),
            _ = expired => Err(Error::deadline_exceeded(step)),
            res = fut => res,
        }
    }

    /// Sleep for `duration` unless the scope ends first
    pub async fn sleep(&self, step: Step, duration: Duration) -> Result<(), Error> {
        self.run(step, async {
            tokio::time::sleep(duration).await;
            Ok(())
        })
        .await
    }
}
