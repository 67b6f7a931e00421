//! Execution context carried by every repository operation.
//!
//! A [`Context`] couples a [`CancellationToken`] with an optional deadline.
//! Operations call [`Context::check`] before they start any I/O; the retry
//! policy also checks it at the top of every attempt and races its backoff
//! sleeps against [`Context::done`].
//!
//! ```rust
//! use std::time::Duration;
//! use tally::context::Context;
//!
//! let ctx = Context::background().with_timeout(Duration::from_secs(5));
//! assert!(ctx.check().is_ok());
//!
//! ctx.cancel();
//! assert!(ctx.check().is_err());
//! ```

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::ContextError;

/// Cancellation and deadline carrier.
///
/// Cloning a context shares its token: canceling any clone cancels all of
/// them. Derived contexts ([`Context::child`], [`Context::with_timeout`]) are
/// canceled with their parent but never cancel it.
#[derive(Debug, Clone, Default)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Context {
    /// A context that is never canceled and has no deadline.
    pub fn background() -> Self {
        Self::default()
    }

    /// Wraps an existing token, e.g. a process-wide shutdown token.
    pub fn with_token(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// Derives a context that can be canceled independently of `self`.
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// Derives a context that expires after `timeout`.
    ///
    /// The earlier of the inherited deadline and `now + timeout` wins.
    #[must_use]
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let deadline = Instant::now() + timeout;
        Self {
            token: self.token.child_token(),
            deadline: Some(self.deadline.map_or(deadline, |d| d.min(deadline))),
        }
    }

    /// Cancels this context and every context derived from it.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Returns the deadline, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Returns an error if the context is canceled or past its deadline.
    ///
    /// # Errors
    ///
    /// [`ContextError::Canceled`] or [`ContextError::DeadlineExceeded`].
    pub fn check(&self) -> Result<(), ContextError> {
        if self.token.is_cancelled() {
            return Err(ContextError::Canceled);
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(ContextError::DeadlineExceeded);
        }
        Ok(())
    }

    /// Resolves once the context is canceled or its deadline passes.
    pub async fn done(&self) -> ContextError {
        match self.deadline {
            Some(deadline) => tokio::select! {
                () = self.token.cancelled() => ContextError::Canceled,
                () = tokio::time::sleep_until(deadline) => ContextError::DeadlineExceeded,
            },
            None => {
                self.token.cancelled().await;
                ContextError::Canceled
            }
        }
    }

    /// Sleeps for `duration` unless the context finishes first.
    ///
    /// # Errors
    ///
    /// Returns the context error if it finished before the sleep elapsed.
    pub async fn sleep(&self, duration: Duration) -> Result<(), ContextError> {
        tokio::select! {
            () = tokio::time::sleep(duration) => Ok(()),
            err = self.done() => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_background_is_live() {
        let ctx = Context::background();
        assert!(ctx.check().is_ok());
        assert!(ctx.deadline().is_none());
    }

    #[test]
    fn test_cancel_propagates_to_children_only() {
        let parent = Context::background();
        let child = parent.child();

        child.cancel();
        assert_eq!(child.check(), Err(ContextError::Canceled));
        assert!(parent.check().is_ok());

        let child = parent.child();
        parent.cancel();
        assert_eq!(child.check(), Err(ContextError::Canceled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_expires() {
        let ctx = Context::background().with_timeout(Duration::from_secs(2));
        assert!(ctx.check().is_ok());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(ctx.check(), Err(ContextError::DeadlineExceeded));
    }

    #[tokio::test(start_paused = true)]
    async fn test_nested_timeout_keeps_earlier_deadline() {
        let outer = Context::background().with_timeout(Duration::from_secs(1));
        let inner = outer.with_timeout(Duration::from_secs(10));
        assert_eq!(inner.deadline(), outer.deadline());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_interrupted_by_cancel() {
        let ctx = Context::background();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });

        let result = ctx.sleep(Duration::from_secs(60)).await;
        assert_eq!(result, Err(ContextError::Canceled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_completes() {
        let ctx = Context::background();
        assert!(ctx.sleep(Duration::from_secs(3)).await.is_ok());
    }
}
