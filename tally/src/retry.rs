//! Bounded retry with a fixed backoff schedule.
//!
//! One policy value is shared by the database backend and the outbound
//! reporter. The operation runs once; transient failures are retried after
//! each delay in the schedule in turn, so a schedule of `n` delays allows at
//! most `n + 1` attempts. Cancellation and fatal errors are returned at once.
//!
//! ```rust
//! use std::time::Duration;
//! use tally::context::Context;
//! use tally::retry::RetryPolicy;
//! use tally::TallyError;
//!
//! # async fn demo() -> tally::Result<()> {
//! let policy = RetryPolicy::new([Duration::from_millis(10), Duration::from_millis(30)]);
//! let ctx = Context::background();
//! let value = policy
//!     .run(&ctx, TallyError::class, || async { Ok::<_, TallyError>(42) })
//!     .await?;
//! assert_eq!(value, 42);
//! # Ok(())
//! # }
//! ```

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::context::Context;
use crate::error::ContextError;

/// Backoff schedule used when none is configured: 1s, 3s, 5s.
pub const DEFAULT_DELAYS: [Duration; 3] = [
    Duration::from_secs(1),
    Duration::from_secs(3),
    Duration::from_secs(5),
];

/// How the retry loop should treat a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// The caller's context was canceled or expired. Never retried.
    Canceled,
    /// Connectivity-class failure that may succeed on another attempt.
    Transient,
    /// Anything else. Never retried.
    Fatal,
}

/// Fixed-schedule retry policy.
///
/// Cheap to clone; the schedule is immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    delays: Arc<[Duration]>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_DELAYS)
    }
}

impl RetryPolicy {
    /// Creates a policy with the given ordered backoff delays.
    pub fn new(delays: impl Into<Vec<Duration>>) -> Self {
        Self {
            delays: delays.into().into(),
        }
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self::new(Vec::new())
    }

    /// The backoff schedule.
    pub fn delays(&self) -> &[Duration] {
        &self.delays
    }

    /// Total number of attempts the policy allows.
    pub fn max_attempts(&self) -> usize {
        self.delays.len() + 1
    }

    /// Sum of all delays: the longest time the policy can spend sleeping.
    pub fn max_backoff(&self) -> Duration {
        self.delays.iter().sum()
    }

    /// Runs `op` under this policy.
    ///
    /// `classify` decides whether a failure is retried. The context is
    /// checked before every attempt, so an attempt is never started on a
    /// canceled or expired context; an attempt in flight is never
    /// interrupted.
    ///
    /// # Errors
    ///
    /// Returns the context error if the context finishes before an attempt,
    /// the first non-transient error, or the last transient error once the
    /// schedule is exhausted.
    pub async fn run<T, E, F, Fut, C>(&self, ctx: &Context, classify: C, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> ErrorClass,
        E: From<ContextError> + Display,
    {
        let mut delays = self.delays.iter().copied();
        let mut attempt = 1usize;

        loop {
            ctx.check()?;

            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            match classify(&err) {
                ErrorClass::Canceled | ErrorClass::Fatal => return Err(err),
                ErrorClass::Transient => {}
            }

            let Some(delay) = delays.next() else {
                warn!(attempt, error = %err, "retries exhausted");
                return Err(err);
            };

            warn!(attempt, ?delay, error = %err, "transient failure, retrying");

            // A cancel during the sleep surfaces at the top of the loop.
            let _ = ctx.sleep(delay).await;
            attempt += 1;
        }
    }
}
