//! # tally
//!
//! Metric aggregation and persistence.
//!
//! tally stores two kinds of named metrics behind one storage contract:
//! gauges, where the last value wins, and counters, which accumulate
//! signed deltas. The contract has three interchangeable backends
//! (in-process maps, a crash-safe JSON snapshot file, and a SQLite table)
//! and every operation runs under a cancellable [`Context`]. Backends that
//! talk to something that can flake out retry transient failures with a
//! fixed [`RetryPolicy`].
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tally::{Context, Metric, Repository, RetryPolicy, StorageConfig};
//!
//! # async fn run() -> tally::Result<()> {
//! let config = StorageConfig::File { path: "./metrics.json".into() };
//! let repo = tally::repository::open(&config, RetryPolicy::default()).await?;
//! let ctx = Context::background();
//!
//! repo.update_gauge(&ctx, "Alloc", 123.45).await?;
//! repo.update_counter(&ctx, "PollCount", 5).await?;
//! repo.update_batch(&ctx, &[Metric::counter("PollCount", 3)]).await?;
//!
//! assert_eq!(repo.counter(&ctx, "PollCount").await?, Some(8));
//! repo.close().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`metric`] — Metric kinds, values and the JSON wire format
//! - [`merge`] — Find-or-append merge used by list-shaped stores
//! - [`repository`] — The [`Repository`] contract and its backends
//! - [`snapshot`] — Crash-safe snapshot files, restore and periodic dump
//! - [`retry`] — Retry policy and error classes
//! - [`context`] — Cancellation and deadlines
//! - `reporter` — HTTP client pushing metrics to a collector (feature `reporter`)
//! - [`error`] — Error types

pub mod context;
pub mod error;
pub mod merge;
pub mod metric;
#[cfg(feature = "reporter")]
pub mod reporter;
pub mod repository;
pub mod retry;
pub mod snapshot;

// Re-export primary API types at crate root for convenience.
pub use context::Context;
pub use error::{Result, TallyError};
pub use metric::{Metric, MetricKind, MetricValue};
pub use repository::{Repository, StorageConfig};
pub use retry::{ErrorClass, RetryPolicy};
pub use snapshot::SnapshotFile;
