//! The storage contract and its three backends.
//!
//! Every backend implements [`Repository`]; callers hold an
//! `Arc<dyn Repository>` chosen once at startup from a [`StorageConfig`].
//!
//! | backend                        | durability            | concurrency                          |
//! |--------------------------------|-----------------------|--------------------------------------|
//! | [`MemoryRepository`]           | none                  | one `RwLock` over both maps          |
//! | [`FileRepository`]             | JSON snapshot per op  | one mutex per load-modify-store     |
//! | [`DatabaseRepository`]         | SQLite table          | atomic upserts, batch transactions   |
//!
//! All operations take a [`Context`] and check it before doing any work.
//! A missing metric is `Ok(None)`, never an error.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use crate::context::Context;
use crate::error::Result;
use crate::metric::{Metric, MetricKind, MetricValue};
use crate::retry::RetryPolicy;

pub mod database;
pub mod file;
pub mod memory;

pub use database::DatabaseRepository;
pub use file::FileRepository;
pub use memory::MemoryRepository;

/// Storage contract shared by all backends.
#[async_trait]
pub trait Repository: Send + Sync {
    /// Stores a gauge, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns an error on context cancellation or backend failure.
    async fn update_gauge(&self, ctx: &Context, name: &str, value: f64) -> Result<()>;

    /// Adds `delta` to a counter, creating it at 0 first if unseen.
    ///
    /// # Errors
    ///
    /// Returns an error on context cancellation or backend failure.
    async fn update_counter(&self, ctx: &Context, name: &str, delta: i64) -> Result<()>;

    /// Looks up a gauge. `Ok(None)` if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error on context cancellation or backend failure.
    async fn gauge(&self, ctx: &Context, name: &str) -> Result<Option<f64>>;

    /// Looks up a counter total. `Ok(None)` if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error on context cancellation or backend failure.
    async fn counter(&self, ctx: &Context, name: &str) -> Result<Option<i64>>;

    /// Returns every stored metric, in no particular order.
    ///
    /// # Errors
    ///
    /// Returns an error on context cancellation or backend failure.
    async fn all(&self, ctx: &Context) -> Result<Vec<Metric>>;

    /// Applies a list of updates as one unit: all of them or none.
    ///
    /// Entries are merged in order, so the same metric may appear more than
    /// once in a batch.
    ///
    /// # Errors
    ///
    /// Returns an error on context cancellation or backend failure; no
    /// entry of the batch is applied in that case.
    async fn update_batch(&self, ctx: &Context, metrics: &[Metric]) -> Result<()>;

    /// Releases backend resources. Safe to call more than once.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails to shut down cleanly.
    async fn close(&self) -> Result<()>;

    /// Checks that the backend is reachable.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot serve requests.
    async fn ping(&self, ctx: &Context) -> Result<()> {
        ctx.check()?;
        Ok(())
    }

    /// Applies a single update, dispatching on its kind.
    ///
    /// # Errors
    ///
    /// See [`Repository::update_gauge`] and [`Repository::update_counter`].
    async fn update(&self, ctx: &Context, metric: &Metric) -> Result<()> {
        match metric.value {
            MetricValue::Gauge(value) => self.update_gauge(ctx, &metric.id, value).await,
            MetricValue::Counter(delta) => self.update_counter(ctx, &metric.id, delta).await,
        }
    }

    /// Looks up a metric of either kind.
    ///
    /// # Errors
    ///
    /// See [`Repository::gauge`] and [`Repository::counter`].
    async fn get(&self, ctx: &Context, name: &str, kind: MetricKind) -> Result<Option<MetricValue>> {
        Ok(match kind {
            MetricKind::Gauge => self.gauge(ctx, name).await?.map(MetricValue::Gauge),
            MetricKind::Counter => self.counter(ctx, name).await?.map(MetricValue::Counter),
        })
    }
}

/// Which backend to open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageConfig {
    /// In-process maps; lost on exit.
    Memory,
    /// JSON snapshot file rewritten on every mutation.
    File {
        /// Path of the snapshot file.
        path: PathBuf,
    },
    /// SQL table behind a connection pool.
    Database {
        /// Connection URL, e.g. `sqlite://metrics.db`.
        url: String,
    },
}

impl StorageConfig {
    /// Short name of the backend, for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::File { .. } => "file",
            Self::Database { .. } => "database",
        }
    }
}

/// Opens the backend described by `config`.
///
/// `policy` wraps database operations; the other backends do no network
/// I/O and ignore it.
///
/// # Errors
///
/// Returns an error if the database cannot be reached or migrated.
pub async fn open(config: &StorageConfig, policy: RetryPolicy) -> Result<Arc<dyn Repository>> {
    tracing::info!(backend = config.name(), "opening repository");
    Ok(match config {
        StorageConfig::Memory => Arc::new(MemoryRepository::new()),
        StorageConfig::File { path } => Arc::new(FileRepository::new(path)),
        StorageConfig::Database { url } => Arc::new(DatabaseRepository::connect(url, policy).await?),
    })
}
