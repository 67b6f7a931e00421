//! Repository persisted as a single JSON snapshot file.
//!
//! There is no in-memory cache: every operation loads the whole snapshot,
//! and every mutation writes it back through [`SnapshotFile`]'s
//! stage-and-rename protocol. One async mutex per repository is held for the
//! entire load-modify-store cycle, so calls on the same instance are fully
//! serialized and a batch becomes visible in one rename.
//!
//! The file is owned by a single repository instance; sharing a path
//! between processes is not supported.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use crate::context::Context;
use crate::error::Result;
use crate::merge;
use crate::metric::{Metric, MetricKind, MetricValue};
use crate::repository::Repository;
use crate::snapshot::SnapshotFile;

/// Repository backed by a JSON snapshot file.
#[derive(Debug)]
pub struct FileRepository {
    snapshot: SnapshotFile,
    lock: Mutex<()>,
}

impl FileRepository {
    /// Points the repository at `path`.
    ///
    /// Nothing is read until the first operation; a file that does not exist
    /// yet behaves as an empty store.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            snapshot: SnapshotFile::new(path),
            lock: Mutex::new(()),
        }
    }

    /// Path of the snapshot file.
    pub fn path(&self) -> &Path {
        self.snapshot.path()
    }

    /// Path of the temporary file written before each rename.
    pub fn temp_path(&self) -> PathBuf {
        self.snapshot.temp_path()
    }

    /// Loads the snapshot, failing if it does not exist.
    ///
    /// Unlike the repository operations, which treat a missing file as an
    /// empty store, this surfaces absence as
    /// [`FileError::Missing`](crate::error::FileError::Missing).
    ///
    /// # Errors
    ///
    /// Returns a missing-file, read or parse error.
    pub async fn load(&self) -> Result<Vec<Metric>> {
        let _guard = self.lock.lock().await;
        self.snapshot.load().await
    }

    async fn restore(&self) -> Result<Vec<Metric>> {
        self.snapshot.load_or_empty().await
    }

    /// Loads, applies `updates`, writes back; the caller holds the lock.
    async fn modify(&self, updates: &[Metric]) -> Result<()> {
        let mut metrics = self.restore().await?;
        merge::apply_all(&mut metrics, updates);
        self.snapshot.save(&metrics).await
    }

    async fn lookup(&self, ctx: &Context, name: &str, kind: MetricKind) -> Result<Option<MetricValue>> {
        let _guard = self.lock.lock().await;
        ctx.check()?;
        let metrics = self.restore().await?;
        Ok(metrics
            .into_iter()
            .find(|m| m.is(name, kind))
            .map(|m| m.value))
    }
}

#[async_trait]
impl Repository for FileRepository {
    async fn update_gauge(&self, ctx: &Context, name: &str, value: f64) -> Result<()> {
        MetricValue::Gauge(value).validate()?;
        let _guard = self.lock.lock().await;
        ctx.check()?;
        self.modify(&[Metric::gauge(name, value)]).await?;
        debug!(name, value, path = %self.path().display(), "gauge updated");
        Ok(())
    }

    async fn update_counter(&self, ctx: &Context, name: &str, delta: i64) -> Result<()> {
        let _guard = self.lock.lock().await;
        ctx.check()?;
        self.modify(&[Metric::counter(name, delta)]).await?;
        debug!(name, delta, path = %self.path().display(), "counter updated");
        Ok(())
    }

    async fn gauge(&self, ctx: &Context, name: &str) -> Result<Option<f64>> {
        Ok(match self.lookup(ctx, name, MetricKind::Gauge).await? {
            Some(MetricValue::Gauge(value)) => Some(value),
            _ => None,
        })
    }

    async fn counter(&self, ctx: &Context, name: &str) -> Result<Option<i64>> {
        Ok(match self.lookup(ctx, name, MetricKind::Counter).await? {
            Some(MetricValue::Counter(delta)) => Some(delta),
            _ => None,
        })
    }

    async fn all(&self, ctx: &Context) -> Result<Vec<Metric>> {
        let _guard = self.lock.lock().await;
        ctx.check()?;
        self.restore().await
    }

    async fn update_batch(&self, ctx: &Context, metrics: &[Metric]) -> Result<()> {
        Metric::validate_all(metrics)?;
        let _guard = self.lock.lock().await;
        ctx.check()?;
        self.modify(metrics).await?;
        debug!(count = metrics.len(), path = %self.path().display(), "batch applied");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
