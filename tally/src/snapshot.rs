//! Crash-safe JSON snapshot files.
//!
//! A snapshot is the full metric set serialized as one JSON array. Writing
//! is a two-step protocol:
//!
//! 1. [`SnapshotFile::stage`] serializes the metrics and writes them to
//!    `<path>.tmp`, flushed and synced to disk.
//! 2. [`StagedSnapshot::commit`] renames the temporary file over `<path>`.
//!
//! Readers therefore see either the previous snapshot or the new one, never
//! a partial file. A failure (or crash) before the rename leaves the
//! previous snapshot in place.
//!
//! Clones of a [`SnapshotFile`] share one writer lock, held from staging
//! until the staged file is committed or dropped, so concurrent saves never
//! interleave on the temporary file.
//!
//! The module also provides the collector-side helpers: [`restore`] loads a
//! snapshot into a repository at boot, [`dump`] writes a repository out, and
//! [`spawn_periodic`] runs `dump` on an interval until shutdown.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::context::Context;
use crate::error::{FileError, Result};
use crate::metric::Metric;
use crate::repository::Repository;

/// Suffix of the temporary file written next to the snapshot.
const TEMP_SUFFIX: &str = ".tmp";

/// A snapshot file on disk.
#[derive(Debug, Clone)]
pub struct SnapshotFile {
    path: PathBuf,
    writer: Arc<Mutex<()>>,
}

impl SnapshotFile {
    /// Points at `path`. No I/O happens until the first load or save.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            writer: Arc::new(Mutex::new(())),
        }
    }

    /// Path of the snapshot.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the temporary file used while staging.
    pub fn temp_path(&self) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(TEMP_SUFFIX);
        PathBuf::from(name)
    }

    /// Loads the snapshot.
    ///
    /// An empty file is an empty snapshot.
    ///
    /// # Errors
    ///
    /// [`FileError::Missing`] if the file does not exist, otherwise a read or
    /// parse error.
    pub async fn load(&self) -> Result<Vec<Metric>> {
        let data = match tokio::fs::read(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(FileError::Missing {
                    path: self.path.clone(),
                }
                .into());
            }
            Err(source) => {
                return Err(FileError::Read {
                    path: self.path.clone(),
                    source,
                }
                .into());
            }
        };

        if data.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }

        serde_json::from_slice(&data).map_err(|source| {
            FileError::Parse {
                path: self.path.clone(),
                source,
            }
            .into()
        })
    }

    /// Loads the snapshot, treating a missing file as empty.
    ///
    /// # Errors
    ///
    /// Returns a read or parse error.
    pub async fn load_or_empty(&self) -> Result<Vec<Metric>> {
        match self.load().await {
            Err(crate::TallyError::File(FileError::Missing { .. })) => Ok(Vec::new()),
            other => other,
        }
    }

    /// Writes `metrics` to the temporary file without touching the snapshot.
    ///
    /// Waits for any other staged snapshot of this file to be committed or
    /// dropped. On failure the temporary file is removed.
    ///
    /// # Errors
    ///
    /// Returns a serialization or write error.
    pub async fn stage(&self, metrics: &[Metric]) -> Result<StagedSnapshot> {
        let guard = Arc::clone(&self.writer).lock_owned().await;
        self.stage_locked(guard, metrics).await
    }

    async fn stage_locked(
        &self,
        guard: OwnedMutexGuard<()>,
        metrics: &[Metric],
    ) -> Result<StagedSnapshot> {
        let mut data =
            serde_json::to_vec_pretty(metrics).map_err(|source| FileError::Serialize { source })?;
        data.push(b'\n');

        let temp = self.temp_path();
        if let Err(source) = write_synced(&temp, &data).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(FileError::Write { path: temp, source }.into());
        }

        Ok(StagedSnapshot {
            temp,
            target: self.path.clone(),
            _writer: guard,
        })
    }

    /// Atomically replaces the snapshot with `metrics`.
    ///
    /// # Errors
    ///
    /// Returns a serialization, write or rename error. The previous snapshot
    /// is intact in every case.
    pub async fn save(&self, metrics: &[Metric]) -> Result<()> {
        self.stage(metrics).await?.commit().await
    }
}

/// A fully written temporary file waiting to replace its snapshot.
#[derive(Debug)]
#[must_use = "a staged snapshot does nothing until committed"]
pub struct StagedSnapshot {
    temp: PathBuf,
    target: PathBuf,
    _writer: OwnedMutexGuard<()>,
}

impl StagedSnapshot {
    /// Path of the temporary file.
    pub fn temp_path(&self) -> &Path {
        &self.temp
    }

    /// Renames the temporary file over the snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`FileError::Commit`] if the rename fails.
    pub async fn commit(self) -> Result<()> {
        tokio::fs::rename(&self.temp, &self.target)
            .await
            .map_err(|source| FileError::Commit {
                path: self.target.clone(),
                source,
            })?;
        Ok(())
    }
}

async fn write_synced(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::File::create(path).await?;
    file.write_all(data).await?;
    file.flush().await?;
    file.sync_all().await
}

/// Loads `snapshot` into `repo` as one batch.
///
/// A missing snapshot restores nothing. Counters in the snapshot are added
/// to whatever the repository already holds, so restore into an empty
/// repository.
///
/// # Errors
///
/// Returns a read/parse error or the repository's batch error.
pub async fn restore(repo: &dyn Repository, ctx: &Context, snapshot: &SnapshotFile) -> Result<usize> {
    let metrics = snapshot.load_or_empty().await?;
    if metrics.is_empty() {
        info!(path = %snapshot.path().display(), "nothing to restore");
        return Ok(0);
    }
    repo.update_batch(ctx, &metrics).await?;
    info!(count = metrics.len(), path = %snapshot.path().display(), "metrics restored");
    Ok(metrics.len())
}

/// Writes every metric in `repo` to `snapshot`.
///
/// The writer lock is taken before reading `repo`, so of two concurrent
/// dumps the one that read later also commits later.
///
/// # Errors
///
/// Returns the repository's error or a snapshot write error.
pub async fn dump(repo: &dyn Repository, ctx: &Context, snapshot: &SnapshotFile) -> Result<usize> {
    let guard = Arc::clone(&snapshot.writer).lock_owned().await;
    let metrics = repo.all(ctx).await?;
    snapshot.stage_locked(guard, &metrics).await?.commit().await?;
    debug!(count = metrics.len(), path = %snapshot.path().display(), "snapshot saved");
    Ok(metrics.len())
}

/// Dumps `repo` to `snapshot` every `interval` until `shutdown` fires.
///
/// Failures are logged and the loop keeps going.
pub fn spawn_periodic(
    repo: Arc<dyn Repository>,
    snapshot: SnapshotFile,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let ctx = Context::with_token(shutdown.child_token());
            if let Err(e) = dump(repo.as_ref(), &ctx, &snapshot).await {
                error!(error = %e, path = %snapshot.path().display(), "periodic snapshot failed");
            }
        }
        debug!("periodic snapshot stopped");
    })
}
