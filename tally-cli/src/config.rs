//! Command-line and environment configuration.
//!
//! Every flag can also be set through the environment variable named next
//! to it; an explicit flag wins.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, ValueEnum};
use tally::StorageConfig;

/// Storage backend for the collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StorageKind {
    /// In-process maps, optionally snapshotted to `--file-storage-path`.
    Memory,
    /// The JSON file at `--file-storage-path` is the store itself.
    File,
    /// SQLite database at `--database-dsn`.
    Database,
}

/// Options for `tally serve`.
#[derive(Debug, Clone, Args)]
pub struct ServeArgs {
    /// Address to listen on.
    #[arg(short, long, env = "ADDRESS", default_value = "localhost:8080")]
    pub address: String,

    /// Seconds between snapshots of the store (0 = save after every update).
    #[arg(short = 'i', long, env = "STORE_INTERVAL", default_value_t = 300)]
    pub store_interval: u64,

    /// Snapshot file, or the store itself with `--storage file`.
    #[arg(
        short = 'f',
        long,
        env = "FILE_STORAGE_PATH",
        default_value = "./metrics-recovery.json"
    )]
    pub file_storage_path: PathBuf,

    /// Load the snapshot into the store at startup.
    #[arg(
        short,
        long,
        env = "RESTORE",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub restore: bool,

    /// Database URL, e.g. `sqlite://metrics.db`.
    #[arg(short = 'd', long, env = "DATABASE_DSN")]
    pub database_dsn: Option<String>,

    /// Storage backend [default: database if a DSN is set, else memory].
    #[arg(long, value_enum)]
    pub storage: Option<StorageKind>,
}

impl ServeArgs {
    /// The backend to use.
    pub fn storage_kind(&self) -> StorageKind {
        self.storage.unwrap_or(if self.database_dsn.is_some() {
            StorageKind::Database
        } else {
            StorageKind::Memory
        })
    }

    /// Resolves the backend configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the database backend is selected without a DSN.
    pub fn storage_config(&self) -> Result<StorageConfig, String> {
        Ok(match self.storage_kind() {
            StorageKind::Memory => StorageConfig::Memory,
            StorageKind::File => StorageConfig::File {
                path: self.file_storage_path.clone(),
            },
            StorageKind::Database => StorageConfig::Database {
                url: self
                    .database_dsn
                    .clone()
                    .ok_or("--storage database requires --database-dsn")?,
            },
        })
    }

    /// Interval of the periodic snapshot; `None` means save synchronously.
    pub fn snapshot_interval(&self) -> Option<Duration> {
        (self.store_interval > 0).then(|| Duration::from_secs(self.store_interval))
    }
}

/// Options for `tally agent`.
#[derive(Debug, Clone, Args)]
pub struct AgentArgs {
    /// Collector address.
    #[arg(short, long, env = "ADDRESS", default_value = "localhost:8080")]
    pub address: String,

    /// Seconds between reports to the collector.
    #[arg(short, long, env = "REPORT_INTERVAL", default_value_t = 10)]
    pub report_interval: u64,

    /// Seconds between samples.
    #[arg(short, long, env = "POLL_INTERVAL", default_value_t = 2)]
    pub poll_interval: u64,

    /// Send request bodies uncompressed.
    #[arg(long)]
    pub no_compress: bool,
}
