//! Error types for the tally metric store.
//!
//! Absence of a metric is never an error: lookups return `Ok(None)`. Every
//! error variant maps to exactly one [`ErrorClass`] so callers (and the
//! retry policy) can decide what to do with it without string matching.

use std::path::PathBuf;

use thiserror::Error;

use crate::retry::ErrorClass;

/// The main error type for all tally operations.
#[derive(Error, Debug)]
pub enum TallyError {
    /// The execution context was canceled or its deadline passed.
    #[error(transparent)]
    Context(#[from] ContextError),

    /// Malformed metric input.
    #[error("metric error: {0}")]
    Metric(#[from] MetricError),

    /// File backend or snapshot file failure.
    #[error("file error: {0}")]
    File(#[from] FileError),

    /// Database backend failure.
    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    /// Outbound reporting failure.
    #[cfg(feature = "reporter")]
    #[error("report error: {0}")]
    Report(#[from] ReportError),
}

impl TallyError {
    /// Returns the class of this error.
    ///
    /// Only [`ErrorClass::Transient`] errors are retried by
    /// [`RetryPolicy`](crate::retry::RetryPolicy).
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Context(_) => ErrorClass::Canceled,
            Self::Metric(_) | Self::File(_) => ErrorClass::Fatal,
            Self::Database(e) => e.class(),
            #[cfg(feature = "reporter")]
            Self::Report(e) => e.class(),
        }
    }

    /// Returns `true` if the error is worth retrying.
    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

/// Cancellation of an execution [`Context`](crate::context::Context).
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextError {
    /// The context was canceled explicitly.
    #[error("context canceled")]
    Canceled,

    /// The context deadline passed.
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

/// Malformed metric input, rejected before it reaches a repository.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MetricError {
    /// The metric type is neither `gauge` nor `counter`.
    #[error("invalid metric kind '{kind}'")]
    InvalidKind {
        /// The rejected kind string.
        kind: String,
    },

    /// The field matching the metric type is absent.
    #[error("metric '{id}' of kind {kind} has no {field}")]
    MissingValue {
        /// Metric name.
        id: String,
        /// Metric kind.
        kind: &'static str,
        /// The missing field (`value` or `delta`).
        field: &'static str,
    },

    /// The textual value cannot be parsed as the kind's numeric type.
    #[error("invalid {kind} value '{value}'")]
    InvalidValue {
        /// Metric kind.
        kind: &'static str,
        /// The rejected text.
        value: String,
    },
}

/// Errors from the file backend and snapshot files.
#[derive(Error, Debug)]
pub enum FileError {
    /// The snapshot file does not exist (explicit loads only).
    #[error("snapshot '{}' does not exist", path.display())]
    Missing {
        /// The snapshot path.
        path: PathBuf,
    },

    /// Failed to read the snapshot file.
    #[error("failed to read snapshot '{}': {source}", path.display())]
    Read {
        /// The snapshot path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The snapshot file is not a valid JSON metric array.
    #[error("failed to parse snapshot '{}': {source}", path.display())]
    Parse {
        /// The snapshot path.
        path: PathBuf,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// Failed to serialize metrics.
    #[error("failed to serialize snapshot: {source}")]
    Serialize {
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// Failed to write or sync the temporary snapshot file.
    #[error("failed to write snapshot '{}': {source}", path.display())]
    Write {
        /// The temporary file path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to rename the temporary file over the snapshot.
    #[error("failed to commit snapshot '{}': {source}", path.display())]
    Commit {
        /// The snapshot path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Errors from the database backend.
#[derive(Error, Debug)]
pub enum DatabaseError {
    /// A statement, transaction or connection failed.
    #[error("{operation} failed: {source}")]
    Query {
        /// The repository operation that failed.
        operation: &'static str,
        /// The underlying sqlx error.
        #[source]
        source: sqlx::Error,
    },

    /// A row holds a value that cannot be mapped back to a metric.
    #[error("corrupted row for metric '{id}': {reason}")]
    CorruptedRow {
        /// The metric name of the row.
        id: String,
        /// What was wrong with it.
        reason: String,
    },

    /// Adding the delta would take the stored counter outside `i64`.
    #[error("counter '{id}' would overflow")]
    CounterOverflow {
        /// The counter name.
        id: String,
    },
}

impl DatabaseError {
    /// Returns the class of this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Query { source, .. } => crate::repository::database::classify_sqlx(source),
            Self::CorruptedRow { .. } | Self::CounterOverflow { .. } => ErrorClass::Fatal,
        }
    }
}

/// Errors from the outbound reporter.
#[cfg(feature = "reporter")]
#[derive(Error, Debug)]
pub enum ReportError {
    /// Failed to create the HTTP client.
    #[error("failed to create HTTP client: {source}")]
    ClientCreate {
        /// The underlying reqwest error.
        #[source]
        source: reqwest::Error,
    },

    /// Failed to serialize metrics to JSON.
    #[error("failed to serialize request body: {source}")]
    Serialization {
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// Failed to gzip the request body.
    #[error("failed to compress request body: {source}")]
    Compression {
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The HTTP request failed.
    #[error("HTTP request failed: {source}")]
    RequestFailed {
        /// The underlying reqwest error.
        #[source]
        source: reqwest::Error,
    },

    /// The collector answered with a non-2xx status.
    #[error("collector returned status {status}: {body}")]
    HttpStatus {
        /// The HTTP status code.
        status: u16,
        /// The response body text.
        body: String,
    },
}

#[cfg(feature = "reporter")]
impl ReportError {
    /// Returns the class of this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::RequestFailed { source } => crate::reporter::classify_reqwest(source),
            Self::ClientCreate { .. }
            | Self::Serialization { .. }
            | Self::Compression { .. }
            | Self::HttpStatus { .. } => ErrorClass::Fatal,
        }
    }
}

/// Type alias for `Result<T, TallyError>`.
pub type Result<T> = std::result::Result<T, TallyError>;
