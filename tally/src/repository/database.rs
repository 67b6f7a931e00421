//! Repository backed by a SQLite table.
//!
//! Schema:
//!
//! ```sql
//! CREATE TABLE metrics (
//!     id    TEXT    NOT NULL,
//!     type  TEXT    NOT NULL,
//!     delta INTEGER NULL,
//!     value REAL    NULL,
//!     PRIMARY KEY (id, type)
//! )
//! ```
//!
//! Single updates are one upsert statement each, so concurrent writers never
//! lose an increment. A batch runs in one transaction per attempt. Every
//! operation is wrapped in the repository's [`RetryPolicy`]; only errors that
//! [`classify_sqlx`] marks transient are retried. The context is checked
//! before each attempt; a statement already sent runs to completion.
//!
//! A counter increment that would leave the `i64` range is skipped by the
//! upsert and reported as [`DatabaseError::CounterOverflow`], so the column
//! never degrades to `REAL`.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use tracing::{debug, info, instrument};

use crate::context::Context;
use crate::error::{DatabaseError, Result, TallyError};
use crate::metric::{Metric, MetricKind, MetricValue};
use crate::repository::Repository;
use crate::retry::{ErrorClass, RetryPolicy};

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS metrics (
    id    TEXT    NOT NULL,
    type  TEXT    NOT NULL,
    delta INTEGER NULL,
    value REAL    NULL,
    PRIMARY KEY (id, type)
)
"#;

const UPSERT_GAUGE: &str = r#"
INSERT INTO metrics (id, type, value) VALUES (?, 'gauge', ?)
ON CONFLICT (id, type) DO UPDATE SET value = excluded.value
"#;

const UPSERT_COUNTER: &str = r#"
INSERT INTO metrics (id, type, delta) VALUES (?, 'counter', ?)
ON CONFLICT (id, type) DO UPDATE SET delta = COALESCE(metrics.delta, 0) + excluded.delta
WHERE typeof(COALESCE(metrics.delta, 0) + excluded.delta) = 'integer'
"#;

/// SQLite primary result codes that clear up on their own.
const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;

/// Classifies a sqlx error for retrying.
///
/// Transient: I/O failures, pool acquire timeouts, a crashed connection
/// worker, SQLSTATE class `08` (connection exception) and SQLite
/// `BUSY`/`LOCKED`, including their extended codes. Everything else,
/// constraint violations and a closed pool among them, is fatal.
pub fn classify_sqlx(err: &sqlx::Error) -> ErrorClass {
    match err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::WorkerCrashed => {
            ErrorClass::Transient
        }
        sqlx::Error::Database(db) => match db.code() {
            Some(code) if code.starts_with("08") => ErrorClass::Transient,
            Some(code) => match code.parse::<i32>() {
                Ok(code) if matches!(code & 0xff, SQLITE_BUSY | SQLITE_LOCKED) => {
                    ErrorClass::Transient
                }
                _ => ErrorClass::Fatal,
            },
            None => ErrorClass::Fatal,
        },
        _ => ErrorClass::Fatal,
    }
}

fn query_failed(operation: &'static str) -> impl Fn(sqlx::Error) -> TallyError {
    move |source| DatabaseError::Query { operation, source }.into()
}

/// Turns an upsert that touched no row into an overflow error.
///
/// Only the counter upsert has a conditional update.
fn check_upserted(id: &str, rows_affected: u64) -> Result<()> {
    if rows_affected == 0 {
        return Err(DatabaseError::CounterOverflow { id: id.to_string() }.into());
    }
    Ok(())
}

fn metric_from_row(row: &SqliteRow) -> Result<Metric> {
    let failed = query_failed("all");
    let id: String = row.try_get("id").map_err(&failed)?;
    let kind: String = row.try_get("type").map_err(&failed)?;
    let delta: Option<i64> = row.try_get("delta").map_err(&failed)?;
    let value: Option<f64> = row.try_get("value").map_err(&failed)?;

    let corrupted = |reason: String| DatabaseError::CorruptedRow {
        id: id.clone(),
        reason,
    };

    let value = match MetricKind::from_str(&kind) {
        Ok(MetricKind::Gauge) => MetricValue::Gauge(
            value.ok_or_else(|| corrupted("gauge row has no value".to_string()))?,
        ),
        Ok(MetricKind::Counter) => MetricValue::Counter(
            delta.ok_or_else(|| corrupted("counter row has no delta".to_string()))?,
        ),
        Err(_) => return Err(corrupted(format!("unknown type '{kind}'")).into()),
    };

    Ok(Metric { id, value })
}

/// Repository backed by a SQLite connection pool.
#[derive(Debug, Clone)]
pub struct DatabaseRepository {
    pool: SqlitePool,
    policy: RetryPolicy,
}

impl DatabaseRepository {
    /// Connects to `url`, creating the database file if needed, and creates
    /// the `metrics` table.
    ///
    /// In-memory URLs get a single long-lived connection, since every SQLite
    /// connection to `:memory:` opens its own database.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or the database cannot be
    /// opened or migrated.
    #[instrument(skip(policy))]
    pub async fn connect(url: &str, policy: RetryPolicy) -> Result<Self> {
        info!("connecting to database");

        let options = SqliteConnectOptions::from_str(url)
            .map_err(query_failed("connect"))?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));

        let pool_options = if url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };

        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(query_failed("connect"))?;

        let repo = Self::from_pool(pool, policy);
        repo.migrate().await?;

        info!("database ready");
        Ok(repo)
    }

    /// Wraps an existing pool. The table is not created; call
    /// [`migrate`](Self::migrate) if needed.
    pub fn from_pool(pool: SqlitePool, policy: RetryPolicy) -> Self {
        Self { pool, policy }
    }

    /// The underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Creates the `metrics` table if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the statement fails.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(CREATE_TABLE)
            .execute(&self.pool)
            .await
            .map_err(query_failed("migrate"))?;
        debug!("metrics table ready");
        Ok(())
    }

    async fn execute_upsert<B>(
        &self,
        ctx: &Context,
        operation: &'static str,
        sql: &'static str,
        name: &str,
        bind: B,
    ) -> Result<()>
    where
        B: Copy + Send + for<'q> sqlx::Encode<'q, sqlx::Sqlite> + sqlx::Type<sqlx::Sqlite>,
    {
        let pool = &self.pool;
        self.policy
            .run(ctx, TallyError::class, move || async move {
                let done = sqlx::query(sql)
                    .bind(name)
                    .bind(bind)
                    .execute(pool)
                    .await
                    .map_err(query_failed(operation))?;
                check_upserted(name, done.rows_affected())
            })
            .await
    }

    async fn fetch_column<T>(
        &self,
        ctx: &Context,
        operation: &'static str,
        sql: &'static str,
        name: &str,
    ) -> Result<Option<T>>
    where
        T: Send + Unpin + for<'r> sqlx::Decode<'r, sqlx::Sqlite> + sqlx::Type<sqlx::Sqlite>,
    {
        let pool = &self.pool;
        self.policy
            .run(ctx, TallyError::class, move || async move {
                let value: Option<Option<T>> = sqlx::query_scalar(sql)
                    .bind(name)
                    .fetch_optional(pool)
                    .await
                    .map_err(query_failed(operation))?;
                Ok(value.flatten())
            })
            .await
    }
}

#[async_trait]
impl Repository for DatabaseRepository {
    #[instrument(skip(self, ctx))]
    async fn update_gauge(&self, ctx: &Context, name: &str, value: f64) -> Result<()> {
        MetricValue::Gauge(value).validate()?;
        self.execute_upsert(ctx, "update_gauge", UPSERT_GAUGE, name, value)
            .await
    }

    #[instrument(skip(self, ctx))]
    async fn update_counter(&self, ctx: &Context, name: &str, delta: i64) -> Result<()> {
        self.execute_upsert(ctx, "update_counter", UPSERT_COUNTER, name, delta)
            .await
    }

    #[instrument(skip(self, ctx))]
    async fn gauge(&self, ctx: &Context, name: &str) -> Result<Option<f64>> {
        self.fetch_column(
            ctx,
            "gauge",
            "SELECT value FROM metrics WHERE id = ? AND type = 'gauge'",
            name,
        )
        .await
    }

    #[instrument(skip(self, ctx))]
    async fn counter(&self, ctx: &Context, name: &str) -> Result<Option<i64>> {
        self.fetch_column(
            ctx,
            "counter",
            "SELECT delta FROM metrics WHERE id = ? AND type = 'counter'",
            name,
        )
        .await
    }

    #[instrument(skip(self, ctx))]
    async fn all(&self, ctx: &Context) -> Result<Vec<Metric>> {
        let pool = &self.pool;
        let rows = self
            .policy
            .run(ctx, TallyError::class, move || async move {
                sqlx::query("SELECT id, type, delta, value FROM metrics")
                    .fetch_all(pool)
                    .await
                    .map_err(query_failed("all"))
            })
            .await?;

        rows.iter().map(metric_from_row).collect()
    }

    #[instrument(skip(self, ctx, metrics), fields(count = metrics.len()))]
    async fn update_batch(&self, ctx: &Context, metrics: &[Metric]) -> Result<()> {
        Metric::validate_all(metrics)?;
        let pool = &self.pool;
        self.policy
            .run(ctx, TallyError::class, move || async move {
                let failed = query_failed("update_batch");
                let mut tx = pool.begin().await.map_err(&failed)?;
                for metric in metrics {
                    let query = match metric.value {
                        MetricValue::Gauge(value) => {
                            sqlx::query(UPSERT_GAUGE).bind(metric.id.as_str()).bind(value)
                        }
                        MetricValue::Counter(delta) => {
                            sqlx::query(UPSERT_COUNTER).bind(metric.id.as_str()).bind(delta)
                        }
                    };
                    let done = query.execute(&mut *tx).await.map_err(&failed)?;
                    // Dropping `tx` on error rolls the batch back.
                    check_upserted(&metric.id, done.rows_affected())?;
                }
                tx.commit().await.map_err(&failed)?;
                Ok(())
            })
            .await?;

        debug!("batch committed");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if !self.pool.is_closed() {
            self.pool.close().await;
            info!("database pool closed");
        }
        Ok(())
    }

    async fn ping(&self, ctx: &Context) -> Result<()> {
        ctx.check()?;
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(query_failed("ping"))?;
        Ok(())
    }
}
