//! HTTP client that pushes metric updates to a collector.
//!
//! Single updates go to `POST {base}/update`, batches to
//! `POST {base}/updates`, both as JSON in the wire format of
//! [`Metric`]. Bodies are gzip-compressed unless disabled, and every request
//! runs under the configured [`RetryPolicy`]: connection failures and
//! timeouts are retried, non-2xx answers are not. The context is checked
//! before each attempt; a request already sent is bounded only by the HTTP
//! timeout.
//!
//! This module is only available when the `reporter` feature is enabled.
//!
//! # Example
//!
//! ```rust,no_run
//! use tally::{Context, Metric};
//! use tally::reporter::{Reporter, ReporterConfig};
//!
//! # async fn run() -> tally::Result<()> {
//! let reporter = Reporter::new(ReporterConfig::new("localhost:8080"))?;
//! let ctx = Context::background();
//!
//! reporter
//!     .send_batch(&ctx, &[Metric::gauge("Alloc", 1024.0), Metric::counter("PollCount", 5)])
//!     .await?;
//! # Ok(())
//! # }
//! ```

use std::error::Error as _;
use std::io::Write;
use std::time::Duration;

use flate2::Compression;
use flate2::write::GzEncoder;
use tracing::{debug, instrument};

use crate::context::Context;
use crate::error::{ReportError, Result, TallyError};
use crate::metric::Metric;
use crate::retry::{ErrorClass, RetryPolicy};

/// Configuration for a collector endpoint.
#[derive(Debug, Clone)]
pub struct ReporterConfig {
    /// Collector base URL, e.g. `http://localhost:8080`. A bare `host:port`
    /// gets `http://` prepended.
    pub base_url: String,
    /// Per-request HTTP timeout.
    pub timeout: Duration,
    /// Gzip request bodies.
    pub compress: bool,
    /// Retry schedule for transient failures.
    pub retry: RetryPolicy,
}

impl ReporterConfig {
    /// Creates a config with defaults: 10s timeout, gzip on, delays of
    /// 1s, 3s and 5s between attempts.
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        let base_url = if base_url.contains("://") {
            base_url
        } else {
            format!("http://{base_url}")
        };

        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(10),
            compress: true,
            retry: RetryPolicy::default(),
        }
    }

    /// Sets the per-request timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Enables or disables gzip compression of request bodies.
    #[must_use]
    pub fn with_compression(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url)
    }
}

/// Pushes metrics to a collector over HTTP.
#[derive(Debug, Clone)]
pub struct Reporter {
    client: reqwest::Client,
    config: ReporterConfig,
}

impl Reporter {
    /// Builds the HTTP client.
    ///
    /// # Errors
    ///
    /// Returns [`ReportError::ClientCreate`] if the client cannot be built.
    pub fn new(config: ReporterConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ReportError::ClientCreate { source: e })?;

        Ok(Self { client, config })
    }

    /// The active configuration.
    pub fn config(&self) -> &ReporterConfig {
        &self.config
    }

    /// Sends one metric to `{base}/update`.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails, the collector stays unreachable
    /// after all retries, or it answers with a non-2xx status.
    #[instrument(skip(self, ctx, metric), fields(id = %metric.id))]
    pub async fn send(&self, ctx: &Context, metric: &Metric) -> Result<()> {
        let json =
            serde_json::to_vec(metric).map_err(|e| ReportError::Serialization { source: e })?;
        self.post(ctx, "update", json).await
    }

    /// Sends a batch to `{base}/updates` and returns how many metrics it
    /// held. An empty batch sends nothing.
    ///
    /// # Errors
    ///
    /// See [`Reporter::send`].
    #[instrument(skip(self, ctx, metrics), fields(count = metrics.len()))]
    pub async fn send_batch(&self, ctx: &Context, metrics: &[Metric]) -> Result<usize> {
        if metrics.is_empty() {
            return Ok(0);
        }

        let json =
            serde_json::to_vec(metrics).map_err(|e| ReportError::Serialization { source: e })?;
        self.post(ctx, "updates", json).await?;
        Ok(metrics.len())
    }

    async fn post(&self, ctx: &Context, path: &str, json: Vec<u8>) -> Result<()> {
        let body = if self.config.compress {
            compress_gzip(&json)?
        } else {
            json
        };
        let url = self.config.endpoint(path);
        let body = &body;
        let url = url.as_str();

        self.config
            .retry
            .run(ctx, TallyError::class, move || self.send_once(url, body))
            .await?;

        debug!(url, bytes = body.len(), "metrics delivered");
        Ok(())
    }

    async fn send_once(&self, url: &str, body: &[u8]) -> Result<()> {
        let mut request = self
            .client
            .post(url)
            .header("Content-Type", "application/json");

        if self.config.compress {
            request = request.header("Content-Encoding", "gzip");
        }

        let response = request
            .body(body.to_vec())
            .send()
            .await
            .map_err(|e| ReportError::RequestFailed { source: e })?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(ReportError::HttpStatus {
            status: status.as_u16(),
            body,
        }
        .into())
    }
}

/// Compresses bytes with gzip.
fn compress_gzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2), Compression::default());
    encoder
        .write_all(data)
        .and_then(|()| encoder.finish())
        .map_err(|e| ReportError::Compression { source: e }.into())
}

/// Classifies a reqwest error for retrying.
///
/// Timeouts, connect failures and connections dropped mid-request are
/// transient. Everything else (invalid URLs, redirect loops, body errors)
/// is fatal.
pub fn classify_reqwest(err: &reqwest::Error) -> ErrorClass {
    if err.is_timeout() || err.is_connect() {
        return ErrorClass::Transient;
    }

    let mut source = err.source();
    while let Some(cause) = source {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            use std::io::ErrorKind::{
                BrokenPipe, ConnectionAborted, ConnectionRefused, ConnectionReset, UnexpectedEof,
            };
            if matches!(
                io.kind(),
                BrokenPipe | ConnectionAborted | ConnectionRefused | ConnectionReset | UnexpectedEof
            ) {
                return ErrorClass::Transient;
            }
        }
        source = cause.source();
    }

    ErrorClass::Fatal
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use axum::Router;
    use axum::body::Bytes;
    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use parking_lot::Mutex;

    #[derive(Clone, Default)]
    struct Received {
        bodies: Arc<Mutex<Vec<(String, serde_json::Value)>>>,
        hits: Arc<AtomicU32>,
    }

    fn decode(headers: &HeaderMap, body: &[u8]) -> serde_json::Value {
        let gzipped = headers
            .get("content-encoding")
            .is_some_and(|v| v.as_bytes() == b"gzip");
        if gzipped {
            let mut json = Vec::new();
            flate2::read::GzDecoder::new(body).read_to_end(&mut json).unwrap();
            serde_json::from_slice(&json).unwrap()
        } else {
            serde_json::from_slice(body).unwrap()
        }
    }

    async fn collector(status: StatusCode) -> (String, Received) {
        let received = Received::default();

        async fn record(
            path: &'static str,
            status: StatusCode,
            state: Received,
            headers: HeaderMap,
            body: Bytes,
        ) -> StatusCode {
            state.hits.fetch_add(1, Ordering::SeqCst);
            if status.is_success() {
                state.bodies.lock().push((path.to_string(), decode(&headers, &body)));
            }
            status
        }

        let app = Router::new()
            .route(
                "/update",
                post(move |State(s): State<Received>, h: HeaderMap, b: Bytes| {
                    record("update", status, s, h, b)
                }),
            )
            .route(
                "/updates",
                post(move |State(s): State<Received>, h: HeaderMap, b: Bytes| {
                    record("updates", status, s, h, b)
                }),
            )
            .with_state(received.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        (addr.to_string(), received)
    }

    #[test]
    fn test_config_normalizes_base_url() {
        assert_eq!(
            ReporterConfig::new("localhost:8080").endpoint("update"),
            "http://localhost:8080/update"
        );
        assert_eq!(
            ReporterConfig::new("https://collector/").endpoint("updates"),
            "https://collector/updates"
        );
    }

    #[test]
    fn test_compress_gzip_round_trip() {
        let data = br#"[{"id":"Poll","type":"counter","delta":1}]"#;
        let compressed = compress_gzip(data).unwrap();

        let mut out = Vec::new();
        flate2::read::GzDecoder::new(compressed.as_slice())
            .read_to_end(&mut out)
            .unwrap();
        assert_eq!(out, data);
    }

    #[tokio::test]
    async fn test_send_batch_gzipped() {
        let (addr, received) = collector(StatusCode::OK).await;
        let reporter = Reporter::new(ReporterConfig::new(addr)).unwrap();
        let ctx = Context::background();

        let sent = reporter
            .send_batch(&ctx, &[Metric::gauge("Alloc", 1.5), Metric::counter("Poll", 2)])
            .await
            .unwrap();

        assert_eq!(sent, 2);
        let bodies = received.bodies.lock();
        assert_eq!(bodies.len(), 1);
        assert_eq!(bodies[0].0, "updates");
        assert_eq!(
            bodies[0].1,
            serde_json::json!([
                {"id": "Alloc", "type": "gauge", "value": 1.5},
                {"id": "Poll", "type": "counter", "delta": 2}
            ])
        );
    }

    #[tokio::test]
    async fn test_send_single_uncompressed() {
        let (addr, received) = collector(StatusCode::OK).await;
        let reporter =
            Reporter::new(ReporterConfig::new(addr).with_compression(false)).unwrap();
        let ctx = Context::background();

        reporter.send(&ctx, &Metric::counter("Poll", 7)).await.unwrap();

        let bodies = received.bodies.lock();
        assert_eq!(bodies[0].0, "update");
        assert_eq!(
            bodies[0].1,
            serde_json::json!({"id": "Poll", "type": "counter", "delta": 7})
        );
    }

    #[tokio::test]
    async fn test_empty_batch_sends_nothing() {
        let (addr, received) = collector(StatusCode::OK).await;
        let reporter = Reporter::new(ReporterConfig::new(addr)).unwrap();

        let sent = reporter.send_batch(&Context::background(), &[]).await.unwrap();
        assert_eq!(sent, 0);
        assert_eq!(received.hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_error_status_is_fatal_and_not_retried() {
        let (addr, received) = collector(StatusCode::INTERNAL_SERVER_ERROR).await;
        let reporter = Reporter::new(ReporterConfig::new(addr)).unwrap();

        let err = reporter
            .send(&Context::background(), &Metric::gauge("Alloc", 1.0))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            TallyError::Report(ReportError::HttpStatus { status: 500, .. })
        ));
        assert_eq!(err.class(), ErrorClass::Fatal);
        assert_eq!(received.hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unreachable_collector_is_transient() {
        // Bind then drop to get a port nothing listens on.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let config = ReporterConfig::new(addr.to_string())
            .with_retry(RetryPolicy::new(vec![Duration::from_millis(10)]));
        let reporter = Reporter::new(config).unwrap();

        let err = reporter
            .send(&Context::background(), &Metric::gauge("Alloc", 1.0))
            .await
            .unwrap_err();
        assert!(err.is_transient(), "unexpected error: {err}");
    }

    #[tokio::test]
    async fn test_started_request_outlives_deadline() {
        let received = Received::default();
        let app = Router::new()
            .route(
                "/update",
                post(|State(s): State<Received>| async move {
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    s.hits.fetch_add(1, Ordering::SeqCst);
                    StatusCode::OK
                }),
            )
            .with_state(received.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let reporter = Reporter::new(ReporterConfig::new(addr.to_string())).unwrap();
        let ctx = Context::background().with_timeout(Duration::from_millis(100));

        reporter.send(&ctx, &Metric::counter("Poll", 1)).await.unwrap();
        assert_eq!(received.hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_canceled_context_sends_nothing() {
        let (addr, received) = collector(StatusCode::OK).await;
        let reporter = Reporter::new(ReporterConfig::new(addr)).unwrap();
        let ctx = Context::background();
        ctx.cancel();

        let err = reporter
            .send(&ctx, &Metric::counter("Poll", 1))
            .await
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::Canceled);
        assert_eq!(received.hits.load(Ordering::SeqCst), 0);
    }
}
