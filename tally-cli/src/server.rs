//! Collector HTTP API.
//!
//! Routes:
//!
//! | method | path                         | body              | response                  |
//! |--------|------------------------------|-------------------|---------------------------|
//! | POST   | `/update/:type/:name/:value` |                   | 200, 400 bad kind/value   |
//! | POST   | `/update`                    | `Metric` JSON     | stored metric JSON        |
//! | POST   | `/updates`                   | `[Metric]` JSON   | 200                       |
//! | POST   | `/value`                     | `{id, type}` JSON | metric JSON, 404 if absent|
//! | GET    | `/value/:type/:name`         |                   | value as text, 404        |
//! | GET    | `/`                          |                   | HTML table of all metrics |
//! | GET    | `/ping`                      |                   | 200, 500 if store is down |
//!
//! Request bodies sent with `Content-Encoding: gzip` are inflated first.

use std::error::Error;
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use serde::Deserialize;
use tally::repository::{self, Repository, StorageConfig};
use tally::snapshot::{self, SnapshotFile};
use tally::{Context, ErrorClass, Metric, MetricKind, MetricValue, RetryPolicy, TallyError};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::ServeArgs;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    repo: Arc<dyn Repository>,
    /// Saved after every successful update when set.
    sync_snapshot: Option<SnapshotFile>,
    shutdown: CancellationToken,
}

impl AppState {
    /// Creates handler state over `repo`.
    pub fn new(
        repo: Arc<dyn Repository>,
        sync_snapshot: Option<SnapshotFile>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            repo,
            sync_snapshot,
            shutdown,
        }
    }

    /// Context for one request; canceled when the server shuts down.
    fn context(&self) -> Context {
        Context::with_token(self.shutdown.child_token())
    }

    async fn persist(&self, ctx: &Context) {
        if let Some(snapshot) = &self.sync_snapshot {
            if let Err(e) = snapshot::dump(self.repo.as_ref(), ctx, snapshot).await {
                error!(error = %e, path = %snapshot.path().display(), "synchronous snapshot failed");
            }
        }
    }
}

/// Handler error mapped to a status code.
#[derive(Debug)]
pub enum ApiError {
    /// 400: malformed input.
    BadRequest(String),
    /// 404: no such metric.
    NotFound,
    /// 415: JSON endpoint called without a JSON content type.
    UnsupportedMediaType,
    /// 500: storage failure.
    Internal(String),
}

impl From<TallyError> for ApiError {
    fn from(err: TallyError) -> Self {
        match err {
            TallyError::Metric(e) => Self::BadRequest(e.to_string()),
            other => {
                if other.class() != ErrorClass::Canceled {
                    error!(error = %other, "storage operation failed");
                }
                Self::Internal(other.to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            Self::NotFound => StatusCode::NOT_FOUND.into_response(),
            Self::UnsupportedMediaType => (
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                "expected Content-Type: application/json",
            )
                .into_response(),
            Self::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg).into_response(),
        }
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Builds the router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(list_metrics))
        .route("/ping", get(ping))
        .route("/update", post(update_json))
        .route("/update/:kind/:name/:value", post(update_text))
        .route("/updates", post(update_batch))
        .route("/value", post(value_json))
        .route("/value/:kind/:name", get(value_text))
        .with_state(state)
}

/// Returns the request body, inflated if it was gzipped.
fn decode_body(headers: &HeaderMap, body: &[u8]) -> ApiResult<Vec<u8>> {
    let gzipped = headers
        .get(header::CONTENT_ENCODING)
        .is_some_and(|v| v.as_bytes().eq_ignore_ascii_case(b"gzip"));
    if !gzipped {
        return Ok(body.to_vec());
    }

    let mut inflated = Vec::with_capacity(body.len() * 4);
    flate2::read::GzDecoder::new(body)
        .read_to_end(&mut inflated)
        .map_err(|e| ApiError::BadRequest(format!("invalid gzip body: {e}")))?;
    Ok(inflated)
}

/// Decodes a JSON body, enforcing the content type.
fn json_body<T: serde::de::DeserializeOwned>(headers: &HeaderMap, body: &[u8]) -> ApiResult<T> {
    let is_json = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("application/json"));
    if !is_json {
        return Err(ApiError::UnsupportedMediaType);
    }

    let data = decode_body(headers, body)?;
    serde_json::from_slice(&data).map_err(|e| ApiError::BadRequest(format!("invalid JSON: {e}")))
}

fn parse_kind(kind: &str) -> ApiResult<MetricKind> {
    kind.parse::<MetricKind>()
        .map_err(|e| ApiError::BadRequest(e.to_string()))
}

/// `POST /update/:kind/:name/:value`
pub async fn update_text(
    State(state): State<AppState>,
    Path((kind, name, value)): Path<(String, String, String)>,
) -> ApiResult<StatusCode> {
    if name.is_empty() {
        return Err(ApiError::NotFound);
    }
    let kind = parse_kind(&kind)?;
    let value = MetricValue::parse(kind, &value).map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let ctx = state.context();
    state.repo.update(&ctx, &Metric { id: name, value }).await?;
    state.persist(&ctx).await;
    Ok(StatusCode::OK)
}

/// `POST /update` with a JSON metric; answers with the stored metric.
pub async fn update_json(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    let metric: Metric = json_body(&headers, &body)?;
    if metric.id.is_empty() {
        return Err(ApiError::NotFound);
    }

    let ctx = state.context();
    state.repo.update(&ctx, &metric).await?;
    state.persist(&ctx).await;

    let stored = state
        .repo
        .get(&ctx, &metric.id, metric.kind())
        .await?
        .ok_or(ApiError::NotFound)?;
    Ok(axum::Json(Metric {
        id: metric.id,
        value: stored,
    })
    .into_response())
}

/// `POST /updates` with a JSON array, applied as one batch.
pub async fn update_batch(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<StatusCode> {
    let metrics: Vec<Metric> = json_body(&headers, &body)?;
    if metrics.iter().any(|m| m.id.is_empty()) {
        return Err(ApiError::BadRequest("metric with empty id".to_string()));
    }

    let ctx = state.context();
    state.repo.update_batch(&ctx, &metrics).await?;
    state.persist(&ctx).await;
    Ok(StatusCode::OK)
}

#[derive(Debug, Deserialize)]
struct ValueRequest {
    id: String,
    #[serde(rename = "type")]
    kind: MetricKind,
}

/// `POST /value` with `{id, type}`; answers with the metric.
pub async fn value_json(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    let request: ValueRequest = json_body(&headers, &body)?;

    let ctx = state.context();
    let value = state
        .repo
        .get(&ctx, &request.id, request.kind)
        .await?
        .ok_or(ApiError::NotFound)?;
    Ok(axum::Json(Metric {
        id: request.id,
        value,
    })
    .into_response())
}

/// `GET /value/:kind/:name`; the value as plain text.
pub async fn value_text(
    State(state): State<AppState>,
    Path((kind, name)): Path<(String, String)>,
) -> ApiResult<String> {
    let kind = parse_kind(&kind)?;
    let ctx = state.context();
    let value = state
        .repo
        .get(&ctx, &name, kind)
        .await?
        .ok_or(ApiError::NotFound)?;
    Ok(value.to_string())
}

/// `GET /`; every metric as an HTML table.
pub async fn list_metrics(State(state): State<AppState>) -> ApiResult<Html<String>> {
    let ctx = state.context();
    let mut metrics = state.repo.all(&ctx).await?;
    metrics.sort_by(|a, b| (a.id.as_str(), a.kind()).cmp(&(b.id.as_str(), b.kind())));

    let mut html = String::from(
        "<!DOCTYPE html>\n<html><head><title>Metrics</title></head><body>\n\
         <table>\n<tr><th>Name</th><th>Type</th><th>Value</th></tr>\n",
    );
    for metric in &metrics {
        html.push_str(&format!(
            "<tr><td>{}</td><td>{}</td><td>{}</td></tr>\n",
            escape_html(&metric.id),
            metric.kind(),
            metric.value
        ));
    }
    html.push_str("</table>\n</body></html>\n");
    Ok(Html(html))
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

/// `GET /ping`
pub async fn ping(State(state): State<AppState>) -> StatusCode {
    match state.repo.ping(&state.context()).await {
        Ok(()) => StatusCode::OK,
        Err(e) => {
            warn!(error = %e, "ping failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// Resolves when SIGINT or SIGTERM arrives, or `token` is canceled.
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received SIGINT"),
        () = terminate => info!("received SIGTERM"),
        () = token.cancelled() => {}
    }
}

/// Implements `tally serve`.
///
/// # Errors
///
/// Returns an error if the backend cannot be opened, the restore fails,
/// the address cannot be bound, or the final snapshot cannot be written.
pub async fn run(args: ServeArgs) -> Result<(), Box<dyn Error>> {
    let storage = args.storage_config()?;
    let repo = repository::open(&storage, RetryPolicy::default()).await?;
    let shutdown = CancellationToken::new();

    // The file backend is its own snapshot.
    let snapshot = match storage {
        StorageConfig::File { .. } => None,
        _ => Some(SnapshotFile::new(&args.file_storage_path)),
    };

    if let Some(snapshot) = snapshot.as_ref().filter(|_| args.restore) {
        let ctx = Context::with_token(shutdown.child_token());
        snapshot::restore(repo.as_ref(), &ctx, snapshot).await?;
    }

    let interval = args.snapshot_interval();
    let periodic = match (&snapshot, interval) {
        (Some(snapshot), Some(interval)) => Some(snapshot::spawn_periodic(
            Arc::clone(&repo),
            snapshot.clone(),
            interval,
            shutdown.clone(),
        )),
        _ => None,
    };
    let sync_snapshot = snapshot.clone().filter(|_| interval.is_none());

    let state = AppState::new(Arc::clone(&repo), sync_snapshot, shutdown.clone());
    let listener = TcpListener::bind(&args.address).await?;
    info!(
        address = %listener.local_addr()?,
        backend = storage.name(),
        snapshot_interval = ?interval.unwrap_or(Duration::ZERO),
        "collector listening"
    );

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    info!("shutting down");
    shutdown.cancel();
    if let Some(handle) = periodic {
        handle.await?;
    }
    if let Some(snapshot) = &snapshot {
        let saved = snapshot::dump(repo.as_ref(), &Context::background(), snapshot).await?;
        info!(count = saved, path = %snapshot.path().display(), "final snapshot saved");
    }
    repo.close().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tally::repository::MemoryRepository;
    use tempfile::tempdir;

    fn state() -> AppState {
        AppState::new(
            Arc::new(MemoryRepository::new()),
            None,
            CancellationToken::new(),
        )
    }

    fn json_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, "application/json".parse().unwrap());
        headers
    }

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn path3(kind: &str, name: &str, value: &str) -> Path<(String, String, String)> {
        Path((kind.to_string(), name.to_string(), value.to_string()))
    }

    #[tokio::test]
    async fn test_text_update_and_read() {
        let state = state();

        let status = update_text(State(state.clone()), path3("counter", "Poll", "5"))
            .await
            .unwrap();
        assert_eq!(status, StatusCode::OK);
        update_text(State(state.clone()), path3("counter", "Poll", "3"))
            .await
            .unwrap();
        update_text(State(state.clone()), path3("gauge", "Alloc", "123.45"))
            .await
            .unwrap();

        let text = value_text(
            State(state.clone()),
            Path(("counter".to_string(), "Poll".to_string())),
        )
        .await
        .unwrap();
        assert_eq!(text, "8");

        let text = value_text(
            State(state.clone()),
            Path(("gauge".to_string(), "Alloc".to_string())),
        )
        .await
        .unwrap();
        assert_eq!(text, "123.45");
    }

    #[tokio::test]
    async fn test_text_update_validation() {
        let state = state();

        let resp = update_text(State(state.clone()), path3("histogram", "X", "1"))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = update_text(State(state.clone()), path3("counter", "X", "1.5"))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        for value in ["NaN", "inf", "-inf"] {
            let resp = update_text(State(state.clone()), path3("gauge", "X", value))
                .await
                .into_response();
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "{value}");
        }

        let resp = update_text(State(state.clone()), path3("gauge", "", "1"))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_missing_value_is_404() {
        let resp = value_text(
            State(state()),
            Path(("gauge".to_string(), "Missing".to_string())),
        )
        .await
        .into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_json_update_returns_accumulated_counter() {
        let state = state();
        let body = Bytes::from_static(br#"{"id":"Poll","type":"counter","delta":2}"#);

        update_json(State(state.clone()), json_headers(), body.clone())
            .await
            .unwrap();
        let resp = update_json(State(state.clone()), json_headers(), body)
            .await
            .unwrap();

        let stored: Metric = serde_json::from_str(&body_text(resp).await).unwrap();
        assert_eq!(stored, Metric::counter("Poll", 4));
    }

    #[tokio::test]
    async fn test_json_update_requires_content_type() {
        let body = Bytes::from_static(br#"{"id":"Alloc","type":"gauge","value":1.0}"#);
        let resp = update_json(State(state()), HeaderMap::new(), body)
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    }

    #[tokio::test]
    async fn test_json_update_missing_field_is_400() {
        let body = Bytes::from_static(br#"{"id":"Alloc","type":"gauge"}"#);
        let resp = update_json(State(state()), json_headers(), body)
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_gzipped_batch() {
        let state = state();
        let json = br#"[
            {"id":"Poll","type":"counter","delta":1},
            {"id":"Alloc","type":"gauge","value":2.5},
            {"id":"Poll","type":"counter","delta":4}
        ]"#;
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(json).unwrap();
        let compressed = encoder.finish().unwrap();

        let mut headers = json_headers();
        headers.insert(header::CONTENT_ENCODING, "gzip".parse().unwrap());
        update_batch(State(state.clone()), headers, Bytes::from(compressed))
            .await
            .unwrap();

        let body = Bytes::from_static(br#"{"id":"Poll","type":"counter"}"#);
        let resp = value_json(State(state.clone()), json_headers(), body)
            .await
            .unwrap();
        let metric: Metric = serde_json::from_str(&body_text(resp).await).unwrap();
        assert_eq!(metric, Metric::counter("Poll", 5));
    }

    #[tokio::test]
    async fn test_value_json_missing_is_404() {
        let body = Bytes::from_static(br#"{"id":"Nope","type":"gauge"}"#);
        let resp = value_json(State(state()), json_headers(), body)
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_list_metrics_html() {
        let state = state();
        update_text(State(state.clone()), path3("gauge", "<b>", "1"))
            .await
            .unwrap();
        update_text(State(state.clone()), path3("counter", "Poll", "2"))
            .await
            .unwrap();

        let Html(html) = list_metrics(State(state)).await.unwrap();
        assert!(html.contains("<td>&lt;b&gt;</td><td>gauge</td><td>1</td>"));
        assert!(html.contains("<td>Poll</td><td>counter</td><td>2</td>"));
    }

    #[tokio::test]
    async fn test_ping() {
        assert_eq!(ping(State(state())).await, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_sync_snapshot_after_update() {
        let dir = tempdir().unwrap();
        let snapshot = SnapshotFile::new(dir.path().join("metrics.json"));
        let state = AppState::new(
            Arc::new(MemoryRepository::new()),
            Some(snapshot.clone()),
            CancellationToken::new(),
        );

        update_text(State(state), path3("counter", "Poll", "7"))
            .await
            .unwrap();
        assert_eq!(snapshot.load().await.unwrap(), vec![Metric::counter("Poll", 7)]);
    }
}
