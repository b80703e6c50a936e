use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{ConnectInfo, Path, State, WebSocketUpgrade},
    http::{Extensions, HeaderMap, HeaderValue, StatusCode, Uri, header},
    response::{Html, IntoResponse, Response},
    routing::any,
};
use compile_common::{PathNormalizer, SourceReference};
use futures::StreamExt;
use serde::Serialize;
use tracing::{debug, warn};

use super::embedded::{AssetBundle, CACHE_FOREVER, PAGE_TEMPLATE, serve_asset};
use super::ws::{JobRequest, ProgressChannel};
use crate::admission::AdmissionQueue;
use crate::backends::{Backends, CacheEntry};
use crate::cache::BuildCache;
use crate::config::ServiceConfig;
use crate::errors::{BuildError, ServiceError};
use crate::reporter::ErrorReporter;
use crate::streamer::timed_bytes;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub normalizer: PathNormalizer,
    pub admission: AdmissionQueue,
    pub cache: BuildCache,
    pub reporter: ErrorReporter,
    pub channel: ProgressChannel,
    pub assets: AssetBundle,
    pub artifact_content_type: HeaderValue,
    pub write_timeout: Duration,
    pub page_timeout: Duration,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    /// Build the state from configuration and an already wired backend set.
    pub fn new(config: &ServiceConfig, backends: Backends) -> Result<Self> {
        let admission = AdmissionQueue::new(config.admission_settings());
        let reporter = ErrorReporter::new(Arc::clone(&backends.metadata), config.write_timeout());
        let cache = BuildCache::new(backends, config.cache_settings());
        let channel = ProgressChannel::new(
            admission.clone(),
            cache.clone(),
            reporter.clone(),
            config.channel_settings(),
        );
        let assets = AssetBundle::embedded().context("Failed to bundle static assets")?;
        let artifact_content_type = HeaderValue::from_str(&config.compiler.content_type)
            .with_context(|| format!("Invalid content type '{}'", config.compiler.content_type))?;
        Ok(Self {
            normalizer: PathNormalizer::new(),
            admission,
            cache,
            reporter,
            channel,
            assets,
            artifact_content_type,
            write_timeout: config.write_timeout(),
            page_timeout: config.page_timeout(),
        })
    }
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Internal(String),
    Timeout(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
            ApiError::Timeout(msg) => (StatusCode::GATEWAY_TIMEOUT, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<BuildError> for ApiError {
    fn from(err: BuildError) -> Self {
        ApiError::Internal(err.to_string())
    }
}

// ── Router ────────────────────────────────────────────────────────────

/// Routes answer any method.
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/_script.js", any(static_asset))
        .route("/_script.js.map", any(static_asset))
        .route("/favicon.ico", any(static_asset))
        .route("/compile.css", any(static_asset))
        .route("/_info/", any(missing_path))
        .route("/_info/{*path}", any(info))
        .route("/_ws/", any(missing_path))
        .route("/_ws/{*path}", any(compile_socket))
        .route("/_pg", any(playground_socket))
        .route("/_pg/", any(playground_socket))
        .route("/_artifact/{location}", any(artifact))
        .route("/_ah/health", any(health_check))
        .fallback(page)
}

// ── Helpers ───────────────────────────────────────────────────────────

/// Best-effort client address: first `X-Forwarded-For` hop, else the peer.
pub fn client_ip(headers: &HeaderMap, extensions: &Extensions) -> Option<String> {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    match forwarded {
        Some(ip) => Some(ip.to_string()),
        None => extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string()),
    }
}

fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Substitute `{{name}}` placeholders in one pass, so values are never
/// expanded again. Unknown placeholders are left as they are.
fn render_page(template: &str, values: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            out.push_str(&rest[start..]);
            return out;
        };
        let name = &after[..end];
        match values.iter().find(|(key, _)| *key == name) {
            Some((_, value)) => out.push_str(value),
            None => out.push_str(&rest[start..start + 2 + end + 2]),
        }
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    out
}

/// Record a failure against the requester, then map it to a response.
async fn surface(state: &AppState, err: BuildError, source_ip: Option<&str>) -> ApiError {
    let response = ApiError::from(err.clone());
    state
        .reporter
        .report(&ServiceError::Build(err), source_ip)
        .await;
    response
}

/// Look the reference up, giving up after `limit`.
async fn lookup_within(
    state: &AppState,
    reference: &SourceReference,
    limit: Duration,
    source_ip: Option<&str>,
) -> Result<(String, Option<CacheEntry>), ApiError> {
    let lookup = async {
        let key = state.cache.resolve_key(reference).await;
        let entry = state.cache.lookup(&key).await?;
        Ok::<_, BuildError>((key, entry))
    };
    match tokio::time::timeout(limit, lookup).await {
        Ok(Ok(found)) => Ok(found),
        Ok(Err(e)) => Err(surface(state, e, source_ip).await),
        Err(_) => Err(ApiError::Timeout(format!(
            "lookup of {} timed out after {}s",
            reference,
            limit.as_secs()
        ))),
    }
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn static_asset(State(state): State<SharedState>, uri: Uri, headers: HeaderMap) -> Response {
    let name = uri.path().trim_start_matches('/');
    serve_asset(&state.assets, name, &headers, state.write_timeout)
}

async fn page(
    State(state): State<SharedState>,
    uri: Uri,
    headers: HeaderMap,
    extensions: Extensions,
) -> Result<Response, ApiError> {
    let template = state
        .assets
        .text(PAGE_TEMPLATE)
        .ok_or_else(|| ApiError::Internal("page template missing".into()))?;

    let raw = uri.path().trim_matches('/');
    if raw.is_empty() {
        let html = render_page(
            template,
            &[
                ("title", "Compile"),
                ("path", ""),
                (
                    "body",
                    "<p>Enter a package path, or paste a program below.</p>\
                     <textarea id=\"source\">package main\n\nfunc main() {\n\tprintln(\"hello\")\n}\n</textarea>",
                ),
                ("artifact", ""),
            ],
        );
        return Ok(Html(html).into_response());
    }

    let reference = state.normalizer.normalize(raw);
    let source_ip = client_ip(&headers, &extensions);
    let lookup = lookup_within(&state, &reference, state.page_timeout, source_ip.as_deref()).await;
    let artifact = match lookup {
        Ok((_, Some(entry))) => format!(
            "<a href=\"/_artifact/{}\">{}</a>",
            escape_html(&entry.blob_location),
            escape_html(&entry.key)
        ),
        Ok((_, None)) => String::new(),
        Err(e) => {
            debug!(path = %reference, error = ?e, "page rendered without cache lookup");
            String::new()
        }
    };

    let path = escape_html(reference.path());
    let html = render_page(
        template,
        &[
            ("title", path.as_str()),
            ("path", path.as_str()),
            ("body", ""),
            ("artifact", artifact.as_str()),
        ],
    );
    Ok(Html(html).into_response())
}

#[derive(Debug, Serialize)]
pub struct InfoResponse {
    pub path: String,
    pub normalized: String,
    pub kind: String,
    pub key: String,
    pub entry: Option<CacheEntry>,
    pub builds_running: usize,
    pub builds_queued: usize,
}

async fn missing_path() -> ApiError {
    ApiError::BadRequest("missing package path".into())
}

async fn info(
    State(state): State<SharedState>,
    Path(raw): Path<String>,
    headers: HeaderMap,
    extensions: Extensions,
) -> Result<Json<InfoResponse>, ApiError> {
    let raw = raw.trim_matches('/').to_string();
    if raw.is_empty() {
        return Err(ApiError::BadRequest("missing package path".into()));
    }
    let reference = state.normalizer.normalize(&raw);
    let source_ip = client_ip(&headers, &extensions);
    let (key, entry) =
        lookup_within(&state, &reference, state.page_timeout, source_ip.as_deref()).await?;
    Ok(Json(InfoResponse {
        path: raw,
        normalized: reference.path().to_string(),
        kind: reference.kind().to_string(),
        key,
        entry,
        builds_running: state.admission.running(),
        builds_queued: state.admission.queued(),
    }))
}

async fn artifact(
    State(state): State<SharedState>,
    Path(location): Path<String>,
    headers: HeaderMap,
    extensions: Extensions,
) -> Result<Response, ApiError> {
    if location.is_empty() || !location.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(ApiError::BadRequest("invalid artifact location".into()));
    }
    let bytes = match state.cache.read_blob(&location).await {
        Ok(Some(bytes)) => bytes,
        Ok(None) => return Err(ApiError::NotFound(format!("artifact {} not found", location))),
        Err(e) => {
            let source_ip = client_ip(&headers, &extensions);
            return Err(surface(&state, e, source_ip.as_deref()).await);
        }
    };

    let mut response = Response::new(timed_bytes(
        bytes.clone(),
        state.write_timeout,
        format!("artifact {}", location),
    ));
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, state.artifact_content_type.clone());
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static(CACHE_FOREVER));
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(bytes.len()));
    Ok(response)
}

async fn compile_socket(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
    Path(raw): Path<String>,
    headers: HeaderMap,
    extensions: Extensions,
) -> Response {
    let reference = state.normalizer.normalize(raw.trim_matches('/'));
    let source_ip = client_ip(&headers, &extensions);
    upgrade(ws, state, JobRequest::Path(reference), source_ip)
}

async fn playground_socket(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
    headers: HeaderMap,
    extensions: Extensions,
) -> Response {
    let source_ip = client_ip(&headers, &extensions);
    upgrade(ws, state, JobRequest::Playground, source_ip)
}

fn upgrade(
    ws: WebSocketUpgrade,
    state: SharedState,
    request: JobRequest,
    source_ip: Option<String>,
) -> Response {
    let channel = state.channel.clone();
    ws.on_failed_upgrade(|e| warn!(error = %e, "websocket upgrade failed"))
        .on_upgrade(move |socket| async move {
            let (sink, stream) = socket.split();
            let _ = channel.serve(sink, stream, request, source_ip).await;
        })
}

// ── Tests ─────────────────────────────────────────────────────────────
