#![forbid(unsafe_code)]

//! Axum backend for tubelink.
//!
//! Three jobs: ask a Cobalt instance for a direct link (`/get-link`), list
//! the formats yt-dlp can see for a page (`/api/info`), and relay a chosen
//! direct media URL to the browser as an attachment (`/api/download`). The
//! relay never stores anything; bytes go from the origin socket to the client
//! socket one chunk at a time.

use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    sync::Arc,
};

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    body::Body,
    extract::{Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use clap::Parser;
use serde::{Deserialize, Serialize};
use tokio::signal;
use tracing::{error, info, warn};
use tubelink::config::{RuntimeOverrides, RuntimeSettings, resolve_runtime_settings};
use tubelink::logging::init_logging;
use tubelink::relay::{DEFAULT_CONTENT_TYPE, DownloadRequest, Relay, RelayError};
use tubelink::resolver::{CobaltResolver, ResolveError, Resolution, Resolver, YtDlpResolver};
use tubelink::security::ensure_not_root;

#[derive(Debug, Parser)]
#[command(name = "backend", about = "Resolve video pages and relay media downloads")]
struct BackendArgs {
    /// Listen address (IPv4 or IPv6).
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    /// Path of the `.env` file to read.
    #[arg(long = "env-file")]
    env_file: Option<PathBuf>,
    #[arg(long)]
    origin_timeout_secs: Option<u64>,
    #[arg(long)]
    chunk_size: Option<usize>,
    /// Restrict relayed downloads to this host and its subdomains. Repeatable.
    #[arg(long = "allowed-host")]
    allowed_hosts: Vec<String>,
    #[arg(long)]
    transfer_deadline_secs: Option<u64>,
    #[arg(long = "cobalt-url")]
    cobalt_url: Option<String>,
    #[arg(long = "yt-dlp-bin")]
    yt_dlp_bin: Option<PathBuf>,
}

impl BackendArgs {
    fn into_overrides(self) -> RuntimeOverrides {
        RuntimeOverrides {
            host: self.host,
            port: self.port,
            origin_timeout_secs: self.origin_timeout_secs,
            chunk_size: self.chunk_size,
            allowed_hosts: (!self.allowed_hosts.is_empty()).then_some(self.allowed_hosts),
            transfer_deadline_secs: self.transfer_deadline_secs,
            cobalt_api_url: self.cobalt_url,
            yt_dlp_bin: self.yt_dlp_bin,
            env_path: self.env_file,
        }
    }
}

fn parse_host_arg(value: &str) -> Result<IpAddr> {
    value
        .parse::<IpAddr>()
        .context("expected a valid IPv4 or IPv6 address for --host/TUBELINK_HOST")
}

/// Shared state injected into every Axum handler.
///
/// * `relay` owns the origin connection pool and the relay limits.
/// * `cobalt` talks to the remote link API.
/// * `extractor` lists formats locally (yt-dlp in production).
#[derive(Clone)]
struct AppState {
    relay: Arc<Relay>,
    cobalt: Arc<CobaltResolver>,
    extractor: Arc<dyn Resolver>,
}

impl AppState {
    fn from_settings(settings: &RuntimeSettings) -> Result<Self> {
        let relay = Relay::new(settings.relay_config()).context("building relay client")?;
        let cobalt = CobaltResolver::new(settings.cobalt_api_url.clone(), settings.origin_timeout)
            .context("building Cobalt client")?;
        let extractor = YtDlpResolver::new(settings.yt_dlp_bin.clone());
        Ok(Self {
            relay: Arc::new(relay),
            cobalt: Arc::new(cobalt),
            extractor: Arc::new(extractor),
        })
    }
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl From<RelayError> for ApiError {
    fn from(err: RelayError) -> Self {
        Self::new(err.status(), err.to_string())
    }
}

impl From<ResolveError> for ApiError {
    fn from(err: ResolveError) -> Self {
        Self::new(err.status(), err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.message,
        });
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let args = BackendArgs::parse();
    ensure_not_root("backend")?;

    let settings = resolve_runtime_settings(args.into_overrides())?;
    let host = parse_host_arg(&settings.host)?;
    let policy = settings.relay_config().allowed_hosts;
    if policy.is_restricted() {
        info!(hosts = ?policy.hosts(), "relay restricted to allowed hosts");
    } else {
        warn!("no allowed hosts configured; the relay will fetch any http(s) URL");
    }

    let state = AppState::from_settings(&settings)?;
    let app = router(state);

    let addr = SocketAddr::new(host, settings.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;
    info!(
        %addr,
        chunk_size = settings.chunk_size,
        origin_timeout = ?settings.origin_timeout,
        "API server listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/download", get(download))
        .route("/api/info", post(media_info))
        .route("/get-link", post(get_link))
        .fallback(not_found_fallback)
        .with_state(state)
}

async fn shutdown_signal() {
    // Only graceful shutdown depends on this; Ctrl+C still stops the process.
    if let Err(err) = signal::ctrl_c().await {
        error!("failed to install Ctrl+C handler: {err}");
    }
}

async fn not_found_fallback() -> ApiError {
    ApiError::not_found("endpoint not found")
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize)]
struct DownloadQuery {
    url: Option<String>,
    title: Option<String>,
    ext: Option<String>,
}

/// Relays `url` to the client as `<title>.<ext>`.
///
/// Every check that can fail cleanly (parameters, host policy, origin status)
/// runs before the response head is produced. After that, an origin failure
/// simply ends the body early.
async fn download(
    State(state): State<AppState>,
    Query(query): Query<DownloadQuery>,
) -> ApiResult<Response> {
    let relayed = state
        .relay
        .relay(DownloadRequest {
            source_url: query.url,
            display_name: query.title,
            extension: query.ext,
        })
        .await
        .inspect_err(|err| warn!("download rejected: {err}"))?;

    let mut headers = HeaderMap::new();
    let content_type = HeaderValue::from_str(&relayed.content_type)
        .unwrap_or_else(|_| HeaderValue::from_static(DEFAULT_CONTENT_TYPE));
    headers.insert(header::CONTENT_TYPE, content_type);
    headers.insert(
        header::CONTENT_DISPOSITION,
        HeaderValue::from_str(&relayed.content_disposition)
            .map_err(|_| ApiError::internal("could not build download header"))?,
    );
    if let Some(length) = relayed.content_length {
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
    }

    Ok((StatusCode::OK, headers, Body::from_stream(relayed.body)).into_response())
}

#[derive(Debug, Deserialize)]
struct PageRequest {
    url: Option<String>,
}

#[derive(Debug, Serialize)]
struct LinkResponse {
    status: String,
    download_url: String,
    filename: String,
}

/// Remote resolution: one direct link from the Cobalt API.
async fn get_link(
    State(state): State<AppState>,
    Json(payload): Json<PageRequest>,
) -> ApiResult<Json<LinkResponse>> {
    let page_url = payload
        .url
        .filter(|url| !url.trim().is_empty())
        .ok_or_else(|| ApiError::bad_request("No URL provided"))?;
    let link = state
        .cobalt
        .direct_link(&page_url)
        .await
        .inspect_err(|err| warn!("get-link failed: {err}"))?;
    Ok(Json(LinkResponse {
        status: "success".to_string(),
        download_url: link.download_url,
        filename: link.filename,
    }))
}

/// Local resolution: every format the extractor can see.
async fn media_info(
    State(state): State<AppState>,
    Json(payload): Json<PageRequest>,
) -> ApiResult<Json<Resolution>> {
    let page_url = payload
        .url
        .filter(|url| !url.trim().is_empty())
        .ok_or_else(|| ApiError::bad_request("No URL provided"))?;
    let resolution = state
        .extractor
        .resolve(&page_url)
        .await
        .inspect_err(|err| warn!("format listing failed: {err}"))?;
    Ok(Json(resolution))
}
