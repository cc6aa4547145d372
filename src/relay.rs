#![forbid(unsafe_code)]

//! Streaming download relay.
//!
//! Fetches a resolved media URL from its origin host and exposes the body as
//! a lazy stream of bounded chunks, so the HTTP layer can forward bytes to the
//! client as they arrive. Nothing is buffered beyond the chunk currently in
//! flight: hyper only polls [`RelayBody`] when the client socket can take more
//! data, and dropping the body (client went away) drops the origin response
//! and releases its connection.
//!
//! Failures come in two flavours. Anything that goes wrong before the first
//! byte is handed out is reported from [`Relay::relay`] and can still become a
//! clean error response. Once streaming has started the only way to signal a
//! failure is to end the body early, which [`RelayError::StreamInterrupted`]
//! does.

use std::{
    io,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use async_trait::async_trait;
use axum::http::StatusCode;
use bytes::Bytes;
use futures_util::{
    Stream, StreamExt, TryStreamExt,
    stream::{self, BoxStream},
};
use reqwest::header;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::{DEFAULT_CHUNK_SIZE, DEFAULT_ORIGIN_TIMEOUT_SECS};
use crate::filename::{build_filename, content_disposition};
use crate::security::HostPolicy;

/// Content type sent when the origin does not report one.
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Bound on connecting plus receiving response headers, and on each body
    /// read afterwards.
    pub origin_timeout: Duration,
    /// Upper bound on the size of a forwarded chunk.
    pub chunk_size: usize,
    pub allowed_hosts: HostPolicy,
    /// Wall-clock budget for a whole transfer. `None` means unbounded.
    pub transfer_deadline: Option<Duration>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            origin_timeout: Duration::from_secs(DEFAULT_ORIGIN_TIMEOUT_SECS),
            chunk_size: DEFAULT_CHUNK_SIZE,
            allowed_hosts: HostPolicy::allow_all(),
            transfer_deadline: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("missing required parameter: url")]
    MissingUrl,
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("origin host not allowed: {0}")]
    HostNotAllowed(String),
    /// Failed before any byte was forwarded.
    #[error("origin fetch failed: {0}")]
    Fetch(String),
    /// Failed after streaming began; the client only sees a truncated body.
    #[error("stream interrupted after {forwarded} bytes: {reason}")]
    StreamInterrupted { forwarded: u64, reason: String },
}

impl RelayError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::MissingUrl | Self::InvalidUrl(_) => StatusCode::BAD_REQUEST,
            Self::HostNotAllowed(_) => StatusCode::FORBIDDEN,
            Self::Fetch(_) | Self::StreamInterrupted { .. } => StatusCode::BAD_GATEWAY,
        }
    }
}

/// One relay job, built from the incoming request parameters.
#[derive(Debug, Clone, Default)]
pub struct DownloadRequest {
    pub source_url: Option<String>,
    pub display_name: Option<String>,
    pub extension: Option<String>,
}

/// Headers plus body for the client response. The body is single-pass.
pub struct RelayResponse {
    pub filename: String,
    pub content_type: String,
    pub content_disposition: String,
    pub content_length: Option<u64>,
    pub body: RelayBody,
}

/// Raw origin response as seen by the relay.
pub struct OriginResponse {
    pub status: StatusCode,
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
    pub body: BoxStream<'static, io::Result<Bytes>>,
}

/// The network leg towards the origin host.
#[async_trait]
pub trait Origin: Send + Sync {
    async fn fetch(&self, url: &Url) -> Result<OriginResponse, RelayError>;
}

/// [`Origin`] backed by a shared `reqwest` connection pool.
pub struct ReqwestOrigin {
    client: reqwest::Client,
    timeout: Duration,
}

impl ReqwestOrigin {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .read_timeout(timeout)
            .build()?;
        Ok(Self { client, timeout })
    }
}

#[async_trait]
impl Origin for ReqwestOrigin {
    async fn fetch(&self, url: &Url) -> Result<OriginResponse, RelayError> {
        let response = tokio::time::timeout(self.timeout, self.client.get(url.clone()).send())
            .await
            .map_err(|_| {
                RelayError::Fetch(format!(
                    "origin did not respond within {}s",
                    self.timeout.as_secs_f32()
                ))
            })?
            .map_err(|err| RelayError::Fetch(err.without_url().to_string()))?;

        let headers = response.headers();
        let content_type = headers
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let content_length = headers
            .get(header::CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok());

        Ok(OriginResponse {
            status: response.status(),
            content_type,
            content_length,
            body: response.bytes_stream().map_err(io::Error::other).boxed(),
        })
    }
}

pub struct Relay {
    origin: Arc<dyn Origin>,
    config: RelayConfig,
}

impl Relay {
    pub fn new(config: RelayConfig) -> anyhow::Result<Self> {
        let origin = ReqwestOrigin::new(config.origin_timeout)?;
        Ok(Self::with_origin(config, Arc::new(origin)))
    }

    pub fn with_origin(config: RelayConfig, origin: Arc<dyn Origin>) -> Self {
        Self { origin, config }
    }

    pub async fn relay(&self, request: DownloadRequest) -> Result<RelayResponse, RelayError> {
        let url = self.validate(request.source_url.as_deref())?;
        let filename = build_filename(
            request.display_name.as_deref(),
            request.extension.as_deref(),
        );
        let host = url.host_str().unwrap_or_default().to_string();

        info!(%host, %filename, "relay: fetching origin");
        let origin = self.origin.fetch(&url).await?;
        if !origin.status.is_success() {
            warn!(%host, status = %origin.status, "relay: origin rejected request");
            return Err(RelayError::Fetch(format!(
                "origin responded with {}",
                origin.status
            )));
        }

        let content_type = origin
            .content_type
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string());
        debug!(
            %host,
            %content_type,
            content_length = ?origin.content_length,
            "relay: streaming origin body"
        );

        let deadline = self
            .config
            .transfer_deadline
            .map(|budget| Instant::now() + budget);
        Ok(RelayResponse {
            content_disposition: content_disposition(&filename),
            filename,
            content_type,
            content_length: origin.content_length,
            body: RelayBody::new(origin.body, self.config.chunk_size, deadline, host),
        })
    }

    /// Checks the source URL before any network activity happens.
    fn validate(&self, source_url: Option<&str>) -> Result<Url, RelayError> {
        let raw = source_url
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or(RelayError::MissingUrl)?;
        let url = Url::parse(raw).map_err(|err| RelayError::InvalidUrl(err.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(RelayError::InvalidUrl(format!(
                "unsupported scheme {}",
                url.scheme()
            )));
        }
        if url.host_str().is_none() {
            return Err(RelayError::InvalidUrl("url has no host".to_string()));
        }
        if !self.config.allowed_hosts.allows(&url) {
            return Err(RelayError::HostNotAllowed(
                url.host_str().unwrap_or_default().to_string(),
            ));
        }
        Ok(url)
    }
}

struct Transfer {
    origin: BoxStream<'static, io::Result<Bytes>>,
    pending: Bytes,
    chunk_size: usize,
    deadline: Option<Instant>,
    forwarded: u64,
    host: String,
    finished: bool,
}

impl Transfer {
    /// Hands out the next chunk, pulling from the origin only once the
    /// previous origin chunk has been fully split up and forwarded.
    async fn next_chunk(&mut self) -> Option<Result<Bytes, RelayError>> {
        if self.finished {
            return None;
        }
        loop {
            if self.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                return Some(Err(self.interrupt("transfer deadline exceeded".to_string())));
            }
            if !self.pending.is_empty() {
                let take = self.pending.len().min(self.chunk_size);
                let chunk = self.pending.split_to(take);
                self.forwarded += chunk.len() as u64;
                return Some(Ok(chunk));
            }

            let next = match self.deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, self.origin.next()).await
                {
                    Ok(next) => next,
                    Err(_) => {
                        return Some(Err(self.interrupt("transfer deadline exceeded".to_string())));
                    }
                },
                None => self.origin.next().await,
            };

            match next {
                Some(Ok(bytes)) => self.pending = bytes,
                Some(Err(err)) => return Some(Err(self.interrupt(err.to_string()))),
                None => {
                    self.finished = true;
                    info!(
                        host = %self.host,
                        forwarded = self.forwarded,
                        "relay: transfer complete"
                    );
                    return None;
                }
            }
        }
    }

    fn interrupt(&mut self, reason: String) -> RelayError {
        self.finished = true;
        warn!(
            host = %self.host,
            forwarded = self.forwarded,
            %reason,
            "relay: stream interrupted"
        );
        RelayError::StreamInterrupted {
            forwarded: self.forwarded,
            reason,
        }
    }
}

/// Origin body re-cut into chunks of at most `chunk_size` bytes.
///
/// Chunks come out in origin order and are never merged. The first error ends
/// the stream.
pub struct RelayBody {
    inner: BoxStream<'static, Result<Bytes, RelayError>>,
}

impl RelayBody {
    fn new(
        origin: BoxStream<'static, io::Result<Bytes>>,
        chunk_size: usize,
        deadline: Option<Instant>,
        host: String,
    ) -> Self {
        let transfer = Transfer {
            origin,
            pending: Bytes::new(),
            chunk_size: chunk_size.max(1),
            deadline,
            forwarded: 0,
            host,
            finished: false,
        };

        let inner = stream::unfold(transfer, |mut transfer| async move {
            let item = transfer.next_chunk().await?;
            Some((item, transfer))
        })
        .boxed();

        Self { inner }
    }
}

impl Stream for RelayBody {
    type Item = Result<Bytes, RelayError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}
