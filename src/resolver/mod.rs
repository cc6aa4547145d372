#![forbid(unsafe_code)]

//! Page URL resolution.
//!
//! A resolver turns the page a user pasted (a YouTube watch link, say) into
//! direct media URLs the relay can fetch. Two backends exist: a local
//! `yt-dlp` run that lists every format, and a remote Cobalt instance that
//! hands back a single ready-made link.

use async_trait::async_trait;
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use url::Url;

pub mod cobalt;
pub mod ytdlp;

pub use cobalt::CobaltResolver;
pub use ytdlp::YtDlpResolver;

/// Metadata plus downloadable formats for one page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resolution {
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
    pub formats: Vec<MediaFormat>,
}

/// A single direct media URL with whatever the extractor knows about it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaFormat {
    pub format_id: String,
    pub url: String,
    pub ext: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vcodec: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acodec: Option<String>,
    /// Total bitrate in kbit/s.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bitrate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approx_size_bytes: Option<u64>,
}

/// Ready-to-download link returned by the remote API.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DirectLink {
    pub download_url: String,
    pub filename: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("No URL provided")]
    MissingUrl,
    #[error("invalid page url: {0}")]
    InvalidUrl(String),
    /// The remote API refused the page.
    #[error("{0}")]
    Rejected(String),
    #[error("Could not retrieve a direct link.")]
    NoDirectLink,
    /// Transport or decoding trouble talking to the remote API.
    #[error("{0}")]
    Upstream(String),
    /// Local extraction failed.
    #[error("extraction failed: {0}")]
    Extraction(String),
}

impl ResolveError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::MissingUrl | Self::InvalidUrl(_) | Self::Rejected(_) => StatusCode::BAD_REQUEST,
            Self::NoDirectLink | Self::Upstream(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Extraction(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, page_url: &str) -> Result<Resolution, ResolveError>;
}

/// Shared input check: present, absolute, http(s).
pub fn validate_page_url(page_url: &str) -> Result<Url, ResolveError> {
    let trimmed = page_url.trim();
    if trimmed.is_empty() {
        return Err(ResolveError::MissingUrl);
    }
    let url = Url::parse(trimmed).map_err(|err| ResolveError::InvalidUrl(err.to_string()))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(ResolveError::InvalidUrl(format!("unsupported scheme {other}"))),
    }
}
