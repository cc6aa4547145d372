#![forbid(unsafe_code)]

//! Remote resolution through a Cobalt API instance.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{StatusCode, header};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{DirectLink, MediaFormat, ResolveError, Resolution, Resolver, validate_page_url};

/// Filename used when the API does not suggest one.
pub const FALLBACK_FILENAME: &str = "video.mp4";
pub const REJECTED_MESSAGE: &str =
    "Failed to process video. The link might be invalid or the server is busy.";

// Public instances tend to block obvious bots.
const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CobaltRequest<'a> {
    url: &'a str,
    v_quality: &'a str,
    filename_pattern: &'a str,
    is_audio_only: bool,
}

#[derive(Debug, Deserialize)]
struct CobaltResponse {
    url: Option<String>,
    filename: Option<String>,
    picker: Option<Vec<PickerItem>>,
}

#[derive(Debug, Deserialize)]
struct PickerItem {
    url: Option<String>,
}

impl CobaltResponse {
    /// A plain `url` wins; otherwise the first `picker` entry is used.
    fn into_direct_link(self) -> Result<DirectLink, ResolveError> {
        if let Some(url) = self.url {
            return Ok(DirectLink {
                download_url: url,
                filename: self
                    .filename
                    .filter(|name| !name.trim().is_empty())
                    .unwrap_or_else(|| FALLBACK_FILENAME.to_string()),
            });
        }
        if let Some(picker) = self.picker {
            let url = picker
                .into_iter()
                .next()
                .and_then(|item| item.url)
                .ok_or(ResolveError::NoDirectLink)?;
            return Ok(DirectLink {
                download_url: url,
                filename: FALLBACK_FILENAME.to_string(),
            });
        }
        Err(ResolveError::NoDirectLink)
    }
}

pub struct CobaltResolver {
    client: reqwest::Client,
    api_url: String,
}

impl CobaltResolver {
    pub fn new(api_url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(BROWSER_USER_AGENT)
            .build()?;
        Ok(Self {
            client,
            api_url: api_url.into(),
        })
    }

    /// Asks the API for the best available quality as an mp4 link.
    pub async fn direct_link(&self, page_url: &str) -> Result<DirectLink, ResolveError> {
        let url = validate_page_url(page_url)?;
        let payload = CobaltRequest {
            url: page_url.trim(),
            v_quality: "max",
            filename_pattern: "basic",
            is_audio_only: false,
        };
        debug!(api = %self.api_url, %url, "cobalt: requesting direct link");

        let response = self
            .client
            .post(&self.api_url)
            .header(header::ACCEPT, "application/json")
            .json(&payload)
            .send()
            .await
            .map_err(|err| ResolveError::Upstream(err.without_url().to_string()))?;

        let status = response.status();
        if status != StatusCode::OK {
            warn!(api = %self.api_url, %status, "cobalt: request rejected");
            return Err(ResolveError::Rejected(REJECTED_MESSAGE.to_string()));
        }

        let body: CobaltResponse = response
            .json()
            .await
            .map_err(|err| ResolveError::Upstream(err.without_url().to_string()))?;
        body.into_direct_link()
    }
}

#[async_trait]
impl Resolver for CobaltResolver {
    async fn resolve(&self, page_url: &str) -> Result<Resolution, ResolveError> {
        let link = self.direct_link(page_url).await?;
        let (title, ext) = match link.filename.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => {
                (stem.to_string(), ext.to_string())
            }
            _ => (link.filename.clone(), "mp4".to_string()),
        };
        Ok(Resolution {
            title,
            duration: None,
            thumbnail: None,
            formats: vec![MediaFormat {
                format_id: "cobalt".to_string(),
                url: link.download_url,
                ext,
                resolution: None,
                vcodec: None,
                acodec: None,
                bitrate: None,
                approx_size_bytes: None,
            }],
        })
    }
}
