#![forbid(unsafe_code)]

//! Local resolution through `yt-dlp --dump-single-json`.

use std::{path::PathBuf, time::Duration};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{MediaFormat, ResolveError, Resolution, Resolver, validate_page_url};

pub const DEFAULT_YT_DLP_TIMEOUT: Duration = Duration::from_secs(180);

/// Minimal view of the `yt-dlp --dump-single-json` payload. Every field is
/// optional because extractors other than YouTube fill in far less.
#[derive(Debug, Deserialize)]
struct VideoInfo {
    title: Option<String>,
    fulltitle: Option<String>,
    duration: Option<f64>,
    thumbnail: Option<String>,
    #[serde(default)]
    formats: Vec<FormatInfo>,
    // Single-file extractors put the media URL at the top level instead.
    url: Option<String>,
    ext: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FormatInfo {
    format_id: Option<String>,
    url: Option<String>,
    ext: Option<String>,
    resolution: Option<String>,
    width: Option<i64>,
    height: Option<i64>,
    vcodec: Option<String>,
    acodec: Option<String>,
    tbr: Option<f64>,
    filesize: Option<i64>,
    filesize_approx: Option<i64>,
}

impl FormatInfo {
    fn into_media_format(self, index: usize) -> Option<MediaFormat> {
        let url = self.url.filter(|url| !url.trim().is_empty())?;
        let ext = self.ext.unwrap_or_else(|| "mp4".to_string());
        // Storyboards are image sheets, not media.
        if ext == "mhtml" {
            return None;
        }
        let resolution = self
            .resolution
            .filter(|value| !value.trim().is_empty())
            .or_else(|| match (self.width, self.height) {
                (Some(width), Some(height)) => Some(format!("{width}x{height}")),
                _ => None,
            })
            .or_else(|| {
                (self.vcodec.as_deref() == Some("none")).then(|| "audio only".to_string())
            });
        let approx_size_bytes = self
            .filesize
            .or(self.filesize_approx)
            .and_then(|size| u64::try_from(size).ok());

        Some(MediaFormat {
            format_id: self
                .format_id
                .filter(|id| !id.trim().is_empty())
                .unwrap_or_else(|| index.to_string()),
            url,
            ext,
            resolution,
            vcodec: self.vcodec,
            acodec: self.acodec,
            bitrate: self.tbr,
            approx_size_bytes,
        })
    }
}

/// Turns raw `yt-dlp` JSON output into a [`Resolution`].
pub fn parse_resolution(raw: &[u8]) -> Result<Resolution, ResolveError> {
    let info: VideoInfo = serde_json::from_slice(raw)
        .map_err(|err| ResolveError::Extraction(format!("parsing yt-dlp output: {err}")))?;

    let mut formats: Vec<MediaFormat> = info
        .formats
        .into_iter()
        .enumerate()
        .filter_map(|(index, format)| format.into_media_format(index))
        .collect();
    if formats.is_empty()
        && let Some(url) = info.url.filter(|url| !url.trim().is_empty())
    {
        formats.push(MediaFormat {
            format_id: "default".to_string(),
            url,
            ext: info.ext.unwrap_or_else(|| "mp4".to_string()),
            resolution: None,
            vcodec: None,
            acodec: None,
            bitrate: None,
            approx_size_bytes: None,
        });
    }
    if formats.is_empty() {
        return Err(ResolveError::Extraction(
            "no downloadable formats found".to_string(),
        ));
    }

    let title = info
        .title
        .or(info.fulltitle)
        .filter(|title| !title.trim().is_empty())
        .unwrap_or_else(|| "video".to_string());

    Ok(Resolution {
        title,
        duration: info.duration,
        thumbnail: info.thumbnail,
        formats,
    })
}

pub struct YtDlpResolver {
    binary: PathBuf,
    timeout: Duration,
}

impl YtDlpResolver {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            timeout: DEFAULT_YT_DLP_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Resolver for YtDlpResolver {
    async fn resolve(&self, page_url: &str) -> Result<Resolution, ResolveError> {
        let url = validate_page_url(page_url)?;
        debug!(binary = %self.binary.display(), %url, "yt-dlp: extracting metadata");

        let run = Command::new(&self.binary)
            .arg("--dump-single-json")
            .arg("--skip-download")
            .arg("--no-warnings")
            .arg("--no-progress")
            .arg("--no-playlist")
            .arg(url.as_str())
            .kill_on_drop(true)
            .output();
        let output = tokio::time::timeout(self.timeout, run)
            .await
            .map_err(|_| {
                ResolveError::Extraction(format!(
                    "yt-dlp did not finish within {}s",
                    self.timeout.as_secs()
                ))
            })?
            .map_err(|err| {
                ResolveError::Extraction(format!("launching {}: {err}", self.binary.display()))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let reason = stderr
                .lines()
                .rev()
                .find(|line| !line.trim().is_empty())
                .unwrap_or("no error output")
                .trim()
                .to_string();
            warn!(status = %output.status, %reason, "yt-dlp: extraction failed");
            return Err(ResolveError::Extraction(format!(
                "yt-dlp exited with {}: {reason}",
                output.status
            )));
        }

        parse_resolution(&output.stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    const SAMPLE_INFO: &str = r#"{
        "id": "abc123",
        "title": "Launch day",
        "duration": 212.5,
        "thumbnail": "https://i.ytimg.com/vi/abc123/maxresdefault.jpg",
        "formats": [
            {"format_id": "sb0", "ext": "mhtml", "url": "https://i.ytimg.com/sb/abc123/storyboard"},
            {"format_id": "140", "ext": "m4a", "url": "https://rr1.googlevideo.com/140",
             "resolution": "audio only", "vcodec": "none", "acodec": "mp4a.40.2",
             "tbr": 129.5, "filesize": 3456789},
            {"format_id": "137", "ext": "mp4", "url": "https://rr1.googlevideo.com/137",
             "width": 1920, "height": 1080, "vcodec": "avc1.640028", "acodec": "none",
             "tbr": 4400.1, "filesize_approx": 98765432},
            {"format_id": "hls-720", "ext": "mp4", "vcodec": "avc1"}
        ]
    }"#;

    fn write_stub(dir: &TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("yt-dlp");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    #[test]
    fn parse_resolution_maps_formats() {
        let resolution = parse_resolution(SAMPLE_INFO.as_bytes()).unwrap();
        assert_eq!(resolution.title, "Launch day");
        assert_eq!(resolution.duration, Some(212.5));
        assert_eq!(resolution.formats.len(), 2);

        let audio = &resolution.formats[0];
        assert_eq!(audio.format_id, "140");
        assert_eq!(audio.ext, "m4a");
        assert_eq!(audio.resolution.as_deref(), Some("audio only"));
        assert_eq!(audio.bitrate, Some(129.5));
        assert_eq!(audio.approx_size_bytes, Some(3_456_789));

        let video = &resolution.formats[1];
        assert_eq!(video.resolution.as_deref(), Some("1920x1080"));
        assert_eq!(video.acodec.as_deref(), Some("none"));
        assert_eq!(video.approx_size_bytes, Some(98_765_432));
    }

    #[test]
    fn parse_resolution_uses_top_level_url_for_single_file_pages() {
        let raw = r#"{"fulltitle": "raw clip", "url": "https://cdn.example/clip.webm", "ext": "webm"}"#;
        let resolution = parse_resolution(raw.as_bytes()).unwrap();
        assert_eq!(resolution.title, "raw clip");
        assert_eq!(resolution.formats.len(), 1);
        assert_eq!(resolution.formats[0].format_id, "default");
        assert_eq!(resolution.formats[0].ext, "webm");
    }

    #[test]
    fn parse_resolution_rejects_empty_and_garbage() {
        assert!(matches!(
            parse_resolution(br#"{"title": "nothing", "formats": []}"#),
            Err(ResolveError::Extraction(_))
        ));
        assert!(matches!(
            parse_resolution(b"ERROR: not json"),
            Err(ResolveError::Extraction(_))
        ));
    }

    #[tokio::test]
    async fn resolve_runs_binary_and_parses_stdout() {
        let dir = tempfile::tempdir().unwrap();
        let json_path = dir.path().join("info.json");
        std::fs::write(&json_path, SAMPLE_INFO).unwrap();
        let stub = write_stub(&dir, &format!("cat '{}'", json_path.display()));

        let resolver = YtDlpResolver::new(stub);
        let resolution = resolver
            .resolve("https://www.youtube.com/watch?v=abc123")
            .await
            .unwrap();
        assert_eq!(resolution.title, "Launch day");
        assert_eq!(resolution.formats.len(), 2);
    }

    #[tokio::test]
    async fn resolve_reports_non_zero_exit() {
        let dir = tempfile::tempdir().unwrap();
        let stub = write_stub(&dir, "echo 'ERROR: Video unavailable' >&2\nexit 1");

        let err = YtDlpResolver::new(stub)
            .resolve("https://www.youtube.com/watch?v=gone")
            .await
            .unwrap_err();
        match err {
            ResolveError::Extraction(message) => {
                assert!(message.contains("Video unavailable"), "{message}")
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn resolve_reports_missing_binary() {
        let dir = tempfile::tempdir().unwrap();
        let err = YtDlpResolver::new(dir.path().join("absent"))
            .resolve("https://www.youtube.com/watch?v=abc123")
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::Extraction(_)));
    }

    #[tokio::test]
    async fn resolve_times_out_slow_extraction() {
        let dir = tempfile::tempdir().unwrap();
        let stub = write_stub(&dir, "sleep 5");
        let err = YtDlpResolver::new(stub)
            .with_timeout(Duration::from_millis(200))
            .resolve("https://www.youtube.com/watch?v=abc123")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("did not finish"), "{err}");
    }

    #[tokio::test]
    async fn resolve_validates_before_spawning() {
        let resolver = YtDlpResolver::new("/definitely/not/here");
        assert!(matches!(
            resolver.resolve("").await,
            Err(ResolveError::MissingUrl)
        ));
    }
}
