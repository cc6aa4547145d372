#![forbid(unsafe_code)]

//! Download filename handling for the relay.

/// Stem used when the caller provides no usable title.
pub const DEFAULT_STEM: &str = "download";
/// Extension used when the caller provides none.
pub const DEFAULT_EXTENSION: &str = "mp4";

fn is_allowed(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, ' ' | '.' | '-' | '_')
}

/// Keeps ASCII alphanumerics, spaces, periods, hyphens and underscores, drops
/// everything else and trims trailing whitespace. Never adds characters, so
/// the result is at most as long as the input.
pub fn sanitize(name: &str) -> String {
    let kept: String = name.chars().filter(|c| is_allowed(*c)).collect();
    kept.trim_end().to_string()
}

/// Builds `<stem>.<ext>` for the `Content-Disposition` header, falling back to
/// [`DEFAULT_STEM`] and [`DEFAULT_EXTENSION`] for missing or blank inputs.
pub fn build_filename(display_name: Option<&str>, extension: Option<&str>) -> String {
    let stem = display_name
        .map(sanitize)
        .filter(|stem| !stem.is_empty())
        .unwrap_or_else(|| DEFAULT_STEM.to_string());
    // The extension goes into a header value too, so it gets the same filter.
    let ext = extension
        .map(|ext| sanitize(ext.trim()))
        .filter(|ext| !ext.is_empty())
        .unwrap_or_else(|| DEFAULT_EXTENSION.to_string());
    format!("{stem}.{ext}")
}

pub fn content_disposition(filename: &str) -> String {
    format!("attachment; filename={filename}")
}
