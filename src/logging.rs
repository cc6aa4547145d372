#![forbid(unsafe_code)]

//! Logging init for the tubelink binaries.

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,tubelink=debug";

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Installs a stderr `fmt` subscriber driven by `RUST_LOG`. Calling it twice
/// (tests, embedding) is harmless: the second install is ignored.
pub fn init_logging() {
    let installed = tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_writer(std::io::stderr)
        .with_target(true)
        .try_init();
    if installed.is_ok() {
        tracing::debug!("tubelink logging initialized");
    }
}
