#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::relay::RelayConfig;
use crate::security::HostPolicy;

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_TUBELINK_PORT: u16 = 8080;
pub const DEFAULT_TUBELINK_HOST: &str = "127.0.0.1";
pub const DEFAULT_ORIGIN_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;
pub const DEFAULT_COBALT_API_URL: &str = "https://api.cobalt.tools/api/json";
pub const DEFAULT_YT_DLP_BIN: &str = "yt-dlp";

/// Everything the backend needs at startup, already merged from CLI flags,
/// the process environment and the `.env` file (in that order of precedence).
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub host: String,
    pub port: u16,
    pub origin_timeout: Duration,
    pub chunk_size: usize,
    pub allowed_hosts: Vec<String>,
    pub transfer_deadline: Option<Duration>,
    pub cobalt_api_url: String,
    pub yt_dlp_bin: PathBuf,
}

impl RuntimeSettings {
    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            origin_timeout: self.origin_timeout,
            chunk_size: self.chunk_size,
            allowed_hosts: HostPolicy::new(&self.allowed_hosts),
            transfer_deadline: self.transfer_deadline,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub origin_timeout_secs: Option<u64>,
    pub chunk_size: Option<usize>,
    pub allowed_hosts: Option<Vec<String>>,
    pub transfer_deadline_secs: Option<u64>,
    pub cobalt_api_url: Option<String>,
    pub yt_dlp_bin: Option<PathBuf>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_runtime_settings(overrides: RuntimeOverrides) -> Result<RuntimeSettings> {
    let env_path = overrides
        .env_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(&env_path)?;
    Ok(build_runtime_settings_with_overrides(
        &file_vars,
        env_var_string,
        overrides,
    ))
}

#[cfg(test)]
fn build_runtime_settings(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
) -> RuntimeSettings {
    build_runtime_settings_with_overrides(file_vars, env_lookup, RuntimeOverrides::default())
}

fn build_runtime_settings_with_overrides(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: RuntimeOverrides,
) -> RuntimeSettings {
    let lookup = |key: &str| lookup_value(key, file_vars, &env_lookup);

    let host = overrides
        .host
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .or_else(|| lookup("TUBELINK_HOST"))
        .unwrap_or_else(|| DEFAULT_TUBELINK_HOST.to_string());
    let port = overrides
        .port
        .or_else(|| lookup("TUBELINK_PORT").and_then(|value| value.parse::<u16>().ok()))
        .unwrap_or(DEFAULT_TUBELINK_PORT);
    let origin_timeout_secs = overrides
        .origin_timeout_secs
        .or_else(|| {
            lookup("TUBELINK_ORIGIN_TIMEOUT_SECS").and_then(|value| value.parse::<u64>().ok())
        })
        .filter(|secs| *secs > 0)
        .unwrap_or(DEFAULT_ORIGIN_TIMEOUT_SECS);
    let chunk_size = overrides
        .chunk_size
        .or_else(|| lookup("TUBELINK_CHUNK_SIZE").and_then(|value| value.parse::<usize>().ok()))
        .filter(|size| *size > 0)
        .unwrap_or(DEFAULT_CHUNK_SIZE);
    let allowed_hosts = overrides
        .allowed_hosts
        .or_else(|| lookup("TUBELINK_ALLOWED_HOSTS").map(|value| split_host_list(&value)))
        .unwrap_or_default();
    // Zero disables the deadline, same as leaving it unset.
    let transfer_deadline = overrides
        .transfer_deadline_secs
        .or_else(|| {
            lookup("TUBELINK_TRANSFER_DEADLINE_SECS").and_then(|value| value.parse::<u64>().ok())
        })
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs);
    let cobalt_api_url = overrides
        .cobalt_api_url
        .filter(|value| !value.trim().is_empty())
        .or_else(|| lookup("COBALT_API_URL"))
        .unwrap_or_else(|| DEFAULT_COBALT_API_URL.to_string());
    let yt_dlp_bin = overrides
        .yt_dlp_bin
        .or_else(|| lookup("YT_DLP_BIN").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_YT_DLP_BIN));

    RuntimeSettings {
        host,
        port,
        origin_timeout: Duration::from_secs(origin_timeout_secs),
        chunk_size,
        allowed_hosts,
        transfer_deadline,
        cobalt_api_url,
        yt_dlp_bin,
    }
}

fn split_host_list(value: &str) -> Vec<String> {
    value
        .split([',', ' '])
        .map(str::trim)
        .filter(|host| !host.is_empty())
        .map(str::to_string)
        .collect()
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key)
        .or_else(|| file_vars.get(key).cloned())
        .filter(|value| !value.trim().is_empty())
}

pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn make_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", contents).unwrap();
        file
    }

    fn settings_from(contents: &str) -> RuntimeSettings {
        let cfg = make_config(contents);
        let vars = read_env_file(cfg.path()).unwrap();
        build_runtime_settings(&vars, |_| None)
    }

    #[test]
    fn defaults_apply_to_empty_file() {
        let settings = settings_from("");
        assert_eq!(settings.host, DEFAULT_TUBELINK_HOST);
        assert_eq!(settings.port, DEFAULT_TUBELINK_PORT);
        assert_eq!(
            settings.origin_timeout,
            Duration::from_secs(DEFAULT_ORIGIN_TIMEOUT_SECS)
        );
        assert_eq!(settings.chunk_size, DEFAULT_CHUNK_SIZE);
        assert!(settings.allowed_hosts.is_empty());
        assert!(settings.transfer_deadline.is_none());
        assert_eq!(settings.cobalt_api_url, DEFAULT_COBALT_API_URL);
        assert_eq!(settings.yt_dlp_bin, PathBuf::from(DEFAULT_YT_DLP_BIN));
    }

    #[test]
    fn reads_relay_tuning_from_file() {
        let settings = settings_from(
            "TUBELINK_ORIGIN_TIMEOUT_SECS=5\nTUBELINK_CHUNK_SIZE=65536\n\
             TUBELINK_ALLOWED_HOSTS=\"googlevideo.com, cdn.example.net\"\n\
             TUBELINK_TRANSFER_DEADLINE_SECS=60\n",
        );
        assert_eq!(settings.origin_timeout, Duration::from_secs(5));
        assert_eq!(settings.chunk_size, 65536);
        assert_eq!(
            settings.allowed_hosts,
            vec!["googlevideo.com".to_string(), "cdn.example.net".to_string()]
        );
        assert_eq!(settings.transfer_deadline, Some(Duration::from_secs(60)));

        let relay = settings.relay_config();
        assert!(relay.allowed_hosts.is_restricted());
        assert_eq!(relay.chunk_size, 65536);
    }

    #[test]
    fn invalid_numbers_fall_back_to_defaults() {
        let settings = settings_from(
            "TUBELINK_PORT=\"nope\"\nTUBELINK_CHUNK_SIZE=0\nTUBELINK_ORIGIN_TIMEOUT_SECS=-3\n\
             TUBELINK_TRANSFER_DEADLINE_SECS=0\n",
        );
        assert_eq!(settings.port, DEFAULT_TUBELINK_PORT);
        assert_eq!(settings.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(
            settings.origin_timeout,
            Duration::from_secs(DEFAULT_ORIGIN_TIMEOUT_SECS)
        );
        assert!(settings.transfer_deadline.is_none());
    }

    #[test]
    fn env_wins_over_file() {
        let vars = read_env_file(
            make_config("TUBELINK_PORT=7000\nCOBALT_API_URL=\"https://file.example/api\"\n")
                .path(),
        )
        .unwrap();
        let settings = build_runtime_settings(&vars, |key| match key {
            "TUBELINK_PORT" => Some("7100".to_string()),
            _ => None,
        });
        assert_eq!(settings.port, 7100);
        assert_eq!(settings.cobalt_api_url, "https://file.example/api");
    }

    #[test]
    fn overrides_win_over_env_and_file() {
        let mut vars = HashMap::new();
        vars.insert("TUBELINK_HOST".to_string(), "file-host".to_string());
        vars.insert("TUBELINK_PORT".to_string(), "7000".to_string());
        vars.insert("TUBELINK_ALLOWED_HOSTS".to_string(), "file.com".to_string());
        vars.insert("YT_DLP_BIN".to_string(), "/file/yt-dlp".to_string());

        let overrides = RuntimeOverrides {
            host: Some("0.0.0.0".into()),
            port: Some(9000),
            allowed_hosts: Some(vec!["cli.com".into()]),
            ..RuntimeOverrides::default()
        };

        let settings = build_runtime_settings_with_overrides(
            &vars,
            |key| {
                if key == "YT_DLP_BIN" {
                    Some("/env/yt-dlp".to_string())
                } else if key == "TUBELINK_PORT" {
                    Some("8000".to_string())
                } else {
                    None
                }
            },
            overrides,
        );

        assert_eq!(settings.host, "0.0.0.0");
        assert_eq!(settings.port, 9000);
        assert_eq!(settings.allowed_hosts, vec!["cli.com".to_string()]);
        assert_eq!(settings.yt_dlp_bin, PathBuf::from("/env/yt-dlp"));
    }

    #[test]
    fn blank_host_override_is_ignored() {
        let settings = build_runtime_settings_with_overrides(
            &HashMap::new(),
            |_| None,
            RuntimeOverrides {
                host: Some("   ".into()),
                ..RuntimeOverrides::default()
            },
        );
        assert_eq!(settings.host, DEFAULT_TUBELINK_HOST);
    }

    #[test]
    fn read_env_file_handles_export_and_quotes() {
        let cfg = make_config(
            r#"
            export TUBELINK_HOST="0.0.0.0"
            COBALT_API_URL='https://cobalt.local/api/json'
            TUBELINK_PORT =  "9090"
            # comment
            INVALID_LINE
            "#,
        );
        let vars = read_env_file(cfg.path()).unwrap();
        assert_eq!(vars.get("TUBELINK_HOST").unwrap(), "0.0.0.0");
        assert_eq!(
            vars.get("COBALT_API_URL").unwrap(),
            "https://cobalt.local/api/json"
        );
        assert_eq!(vars.get("TUBELINK_PORT").unwrap(), "9090");
        assert!(!vars.contains_key("INVALID_LINE"));
    }

    #[test]
    fn read_env_file_missing_file_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let vars = read_env_file(&dir.path().join("missing.env")).unwrap();
        assert!(vars.is_empty());
    }

    #[test]
    fn resolve_runtime_settings_reads_explicit_env_path() {
        let cfg = make_config("TUBELINK_CHUNK_SIZE=4096\n");
        let settings = resolve_runtime_settings(RuntimeOverrides {
            env_path: Some(cfg.path().to_path_buf()),
            ..RuntimeOverrides::default()
        })
        .unwrap();
        assert_eq!(settings.chunk_size, 4096);
    }
}
