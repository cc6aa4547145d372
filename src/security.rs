#![forbid(unsafe_code)]

//! Shared security helpers: the not-root guard for the binaries and the
//! origin host allowlist used by the relay.

use anyhow::{Result, bail};
use nix::unistd::Uid;
use url::Url;

/// Fails fast when a binary is started as root. The relay fetches arbitrary
/// remote URLs, so it should never hold more privileges than a regular user.
pub fn ensure_not_root(process: &str) -> Result<()> {
    ensure_not_root_for(Uid::current(), process)
}

fn ensure_not_root_for(uid: Uid, process: &str) -> Result<()> {
    if uid.is_root() {
        bail!(
            "{process} must not be run as root; use a regular user or a dedicated service account"
        );
    }
    Ok(())
}

/// Set of origin hosts the relay may fetch from.
///
/// An empty policy allows every host. A configured entry matches the host
/// itself and any of its subdomains, so `googlevideo.com` covers
/// `rr3---sn-abc.googlevideo.com`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostPolicy {
    allowed: Vec<String>,
}

impl HostPolicy {
    pub fn allow_all() -> Self {
        Self::default()
    }

    pub fn new<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut allowed: Vec<String> = hosts
            .into_iter()
            .map(|host| host.as_ref().trim().trim_matches('.').to_ascii_lowercase())
            .filter(|host| !host.is_empty())
            .collect();
        allowed.sort();
        allowed.dedup();
        Self { allowed }
    }

    pub fn is_restricted(&self) -> bool {
        !self.allowed.is_empty()
    }

    pub fn hosts(&self) -> &[String] {
        &self.allowed
    }

    pub fn allows(&self, url: &Url) -> bool {
        if self.allowed.is_empty() {
            return true;
        }
        let Some(host) = url.host_str() else {
            return false;
        };
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        self.allowed.iter().any(|entry| {
            host == *entry
                || host
                    .strip_suffix(entry.as_str())
                    .is_some_and(|prefix| prefix.ends_with('.'))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(value: &str) -> Url {
        Url::parse(value).unwrap()
    }

    #[test]
    fn ensure_not_root_allows_unprivileged_uid() {
        let uid = Uid::from_raw(1000);
        assert!(ensure_not_root_for(uid, "tester").is_ok());
    }

    #[test]
    fn ensure_not_root_rejects_root_uid() {
        let uid = Uid::from_raw(0);
        let err = ensure_not_root_for(uid, "tester").unwrap_err();
        assert!(err.to_string().contains("must not be run as root"));
    }

    #[test]
    fn empty_policy_allows_everything() {
        let policy = HostPolicy::allow_all();
        assert!(!policy.is_restricted());
        assert!(policy.allows(&url("https://example.org/video.mp4")));
        assert!(policy.allows(&url("http://10.0.0.1:9000/a")));
    }

    #[test]
    fn policy_matches_host_and_subdomains() {
        let policy = HostPolicy::new(["GoogleVideo.com", " cdn.example.net "]);
        assert!(policy.allows(&url("https://googlevideo.com/x")));
        assert!(policy.allows(&url("https://rr3---sn-abc.googlevideo.com/videoplayback")));
        assert!(policy.allows(&url("https://cdn.example.net/file")));
        assert!(!policy.allows(&url("https://example.net/file")));
        assert!(!policy.allows(&url("https://evilgooglevideo.com/x")));
        assert!(!policy.allows(&url("https://googlevideo.com.evil.org/x")));
    }

    #[test]
    fn policy_normalizes_and_dedups_entries() {
        let policy = HostPolicy::new(["a.com", ".A.com.", "", "b.com"]);
        assert_eq!(policy.hosts(), ["a.com".to_string(), "b.com".to_string()]);
    }
}
