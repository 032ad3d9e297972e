//! Host family keys and per-host policy.
//!
//! A [`DomainKey`] names a family of hosts that serve the same site, for
//! example every `jpg.*` mirror maps to `sharex`. It is the routing key for
//! worker pools and a component of the history primary key.

use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

/// Domain recorded for items whose site was not identified.
pub const UNKNOWN_DOMAIN: &str = "no_crawler";

/// Upper bound on workers for any single host.
pub const MAX_WORKERS_PER_HOST: usize = 5;

/// Worker cap for hosts that drop connections under parallel load.
pub const FRAGILE_HOST_MAX_WORKERS: usize = 2;

const FRAGILE_HOSTS: &[&str] = &["bunkrr", "pixeldrain", "anonfiles"];

const SHAREX_HOSTS: &[&str] = &[
    "jpg.fish",
    "jpg.church",
    "jpg.homes",
    "jpg.fishing",
    "jpg.pet",
    "jpeg.pet",
    "jpg1.su",
    "jpg2.su",
    "jpg3.su",
];

/// Normalized host family key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct DomainKey(String);

impl DomainKey {
    /// Canonicalizes a raw domain name or host into its family key.
    ///
    /// ```
    /// use mediafetch_core::DomainKey;
    ///
    /// assert_eq!(DomainKey::new("jpg.church").as_str(), "sharex");
    /// assert_eq!(DomainKey::new("bunkr").as_str(), "bunkrr");
    /// assert_eq!(DomainKey::new("Cyberdrop").as_str(), "cyberdrop");
    /// ```
    #[must_use]
    pub fn new(raw: &str) -> Self {
        Self(canonicalize(raw))
    }

    /// Derives the key from a URL's host.
    ///
    /// ```
    /// use mediafetch_core::DomainKey;
    ///
    /// assert_eq!(DomainKey::from_url_str("https://c3.kemono.su/data/a.png").as_str(), "kemono");
    /// assert_eq!(DomainKey::from_url_str("https://media-files9.bunkr.la/x.mp4").as_str(), "bunkrr");
    /// assert_eq!(DomainKey::from_url_str("not a url").as_str(), "no_crawler");
    /// ```
    #[must_use]
    pub fn from_url_str(url: &str) -> Self {
        Url::parse(url).map_or_else(|_| Self::unknown(), |url| Self::from_url(&url))
    }

    #[must_use]
    pub fn from_url(url: &Url) -> Self {
        match url.host_str() {
            Some(host) => Self(family_of_host(&host.to_ascii_lowercase())),
            None => Self::unknown(),
        }
    }

    #[must_use]
    pub fn unknown() -> Self {
        Self(UNKNOWN_DOMAIN.to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn is_unknown(&self) -> bool {
        self.0 == UNKNOWN_DOMAIN
    }

    /// Worker count for this host given the configured per-host value.
    #[must_use]
    pub fn workers_for_host(&self, configured: usize) -> usize {
        let configured = configured.clamp(1, MAX_WORKERS_PER_HOST);
        if FRAGILE_HOSTS.contains(&self.as_str()) {
            configured.min(FRAGILE_HOST_MAX_WORKERS)
        } else {
            configured
        }
    }

    /// Minimum delay between download requests to this host.
    #[must_use]
    pub fn download_delay(&self, default_delay: Duration) -> Duration {
        match self.as_str() {
            "anonfiles" | "cyberfile" => Duration::from_secs(1),
            "coomer" | "kemono" => Duration::from_millis(200),
            _ => default_delay,
        }
    }

    /// Canonical `url_path` used as the history key for `url`.
    ///
    /// e-hentai image URLs carry a rotating `keystamp` segment that is dropped,
    /// and mediafire links are keyed by their final segment only.
    #[must_use]
    pub fn url_path(&self, url: &Url) -> String {
        let path = url.path();
        if self.0.contains("e-hentai") {
            if let Some(index) = path.find("keystamp") {
                let head = &path[..index];
                let mut chars = head.chars();
                chars.next_back();
                return chars.as_str().to_string();
            }
            return path.to_string();
        }
        if self.0.contains("mediafire") {
            return path
                .trim_end_matches('/')
                .rsplit('/')
                .next()
                .unwrap_or_default()
                .to_string();
        }
        path.to_string()
    }
}

impl fmt::Display for DomainKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for DomainKey {
    fn from(value: String) -> Self {
        Self::new(&value)
    }
}

impl From<DomainKey> for String {
    fn from(value: DomainKey) -> Self {
        value.0
    }
}

/// True for CDN hosts whose 4xx responses are transient and worth retrying.
#[must_use]
pub fn is_retry_whitelisted_cdn(host: &str) -> bool {
    let host = host.to_ascii_lowercase();
    host.starts_with("media-files") && host.contains("bunkr")
}

fn canonicalize(raw: &str) -> String {
    let lowered = raw.trim().to_ascii_lowercase();
    if lowered.is_empty() {
        return UNKNOWN_DOMAIN.to_string();
    }
    if lowered.contains('.') {
        return family_of_host(&lowered);
    }
    match lowered.as_str() {
        "bunkr" => "bunkrr".to_string(),
        "jpg" | "jpgchurch" => "sharex".to_string(),
        _ => lowered,
    }
}

fn family_of_host(host: &str) -> String {
    let host = host.strip_prefix("www.").unwrap_or(host);
    if host.parse::<IpAddr>().is_ok() || !host.contains('.') {
        return host.to_string();
    }
    if SHAREX_HOSTS.iter().any(|known| host == *known || host.ends_with(&format!(".{known}"))) {
        return "sharex".to_string();
    }
    if host.split('.').any(|label| label.starts_with("bunkr")) {
        return "bunkrr".to_string();
    }
    let labels: Vec<&str> = host.split('.').collect();
    let family = labels[labels.len() - 2];
    family.to_string()
}
