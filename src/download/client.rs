//! Per-host HTTP client pool.
//!
//! One [`ClientPool`] owns a single reqwest [`Client`] (shared connection
//! pool, cookie jar, proxy and TLS settings) and lazily creates a
//! [`HostClient`] per [`DomainKey`]. Each host entry carries its own
//! [`RateLimiter`] and [`Throttle`], so pacing never crosses hosts.

use std::sync::Arc;

use dashmap::DashMap;
use reqwest::cookie::Jar;
use reqwest::header::{CONTENT_RANGE, CONTENT_TYPE, RANGE, REFERER, RETRY_AFTER, USER_AGENT};
use reqwest::{Client, Proxy, Response, StatusCode};
use tracing::{debug, instrument, warn};

use super::error::DownloadError;
use super::rate_limiter::{RateLimiter, Throttle, parse_retry_after};
use crate::config::EngineConfig;
use crate::domain::DomainKey;
use crate::media::MediaItem;

/// Window of the per-host token bucket.
const RATE_LIMIT_PERIOD: std::time::Duration = std::time::Duration::from_secs(1);

/// Shared download sessions, keyed by domain.
#[derive(Debug)]
pub struct ClientPool {
    client: Client,
    jar: Arc<Jar>,
    user_agent: String,
    rate_limit_per_s: u32,
    default_delay: std::time::Duration,
    hosts: DashMap<DomainKey, Arc<HostClient>>,
}

impl ClientPool {
    /// Builds the shared client from engine configuration.
    ///
    /// # Errors
    ///
    /// Returns the reqwest builder error, e.g. for an unparseable proxy URL.
    pub fn new(config: &EngineConfig) -> Result<Self, reqwest::Error> {
        let jar = Arc::new(Jar::default());
        let mut builder = Client::builder()
            .connect_timeout(config.connect_timeout())
            .read_timeout(config.read_timeout())
            .gzip(true)
            .user_agent(config.user_agent.clone())
            .cookie_provider(Arc::clone(&jar));
        if let Some(proxy) = config.proxy_url() {
            builder = builder.proxy(Proxy::all(proxy)?);
        }
        if config.allow_insecure_tls {
            warn!("TLS certificate verification disabled");
            builder = builder.danger_accept_invalid_certs(true);
        }

        Ok(Self {
            client: builder.build()?,
            jar,
            user_agent: config.user_agent.clone(),
            rate_limit_per_s: config.rate_limit_per_s,
            default_delay: config.download_delay(),
            hosts: DashMap::new(),
        })
    }

    /// Cookie jar shared by every session of this pool.
    #[must_use]
    pub fn cookie_jar(&self) -> Arc<Jar> {
        Arc::clone(&self.jar)
    }

    /// Returns the host entry for `domain`, creating it on first use.
    pub fn host(&self, domain: &DomainKey) -> Arc<HostClient> {
        if let Some(existing) = self.hosts.get(domain) {
            return Arc::clone(existing.value());
        }
        let entry = self.hosts.entry(domain.clone()).or_insert_with(|| {
            let delay = domain.download_delay(self.default_delay);
            debug!(%domain, delay_ms = delay.as_millis(), "creating host client");
            Arc::new(HostClient {
                client: self.client.clone(),
                user_agent: self.user_agent.clone(),
                limiter: RateLimiter::new(self.rate_limit_per_s, RATE_LIMIT_PERIOD),
                throttle: Throttle::new(domain.as_str(), delay),
            })
        });
        Arc::clone(entry.value())
    }

    /// Number of hosts seen so far.
    #[must_use]
    pub fn host_count(&self) -> usize {
        self.hosts.len()
    }
}

/// Download session for one domain.
#[derive(Debug)]
pub struct HostClient {
    client: Client,
    user_agent: String,
    limiter: RateLimiter,
    throttle: Throttle,
}

/// An open media response ready to be streamed into a `.part` file.
#[derive(Debug)]
pub struct MediaResponse {
    pub response: Response,
    /// True when the server honoured the requested range (HTTP 206).
    pub resumed: bool,
    /// Full size of the resource, when the server reported one.
    pub total_bytes: Option<u64>,
}

impl HostClient {
    #[must_use]
    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    #[must_use]
    pub fn throttle(&self) -> &Throttle {
        &self.throttle
    }

    /// Asks the server for the resource's full size with a one-byte range.
    ///
    /// Returns `None` when neither `Content-Range` nor `Content-Length`
    /// reveals the size. Paced by the host's limiter and throttle like
    /// [`HostClient::open_stream`].
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::UnexpectedContent`] for textual pages and
    /// other [`DownloadError`] variants for transport failures and error
    /// statuses.
    #[instrument(skip(self, item), fields(url = %item.source_url()))]
    pub async fn probe_size(&self, item: &MediaItem) -> Result<Option<u64>, DownloadError> {
        self.limiter.acquire().await;
        self.throttle.wait().await;
        let response = self.send(item, Some("bytes=0-0")).await?;
        reject_textual(&response, item)?;

        let total = match response.status() {
            StatusCode::PARTIAL_CONTENT => response
                .headers()
                .get(CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_content_range_total),
            _ => response.content_length(),
        };
        debug!(?total, "probed expected size");
        Ok(total)
    }

    /// Opens the media body, resuming at `offset` when it is non-zero.
    ///
    /// Applies the host's rate limiter and throttle before sending.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::UnexpectedContent`] when the host serves a
    /// textual page, and other [`DownloadError`] variants for transport
    /// failures and error statuses.
    #[instrument(skip(self, item), fields(url = %item.source_url()))]
    pub async fn open_stream(
        &self,
        item: &MediaItem,
        offset: u64,
    ) -> Result<MediaResponse, DownloadError> {
        self.limiter.acquire().await;
        self.throttle.wait().await;

        let range = (offset > 0).then(|| format!("bytes={offset}-"));
        let response = self.send(item, range.as_deref()).await?;
        reject_textual(&response, item)?;

        let resumed = offset > 0 && response.status() == StatusCode::PARTIAL_CONTENT;
        let total_bytes = if resumed {
            response
                .headers()
                .get(CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_content_range_total)
                .or_else(|| response.content_length().map(|len| offset + len))
        } else {
            response.content_length()
        };
        if offset > 0 && !resumed {
            debug!(offset, status = %response.status(), "server ignored range request");
        }

        Ok(MediaResponse {
            response,
            resumed,
            total_bytes,
        })
    }

    async fn send(&self, item: &MediaItem, range: Option<&str>) -> Result<Response, DownloadError> {
        let url = item.source_url().as_str();
        let mut request = self
            .client
            .get(item.source_url().clone())
            .header(USER_AGENT, &self.user_agent)
            .header(REFERER, item.referer().as_str());
        if let Some(range) = range {
            request = request.header(RANGE, range);
        }

        let response = request
            .send()
            .await
            .map_err(|e| DownloadError::network(url, e))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        if status == StatusCode::TOO_MANY_REQUESTS
            && let Some(delay) = retry_after.as_deref().and_then(parse_retry_after)
        {
            self.throttle.record_rate_limit(delay).await;
        }
        Err(DownloadError::http_status_with_retry_after(
            url,
            status.as_u16(),
            retry_after,
        ))
    }
}

/// Fails when the host answered with a textual page instead of media.
fn reject_textual(response: &Response, item: &MediaItem) -> Result<(), DownloadError> {
    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_ascii_lowercase();
    if content_type.contains("text") || content_type.contains("html") {
        return Err(DownloadError::UnexpectedContent {
            url: item.source_url().to_string(),
            content_type,
        });
    }
    Ok(())
}

/// Total size from a `Content-Range: bytes a-b/N` header.
fn parse_content_range_total(value: &str) -> Option<u64> {
    let (_, total) = value.trim().rsplit_once('/')?;
    total.trim().parse().ok()
}
