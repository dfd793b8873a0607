//! Time-limited cache of backend API specs
//!
//! Specs are keyed by backend address. A missing or expired entry triggers a
//! synchronous fetch from the backend's self-description endpoint; failed
//! fetches are never cached.

use crate::clock::{Clock, SystemClock};
use crate::validator::ApiSpec;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Default time-to-live for cached specs
pub const DEFAULT_SPEC_TTL: Duration = Duration::from_secs(600);

/// The backend's spec could not be obtained
#[derive(Debug, thiserror::Error)]
pub enum SpecError {
    #[error("Error fetching spec from {url}: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("Spec endpoint {url} returned status {status}")]
    Status { url: String, status: u16 },
    #[error("Spec from {url} is not valid JSON: {source}")]
    InvalidBody {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Retrieves a spec document from a backend
pub trait SpecFetcher: Send + Sync {
    fn fetch<'a>(&'a self, host: &'a str, port: u16) -> BoxFuture<'a, Result<ApiSpec, SpecError>>;
}

/// Fetches specs over HTTP with a bounded timeout
pub struct HttpSpecFetcher {
    client: reqwest::Client,
    spec_path: String,
}

impl HttpSpecFetcher {
    pub fn new(spec_path: impl Into<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "Failed to build spec client with timeout, using defaults");
                reqwest::Client::new()
            });

        Self {
            client,
            spec_path: spec_path.into(),
        }
    }
}

impl SpecFetcher for HttpSpecFetcher {
    fn fetch<'a>(&'a self, host: &'a str, port: u16) -> BoxFuture<'a, Result<ApiSpec, SpecError>> {
        let url = format!("http://{}:{}{}", host, port, self.spec_path);

        async move {
            debug!(%url, "Fetching backend spec");

            let response = self
                .client
                .get(&url)
                .send()
                .await
                .map_err(|source| SpecError::Request {
                    url: url.clone(),
                    source,
                })?;

            let status = response.status();
            if !status.is_success() {
                return Err(SpecError::Status {
                    url,
                    status: status.as_u16(),
                });
            }

            let body = response.bytes().await.map_err(|source| SpecError::Request {
                url: url.clone(),
                source,
            })?;

            ApiSpec::from_slice(&body).map_err(|source| SpecError::InvalidBody { url, source })
        }
        .boxed()
    }
}

/// A cached spec and when it was fetched
#[derive(Debug, Clone)]
pub struct CachedSpec {
    pub spec: Arc<ApiSpec>,
    pub fetched_at: Instant,
}

impl CachedSpec {
    /// An entry at least `ttl` old must be refreshed before use
    pub fn is_stale(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.fetched_at) >= ttl
    }
}

type CacheKey = (String, u16);

/// Shared spec cache, safe for concurrent use
pub struct SpecCache {
    entries: DashMap<CacheKey, CachedSpec>,
    fetcher: Arc<dyn SpecFetcher>,
    clock: Arc<dyn Clock>,
    default_ttl: Duration,
}

impl SpecCache {
    pub fn new(fetcher: Arc<dyn SpecFetcher>, clock: Arc<dyn Clock>, default_ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            fetcher,
            clock,
            default_ttl,
        }
    }

    /// HTTP fetcher and the system clock
    pub fn http(spec_path: &str, fetch_timeout: Duration, default_ttl: Duration) -> Self {
        Self::new(
            Arc::new(HttpSpecFetcher::new(spec_path, fetch_timeout)),
            Arc::new(SystemClock),
            default_ttl,
        )
    }

    /// Get the spec for a backend using the default TTL
    pub async fn get_spec(&self, host: &str, port: u16) -> Result<Arc<ApiSpec>, SpecError> {
        self.get_spec_with_ttl(host, port, self.default_ttl).await
    }

    pub async fn get_spec_with_ttl(
        &self,
        host: &str,
        port: u16,
        ttl: Duration,
    ) -> Result<Arc<ApiSpec>, SpecError> {
        let key = (host.to_string(), port);
        let now = self.clock.now();

        // Clone out of the map so no shard lock is held across the fetch
        let cached = self.entries.get(&key).map(|entry| entry.clone());
        if let Some(entry) = cached {
            if !entry.is_stale(now, ttl) {
                return Ok(entry.spec);
            }
            debug!(host, port, "Cached spec expired");
        }

        let spec = Arc::new(self.fetcher.fetch(host, port).await?);
        self.entries.insert(
            key,
            CachedSpec {
                spec: Arc::clone(&spec),
                fetched_at: now,
            },
        );
        debug!(host, port, "Cached backend spec");

        Ok(spec)
    }

    /// Drop the entry for a backend, if any
    pub fn invalidate(&self, host: &str, port: u16) -> bool {
        self.entries.remove(&(host.to_string(), port)).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
