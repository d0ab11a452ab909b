//! Public signing-key fetching and caching.
//!
//! The identity provider rotates its token-signing keys; their public
//! halves are published as a JSON map of key ID to PEM-encoded public
//! key. This module fetches that map and caches it, deriving the cache
//! lifetime from the endpoint's `Cache-Control: max-age` header.
//!
//! # Concurrency
//!
//! The cached set is an [`Arc`] snapshot that is only replaced after a
//! response has been fully fetched and parsed, so concurrent readers
//! observe either the prior set or the new one, never a partial
//! update. Refreshes are single-flight: callers that find the cache
//! expired (or their key ID missing) while another refresh is in
//! progress wait for it and adopt its outcome, success or failure,
//! rather than issuing a duplicate fetch.
//!
//! # Failure policy
//!
//! A failed refresh falls back to the last good set for a bounded
//! grace window past its expiry (`stale_if_error`); beyond that the
//! cache fails closed and the fetch error propagates.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use jsonwebtoken::DecodingKey;
use tokio::sync::{Mutex, RwLock};
use url::Url;

/// Configuration for the signing-key cache.
#[derive(Debug, Clone)]
pub struct SigningKeyCacheConfig {
    /// TTL used when the endpoint sends no Cache-Control header
    /// (default: 1 hour).
    pub default_ttl: Duration,

    /// Maximum TTL regardless of Cache-Control (default: 24 hours).
    pub max_ttl: Duration,

    /// Minimum TTL regardless of Cache-Control (default: 1 minute).
    pub min_ttl: Duration,

    /// How long past expiry the last good set may still be served when
    /// a refresh fails (default: 1 hour).
    pub stale_if_error: Duration,

    /// HTTP request timeout (default: 10 seconds).
    pub request_timeout: Duration,

    /// Maximum response size in bytes (default: 256 KiB).
    pub max_response_size: usize,

    /// Whether to allow HTTP (non-HTTPS) key-set URLs.
    /// This should only be enabled for testing.
    pub allow_http: bool,
}

impl Default for SigningKeyCacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(3600),
            max_ttl: Duration::from_secs(86400),
            min_ttl: Duration::from_secs(60),
            stale_if_error: Duration::from_secs(3600),
            request_timeout: Duration::from_secs(10),
            max_response_size: 256 * 1024,
            allow_http: false,
        }
    }
}

impl SigningKeyCacheConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the default TTL (used when Cache-Control is absent).
    #[must_use]
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Sets the maximum TTL.
    #[must_use]
    pub fn with_max_ttl(mut self, ttl: Duration) -> Self {
        self.max_ttl = ttl;
        self
    }

    /// Sets the minimum TTL.
    #[must_use]
    pub fn with_min_ttl(mut self, ttl: Duration) -> Self {
        self.min_ttl = ttl;
        self
    }

    /// Sets the stale-if-error grace window.
    #[must_use]
    pub fn with_stale_if_error(mut self, window: Duration) -> Self {
        self.stale_if_error = window;
        self
    }

    /// Sets the HTTP request timeout.
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the maximum response size.
    #[must_use]
    pub fn with_max_response_size(mut self, size: usize) -> Self {
        self.max_response_size = size;
        self
    }

    /// Allows HTTP (non-HTTPS) key-set URLs.
    ///
    /// # Warning
    ///
    /// This should only be used for testing. In production, key-set
    /// endpoints should always use HTTPS.
    #[must_use]
    pub fn with_allow_http(mut self, allow: bool) -> Self {
        self.allow_http = allow;
        self
    }
}

/// Errors that can occur while fetching or looking up signing keys.
#[derive(Debug, Clone, thiserror::Error)]
pub enum KeysError {
    /// A network error occurred while fetching the key set.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// The HTTP request returned a non-success status code.
    #[error("HTTP error: status {0}")]
    HttpError(u16),

    /// The key-set response could not be parsed.
    #[error("Failed to parse key set: {0}")]
    ParseError(String),

    /// A PEM value in the key set is not a usable public key.
    #[error("Invalid public key for kid {kid}: {message}")]
    InvalidKey {
        /// The key ID whose PEM value could not be parsed.
        kid: String,
        /// Description of the parse failure.
        message: String,
    },

    /// The requested key ID was not found, even after a refresh.
    #[error("Key not found: {0}")]
    KeyNotFound(String),

    /// The key-set URL scheme is not allowed (must be HTTPS in production).
    #[error("Invalid URL scheme: only HTTPS is allowed")]
    InvalidScheme,

    /// The response exceeded the maximum allowed size.
    #[error("Response exceeds maximum size of {max_size} bytes")]
    ResponseTooLarge {
        /// The maximum allowed size.
        max_size: usize,
    },
}

/// An immutable snapshot of the provider's public key set.
#[derive(Debug)]
struct CachedKeySet {
    /// Decoded public keys by key ID.
    keys: HashMap<String, DecodingKey>,
    /// When the cached set stops being fresh.
    expires_at: Instant,
}

impl CachedKeySet {
    fn is_fresh(&self) -> bool {
        Instant::now() < self.expires_at
    }

    fn is_within_grace(&self, grace: Duration) -> bool {
        Instant::now() < self.expires_at + grace
    }
}

/// Fetches and caches the identity provider's public signing keys.
///
/// Construct one per SDK instance (the cache is not process-global) so
/// tests stay hermetic.
///
/// # Example
///
/// ```ignore
/// use identikit_auth::keys::{SigningKeyCache, SigningKeyCacheConfig};
/// use url::Url;
///
/// let url = Url::parse("https://keys.identikit.dev/v1/idTokenKeys")?;
/// let cache = SigningKeyCache::new(url, SigningKeyCacheConfig::default());
///
/// let key = cache.get_key("key-1").await?;
/// ```
pub struct SigningKeyCache {
    /// HTTP client for fetching the key set.
    http_client: reqwest::Client,
    /// The key-set endpoint.
    url: Url,
    /// Configuration.
    config: SigningKeyCacheConfig,
    /// Current snapshot, replaced atomically after a full fetch.
    current: RwLock<Option<Arc<CachedKeySet>>>,
    /// Serializes refreshes; waiters adopt the winner's outcome.
    refresh_lock: Mutex<()>,
    /// Bumped after every completed refresh attempt.
    generation: AtomicU64,
    /// Outcome of the most recent refresh attempt, if it failed.
    last_error: RwLock<Option<Arc<KeysError>>>,
}

impl SigningKeyCache {
    /// Creates a new signing-key cache for the given endpoint.
    ///
    /// # Panics
    ///
    /// Panics if the HTTP client cannot be created (should not happen
    /// in practice).
    #[must_use]
    pub fn new(url: Url, config: SigningKeyCacheConfig) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .expect("Failed to create HTTP client");

        Self {
            http_client,
            url,
            config,
            current: RwLock::new(None),
            refresh_lock: Mutex::new(()),
            generation: AtomicU64::new(0),
            last_error: RwLock::new(None),
        }
    }

    /// Returns the key-set endpoint.
    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Gets the public key for the given key ID.
    ///
    /// Serves from the cached set when it is fresh; on expiry or when
    /// the key ID is unknown (key rotation), performs one refresh. If
    /// the refresh fails but the last good set is still within its
    /// stale-if-error grace window, the lookup proceeds against it.
    ///
    /// # Errors
    ///
    /// Returns an error if the key set cannot be fetched and no usable
    /// cached set remains, or if the key ID is absent after a refresh.
    pub async fn get_key(&self, kid: &str) -> Result<DecodingKey, KeysError> {
        if let Some(set) = self.fresh_snapshot().await {
            if let Some(key) = set.keys.get(kid) {
                tracing::trace!(url = %self.url, kid, "Signing-key cache hit");
                return Ok(key.clone());
            }
            tracing::debug!(url = %self.url, kid, "Key ID not in cached set, refreshing");
        }

        let observed = self.generation.load(Ordering::SeqCst);
        match self.refresh_shared(observed).await {
            Ok(set) => set
                .keys
                .get(kid)
                .cloned()
                .ok_or_else(|| KeysError::KeyNotFound(kid.to_string())),
            Err(err) => {
                if let Some(set) = self.snapshot().await
                    && set.is_within_grace(self.config.stale_if_error)
                    && let Some(key) = set.keys.get(kid)
                {
                    tracing::warn!(
                        url = %self.url,
                        kid,
                        error = %err,
                        "Key-set refresh failed, serving last good set"
                    );
                    return Ok(key.clone());
                }
                Err(err)
            }
        }
    }

    /// Drops the cached set, forcing the next lookup to fetch.
    pub async fn invalidate(&self) {
        let mut current = self.current.write().await;
        *current = None;
        tracing::debug!(url = %self.url, "Signing-key cache invalidated");
    }

    /// Returns the key IDs currently cached, if any.
    pub async fn cached_key_ids(&self) -> Vec<String> {
        match self.snapshot().await {
            Some(set) => set.keys.keys().cloned().collect(),
            None => Vec::new(),
        }
    }

    async fn snapshot(&self) -> Option<Arc<CachedKeySet>> {
        self.current.read().await.clone()
    }

    async fn fresh_snapshot(&self) -> Option<Arc<CachedKeySet>> {
        self.snapshot().await.filter(|set| set.is_fresh())
    }

    /// Refreshes the cache, collapsing concurrent callers onto one
    /// fetch. `observed` is the generation the caller saw before
    /// deciding to refresh; if it advanced while waiting for the lock,
    /// another refresh already completed and its outcome is adopted.
    async fn refresh_shared(&self, observed: u64) -> Result<Arc<CachedKeySet>, KeysError> {
        let _guard = self.refresh_lock.lock().await;

        if self.generation.load(Ordering::SeqCst) != observed {
            if let Some(err) = self.last_error.read().await.clone() {
                return Err((*err).clone());
            }
            if let Some(set) = self.fresh_snapshot().await {
                return Ok(set);
            }
        }

        match self.fetch().await {
            Ok(set) => {
                let set = Arc::new(set);
                *self.current.write().await = Some(Arc::clone(&set));
                *self.last_error.write().await = None;
                self.generation.fetch_add(1, Ordering::SeqCst);
                Ok(set)
            }
            Err(err) => {
                *self.last_error.write().await = Some(Arc::new(err.clone()));
                self.generation.fetch_add(1, Ordering::SeqCst);
                Err(err)
            }
        }
    }

    /// Fetches the key set from the endpoint and parses every entry.
    async fn fetch(&self) -> Result<CachedKeySet, KeysError> {
        self.validate_scheme()?;

        tracing::debug!(url = %self.url, "Fetching signing-key set");

        let response = self
            .http_client
            .get(self.url.as_str())
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| {
                tracing::warn!(url = %self.url, error = %e, "Failed to fetch key set");
                KeysError::NetworkError(e.to_string())
            })?;

        if !response.status().is_success() {
            return Err(KeysError::HttpError(response.status().as_u16()));
        }

        if let Some(len) = response.content_length()
            && len as usize > self.config.max_response_size
        {
            return Err(KeysError::ResponseTooLarge {
                max_size: self.config.max_response_size,
            });
        }

        let ttl = self.parse_cache_control(response.headers());

        let pem_map: HashMap<String, String> = response.json().await.map_err(|e| {
            tracing::warn!(url = %self.url, error = %e, "Failed to parse key set");
            KeysError::ParseError(e.to_string())
        })?;

        if pem_map.is_empty() {
            return Err(KeysError::ParseError("key set is empty".to_string()));
        }

        let mut keys = HashMap::with_capacity(pem_map.len());
        for (kid, pem) in pem_map {
            let key =
                DecodingKey::from_rsa_pem(pem.as_bytes()).map_err(|e| KeysError::InvalidKey {
                    kid: kid.clone(),
                    message: e.to_string(),
                })?;
            keys.insert(kid, key);
        }

        tracing::debug!(
            url = %self.url,
            key_count = keys.len(),
            ttl_secs = ttl.as_secs(),
            "Cached signing-key set"
        );

        Ok(CachedKeySet {
            keys,
            expires_at: Instant::now() + ttl,
        })
    }

    fn validate_scheme(&self) -> Result<(), KeysError> {
        let scheme = self.url.scheme();

        if scheme == "https" {
            return Ok(());
        }

        if scheme == "http" && self.config.allow_http {
            return Ok(());
        }

        Err(KeysError::InvalidScheme)
    }

    /// Parses Cache-Control to determine the TTL.
    ///
    /// Extracts the `max-age` directive and clamps it between
    /// `min_ttl` and `max_ttl`. Falls back to `default_ttl` when no
    /// directive is present.
    fn parse_cache_control(&self, headers: &reqwest::header::HeaderMap) -> Duration {
        let ttl = headers
            .get(reqwest::header::CACHE_CONTROL)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| {
                v.split(',').find_map(|directive| {
                    directive
                        .trim()
                        .strip_prefix("max-age=")
                        .and_then(|age| age.parse::<u64>().ok())
                })
            })
            .map(Duration::from_secs)
            .unwrap_or(self.config.default_ttl);

        ttl.min(self.config.max_ttl).max(self.config.min_ttl)
    }
}

impl std::fmt::Debug for SigningKeyCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKeyCache")
            .field("url", &self.url.as_str())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = SigningKeyCacheConfig::default();
        assert_eq!(config.default_ttl, Duration::from_secs(3600));
        assert_eq!(config.max_ttl, Duration::from_secs(86400));
        assert_eq!(config.min_ttl, Duration::from_secs(60));
        assert_eq!(config.stale_if_error, Duration::from_secs(3600));
        assert_eq!(config.request_timeout, Duration::from_secs(10));
        assert_eq!(config.max_response_size, 256 * 1024);
        assert!(!config.allow_http);
    }

    #[test]
    fn test_config_builder() {
        let config = SigningKeyCacheConfig::new()
            .with_default_ttl(Duration::from_secs(1800))
            .with_max_ttl(Duration::from_secs(7200))
            .with_min_ttl(Duration::from_secs(30))
            .with_stale_if_error(Duration::from_secs(600))
            .with_request_timeout(Duration::from_secs(5))
            .with_max_response_size(64 * 1024)
            .with_allow_http(true);

        assert_eq!(config.default_ttl, Duration::from_secs(1800));
        assert_eq!(config.max_ttl, Duration::from_secs(7200));
        assert_eq!(config.min_ttl, Duration::from_secs(30));
        assert_eq!(config.stale_if_error, Duration::from_secs(600));
        assert_eq!(config.request_timeout, Duration::from_secs(5));
        assert_eq!(config.max_response_size, 64 * 1024);
        assert!(config.allow_http);
    }

    #[test]
    fn test_https_required_by_default() {
        let cache = SigningKeyCache::new(
            Url::parse("http://keys.example.com/v1/keys").unwrap(),
            SigningKeyCacheConfig::default(),
        );
        assert!(matches!(
            cache.validate_scheme(),
            Err(KeysError::InvalidScheme)
        ));

        let cache = SigningKeyCache::new(
            Url::parse("https://keys.example.com/v1/keys").unwrap(),
            SigningKeyCacheConfig::default(),
        );
        assert!(cache.validate_scheme().is_ok());
    }

    #[test]
    fn test_http_allowed_when_configured() {
        let cache = SigningKeyCache::new(
            Url::parse("http://localhost:9099/v1/keys").unwrap(),
            SigningKeyCacheConfig::default().with_allow_http(true),
        );
        assert!(cache.validate_scheme().is_ok());
    }

    #[test]
    fn test_parse_cache_control_max_age() {
        let cache = SigningKeyCache::new(
            Url::parse("https://keys.example.com/v1/keys").unwrap(),
            SigningKeyCacheConfig::default(),
        );

        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::CACHE_CONTROL,
            "public, max-age=7200, must-revalidate".parse().unwrap(),
        );
        assert_eq!(cache.parse_cache_control(&headers), Duration::from_secs(7200));
    }

    #[test]
    fn test_parse_cache_control_missing_uses_default() {
        let cache = SigningKeyCache::new(
            Url::parse("https://keys.example.com/v1/keys").unwrap(),
            SigningKeyCacheConfig::default(),
        );

        let headers = reqwest::header::HeaderMap::new();
        assert_eq!(cache.parse_cache_control(&headers), Duration::from_secs(3600));
    }

    #[test]
    fn test_parse_cache_control_clamped() {
        let cache = SigningKeyCache::new(
            Url::parse("https://keys.example.com/v1/keys").unwrap(),
            SigningKeyCacheConfig::default(),
        );

        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::CACHE_CONTROL,
            "max-age=999999999".parse().unwrap(),
        );
        assert_eq!(cache.parse_cache_control(&headers), Duration::from_secs(86400));

        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(reqwest::header::CACHE_CONTROL, "max-age=1".parse().unwrap());
        assert_eq!(cache.parse_cache_control(&headers), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_invalidate_clears_snapshot() {
        let cache = SigningKeyCache::new(
            Url::parse("https://keys.example.com/v1/keys").unwrap(),
            SigningKeyCacheConfig::default(),
        );
        cache.invalidate().await;
        assert!(cache.cached_key_ids().await.is_empty());
    }
}
