//! TTL response cache with a selective caching policy.
//!
//! ## Architecture
//!
//! ```text
//! Surface Request → ResponseCache.lookup() → hit (age ≤ TTL) → cached response
//!                          ↓ miss
//!                   Domain Handler → ResponseCache.store() → is_cacheable()?
//! ```
//!
//! Expiry is lazy: stale entries are ignored on lookup and only removed by
//! [`ResponseCache::purge_expired`] or the background sweeper.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use hyper::body::Bytes;
use hyper::header::{HeaderMap, CACHE_CONTROL, CONTENT_LENGTH};
use hyper::{Method, StatusCode};
use parking_lot::RwLock;

use crate::clock::{Clock, SystemClock};
use crate::domains::DomainClass;
use crate::message::{ProxyResponse, RequestContext};

/// Default time-to-live for cached responses.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(60 * 60);

/// Largest body the cache will hold.
pub const MAX_CACHEABLE_BODY: usize = 5 * 1024 * 1024;

/// Default interval of the background sweeper.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Schemes that must never be cached.
const UNCACHEABLE_SCHEMES: &[&str] = &[
    "chrome-extension",
    "moz-extension",
    "chrome",
    "chrome-search",
    "devtools",
    "about",
    "data",
    "blob",
];

/// URL markers of API and authentication traffic.
const PRIVATE_URL_MARKERS: &[&str] = &["/api/", "oauth", "auth", "login"];

/// Video-site API path marker.
const VIDEO_API_MARKER: &str = "/youtubei/";

/// Static asset suffixes the gated site may have cached.
const STATIC_ASSET_SUFFIXES: &[&str] = &[".js", ".css", ".png", ".jpg", ".svg"];

/// A stored response snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    /// Normalized request identity.
    pub key: String,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub stored_at: DateTime<Utc>,
}

impl CacheEntry {
    /// Rebuilds a response from the snapshot.
    pub fn to_response(&self) -> ProxyResponse {
        ProxyResponse::new(self.status, self.headers.clone(), self.body.clone())
    }
}

/// Decides whether a response may be stored.
pub fn is_cacheable(
    request: &RequestContext,
    class: DomainClass,
    response: &ProxyResponse,
    max_body: usize,
) -> bool {
    if request.method() != Method::GET || !response.is_success() {
        return false;
    }

    let url = request.url();
    if UNCACHEABLE_SCHEMES.contains(&url.scheme()) || !matches!(url.scheme(), "http" | "https") {
        return false;
    }

    let lowered = url.as_str().to_ascii_lowercase();
    if PRIVATE_URL_MARKERS.iter().any(|m| lowered.contains(m)) {
        return false;
    }

    if let Some(cc) = response.header_str(CACHE_CONTROL.as_str()) {
        let cc = cc.to_ascii_lowercase();
        if cc.contains("no-store") || cc.contains("no-cache") {
            return false;
        }
    }

    let declared = response
        .header_str(CONTENT_LENGTH.as_str())
        .and_then(|v| v.trim().parse::<usize>().ok());
    if declared.is_some_and(|len| len > max_body) || response.body.len() > max_body {
        return false;
    }

    match class {
        DomainClass::General => true,
        DomainClass::VideoSite => !lowered.contains(VIDEO_API_MARKER),
        DomainClass::GatedSocialSite => {
            let path = url.path().to_ascii_lowercase();
            let bare_root = path == "/" && url.query().is_none();
            bare_root
                || path.contains("/static/")
                || STATIC_ASSET_SUFFIXES.iter().any(|s| path.ends_with(s))
        }
    }
}

/// In-memory response cache with lazy TTL expiry.
#[derive(Clone)]
pub struct ResponseCache {
    entries: Arc<RwLock<HashMap<String, CacheEntry>>>,
    ttl: Duration,
    max_body: usize,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for ResponseCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseCache")
            .field("entries", &self.entries.read().len())
            .field("ttl", &self.ttl)
            .field("max_body", &self.max_body)
            .finish()
    }
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_TTL)
    }
}

impl ResponseCache {
    /// Creates a cache with the given TTL and the system clock.
    pub fn new(ttl: Duration) -> Self {
        Self::with_clock(ttl, Arc::new(SystemClock))
    }

    /// Creates a cache with a custom clock.
    pub fn with_clock(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            ttl,
            max_body: MAX_CACHEABLE_BODY,
            clock,
        }
    }

    /// Sets the body size ceiling.
    pub fn with_max_body(mut self, max_body: usize) -> Self {
        self.max_body = max_body;
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn is_fresh(&self, entry: &CacheEntry, now: DateTime<Utc>) -> bool {
        // A TTL too large for chrono never expires.
        match chrono::Duration::from_std(self.ttl) {
            Ok(ttl) => now.signed_duration_since(entry.stored_at) <= ttl,
            Err(_) => true,
        }
    }

    /// Returns the entry for a request unless it is absent or expired.
    pub fn lookup(&self, request: &RequestContext) -> Option<CacheEntry> {
        let key = request.cache_key();
        let entries = self.entries.read();
        let entry = entries.get(&key)?;

        if self.is_fresh(entry, self.clock.now()) {
            Some(entry.clone())
        } else {
            tracing::debug!("Cache entry expired for {}", key);
            None
        }
    }

    /// Stores a response if the caching policy allows it.
    ///
    /// Returns true if the response was stored.
    pub fn store(
        &self,
        request: &RequestContext,
        class: DomainClass,
        response: &ProxyResponse,
    ) -> bool {
        if !is_cacheable(request, class, response, self.max_body) {
            return false;
        }

        let entry = CacheEntry {
            key: request.cache_key(),
            status: response.status,
            headers: response.headers.clone(),
            body: response.body.clone(),
            stored_at: self.clock.now(),
        };

        tracing::debug!("Cached response for {}", entry.key);
        self.entries.write().insert(entry.key.clone(), entry);
        true
    }

    /// Removes expired entries and returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| self.is_fresh(entry, now));
        before - entries.len()
    }

    /// Number of stored entries, including not yet purged expired ones.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Drops every entry.
    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// Creates a background sweeping task.
    ///
    /// Returns a future that should be spawned as a background task.
    pub fn start_sweeping(self, interval: Duration) -> impl std::future::Future<Output = ()> + Send {
        let cache = self;
        async move {
            loop {
                tokio::time::sleep(interval).await;
                let purged = cache.purge_expired();
                if purged > 0 {
                    tracing::debug!("Purged {} expired cache entries", purged);
                }
            }
        }
    }
}
