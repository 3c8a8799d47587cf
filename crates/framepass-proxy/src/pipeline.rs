//! Request dispatcher.
//!
//! The [`Pipeline`] decides whether a request is touched at all, serves it
//! from cache when possible, routes it to the handler for its
//! [`DomainClass`], and stores eligible results. It also answers the
//! advisory control channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hyper::body::Bytes;
use hyper::header::HeaderMap;
use hyper::Method;
use serde::Serialize;
use url::Url;

use crate::auth::{AuthConfig, AuthSnapshot, TokenManager};
use crate::cache::{ResponseCache, DEFAULT_CACHE_TTL, DEFAULT_SWEEP_INTERVAL, MAX_CACHEABLE_BODY};
use crate::clock::{Clock, SystemClock};
use crate::control::{ControlMessage, ControlReply};
use crate::domains::{classify, is_fetchable_scheme, normalize_host, DomainClass, SurfaceMatcher};
use crate::error::Result;
use crate::handlers::{GatedSiteHandler, HandlerEnv, HandlerTable, Outcome};
use crate::message::{ProxyResponse, RequestContext};
use crate::upstream::{HttpUpstream, Upstream, DEFAULT_UPSTREAM_TIMEOUT};

/// Pipeline configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Cache entry lifetime.
    pub cache_ttl: Duration,
    /// Largest body the cache will hold.
    pub max_cacheable_body: usize,
    /// Whether responses are cached at all.
    pub cache_enabled: bool,
    /// How the embedding surface is recognized.
    pub surface: SurfaceMatcher,
    /// Token manager settings.
    pub auth: AuthConfig,
    /// Timeout for each upstream exchange.
    pub upstream_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            cache_ttl: DEFAULT_CACHE_TTL,
            max_cacheable_body: MAX_CACHEABLE_BODY,
            cache_enabled: true,
            surface: SurfaceMatcher::default(),
            auth: AuthConfig::default(),
            upstream_timeout: DEFAULT_UPSTREAM_TIMEOUT,
        }
    }
}

impl PipelineConfig {
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn with_max_cacheable_body(mut self, max: usize) -> Self {
        self.max_cacheable_body = max;
        self
    }

    pub fn with_cache_enabled(mut self, enabled: bool) -> Self {
        self.cache_enabled = enabled;
        self
    }

    pub fn with_surface(mut self, surface: SurfaceMatcher) -> Self {
        self.surface = surface;
        self
    }

    pub fn with_auth(mut self, auth: AuthConfig) -> Self {
        self.auth = auth;
        self
    }

    pub fn with_upstream_timeout(mut self, timeout: Duration) -> Self {
        self.upstream_timeout = timeout;
        self
    }
}

/// What to do with an intercepted request.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    /// Forward the original request untouched.
    PassThrough,
    /// Answer with this response.
    Respond(ProxyResponse),
}

/// Status summary for the control API. Never contains token values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PipelineStatus {
    pub cache_enabled: bool,
    pub cache_entries: usize,
    pub mobile_preference: bool,
    pub auth: AuthSnapshot,
}

/// The request/response rewrite pipeline.
#[derive(Debug, Clone)]
pub struct Pipeline {
    surface: SurfaceMatcher,
    cache: ResponseCache,
    cache_enabled: bool,
    handlers: HandlerTable,
    env: HandlerEnv,
    mobile_preference: Arc<AtomicBool>,
}

impl Pipeline {
    /// Creates a pipeline with a real HTTP client and the system clock.
    pub fn new(config: PipelineConfig) -> Result<Self> {
        let upstream = HttpUpstream::new(config.upstream_timeout)?;
        Ok(Self::with_upstream(config, Arc::new(upstream), Arc::new(SystemClock)))
    }

    /// Creates a pipeline with explicit collaborators.
    pub fn with_upstream(config: PipelineConfig, upstream: Arc<dyn Upstream>, clock: Arc<dyn Clock>) -> Self {
        let tokens = Arc::new(TokenManager::new(config.auth, upstream.clone()));
        let cache = ResponseCache::with_clock(config.cache_ttl, clock.clone())
            .with_max_body(config.max_cacheable_body);

        Self {
            surface: config.surface,
            cache,
            cache_enabled: config.cache_enabled,
            handlers: HandlerTable::default(),
            env: HandlerEnv {
                upstream,
                tokens,
                clock,
            },
            mobile_preference: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    pub fn tokens(&self) -> &Arc<TokenManager> {
        &self.env.tokens
    }

    /// Last mobile preference reported on the control channel.
    pub fn mobile_preference(&self) -> bool {
        self.mobile_preference.load(Ordering::Relaxed)
    }

    /// Cheap pre-check made before the request body is read.
    pub fn should_intercept(&self, url: &Url, headers: &HeaderMap) -> bool {
        is_fetchable_scheme(url) && self.surface.is_from_surface(url, headers)
    }

    /// Builds the request context for an intercepted request.
    pub fn context(&self, method: Method, url: Url, headers: HeaderMap, body: Bytes) -> RequestContext {
        let own_surface = self.should_intercept(&url, &headers);
        RequestContext::new(method, url, headers, body)
            .from_surface(own_surface)
            .with_mobile_default(self.mobile_preference())
    }

    /// Runs one request through the pipeline.
    pub async fn handle(&self, ctx: &RequestContext) -> Dispatch {
        if !ctx.initiator_is_own_surface() || !is_fetchable_scheme(ctx.url()) {
            return Dispatch::PassThrough;
        }

        let class = classify(&ctx.host());

        if self.cache_enabled {
            if let Some(entry) = self.cache.lookup(ctx) {
                tracing::debug!("Cache hit for {}", entry.key);
                return Dispatch::Respond(entry.to_response());
            }
        }

        tracing::debug!("{} {} handled as {}", ctx.method(), ctx.url(), class);
        let outcome = self.handlers.get(class).handle(ctx, &self.env).await;

        if let Outcome::Fetched(response) = &outcome {
            if self.cache_enabled {
                self.cache.store(ctx, class, response);
            }
        }

        Dispatch::Respond(outcome.into_response())
    }

    /// Handles a control-channel message.
    pub async fn on_control(&self, message: ControlMessage) -> Option<ControlReply> {
        self.mobile_preference
            .store(message.is_mobile(), Ordering::Relaxed);

        match message {
            ControlMessage::LoadingPage { url, is_mobile } => {
                tracing::info!("Surface is loading {} (mobile: {})", url, is_mobile);
                self.prepare_for(&url).await
            }
            ControlMessage::PageLoaded {
                url,
                success,
                error,
                is_mobile,
            } => {
                if success {
                    tracing::info!("Surface loaded {}", url);
                } else {
                    tracing::info!(
                        "Surface failed to load {}: {}",
                        url,
                        error.as_deref().unwrap_or("unknown error")
                    );
                }
                Some(ControlReply::PageLoadStatus {
                    success,
                    url,
                    error,
                    is_mobile,
                })
            }
        }
    }

    async fn prepare_for(&self, url: &str) -> Option<ControlReply> {
        let parsed = match Url::parse(url) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!("Ignoring loading-page for invalid URL {}: {}", url, e);
                return None;
            }
        };

        let host = normalize_host(parsed.host_str().unwrap_or_default());
        if classify(&host) != DomainClass::GatedSocialSite || !GatedSiteHandler::is_page_host(&host) {
            return None;
        }

        if self.env.tokens.guest_token().is_none() {
            self.env.tokens.refresh().await;
        }

        matches!(host.as_str(), "x.com" | "www.x.com").then(|| ControlReply::XHandlingInfo {
            message: "Using wrapper approach for x.com".to_string(),
        })
    }

    /// Current status for reporting.
    pub fn status(&self) -> PipelineStatus {
        PipelineStatus {
            cache_enabled: self.cache_enabled,
            cache_entries: self.cache.len(),
            mobile_preference: self.mobile_preference(),
            auth: self.env.tokens.snapshot(),
        }
    }

    /// Creates the background maintenance task.
    ///
    /// Returns a future that should be spawned as a background task.
    pub fn start_maintenance(&self) -> impl std::future::Future<Output = ()> + Send {
        self.cache.clone().start_sweeping(DEFAULT_SWEEP_INTERVAL)
    }
}
