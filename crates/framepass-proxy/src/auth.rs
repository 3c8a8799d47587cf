//! Guest/CSRF token lifecycle for the gated social site.
//!
//! The [`TokenManager`] owns the process-wide [`AuthState`]. It is created
//! once and shared behind an `Arc`; nothing in the crate reaches it through a
//! global.
//!
//! Acquisition runs an ordered list of [`AcquisitionStep`]s and keeps the
//! first non-empty token. At most one acquisition is outstanding at a time:
//! callers that overlap an in-flight acquisition return immediately with
//! whatever token is current, which may still be empty.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use hyper::header::{HeaderMap, SET_COOKIE};
use hyper::StatusCode;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::message::{set_header, OutboundRequest, ProxyResponse};
use crate::policy::{MOBILE_USER_AGENT, NATIVE_APP_USER_AGENT};
use crate::upstream::Upstream;

/// Guest token activation endpoint.
pub const ACTIVATION_URL: &str = "https://api.twitter.com/1.1/guest/activate.json";

/// Pages scraped for an embedded guest token, in order.
pub const TOKEN_PAGE_URLS: &[&str] = &["https://x.com/", "https://twitter.com/"];

static GT_ASSIGNMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""gt=(\d+)""#).expect("Invalid regex pattern"));

static GUEST_TOKEN_LITERAL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)GUEST_TOKEN['"]\s*:\s*['"]([\w\d]+)['"]"#).expect("Invalid regex pattern")
});

static CSRF_COOKIE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"ct0=([^;]+)").expect("Invalid regex pattern"));

static GT_META: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)<meta\s+content="([^"]+)"\s+name="gt""#).expect("Invalid regex pattern")
});

static AUTHENTICITY_INPUT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)<input\s+type="hidden"\s+value="([^"]+)"\s+name="authenticity_token""#)
        .expect("Invalid regex pattern")
});

/// Token manager configuration.
#[derive(Clone)]
pub struct AuthConfig {
    /// Static bearer credential for the gated API. Activation is skipped
    /// without one.
    pub bearer_token: Option<String>,
    /// Guest token activation endpoint.
    pub activation_url: String,
    /// Pages scraped for an embedded guest token.
    pub page_urls: Vec<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            bearer_token: None,
            activation_url: ACTIVATION_URL.to_string(),
            page_urls: TOKEN_PAGE_URLS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl AuthConfig {
    /// Sets the bearer credential. Empty strings count as unset.
    pub fn with_bearer_token(mut self, token: Option<String>) -> Self {
        self.bearer_token = token.filter(|t| !t.trim().is_empty());
        self
    }

    /// Ordered acquisition steps for this configuration.
    pub fn plan(&self) -> Vec<AcquisitionStep> {
        let mut steps = Vec::with_capacity(2 + self.page_urls.len());
        if self.bearer_token.is_some() {
            steps.push(AcquisitionStep::Activate {
                user_agent: MOBILE_USER_AGENT,
            });
            steps.push(AcquisitionStep::Activate {
                user_agent: NATIVE_APP_USER_AGENT,
            });
        }
        steps.extend(
            self.page_urls
                .iter()
                .map(|url| AcquisitionStep::ScrapePage { url: url.clone() }),
        );
        steps
    }
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("bearer_token", &self.bearer_token.as_ref().map(|_| "<redacted>"))
            .field("activation_url", &self.activation_url)
            .field("page_urls", &self.page_urls)
            .finish()
    }
}

/// One way of obtaining a guest token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquisitionStep {
    /// POST the activation endpoint with the bearer credential.
    Activate { user_agent: &'static str },
    /// GET a page and look for an embedded token.
    ScrapePage { url: String },
}

#[derive(Debug, Deserialize)]
struct ActivationResponse {
    #[serde(default)]
    guest_token: Option<String>,
}

/// Current tokens. Replaced only by newer non-empty values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthState {
    pub guest_token: Option<String>,
    pub csrf_token: Option<String>,
}

/// Read-only view of the auth state that never exposes token values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AuthSnapshot {
    pub has_bearer_token: bool,
    pub has_guest_token: bool,
    pub has_csrf_token: bool,
    pub acquisition_in_flight: bool,
    pub acquisition_attempted: bool,
}

/// Resets the in-flight flag even if the acquiring future is dropped.
struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Owns the guest/CSRF tokens and their acquisition.
pub struct TokenManager {
    config: AuthConfig,
    upstream: Arc<dyn Upstream>,
    state: RwLock<AuthState>,
    in_flight: AtomicBool,
    attempted: AtomicBool,
}

impl std::fmt::Debug for TokenManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenManager")
            .field("config", &self.config)
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

impl TokenManager {
    /// Creates a manager with empty tokens.
    pub fn new(config: AuthConfig, upstream: Arc<dyn Upstream>) -> Self {
        Self {
            config,
            upstream,
            state: RwLock::new(AuthState::default()),
            in_flight: AtomicBool::new(false),
            attempted: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    pub fn guest_token(&self) -> Option<String> {
        self.state.read().guest_token.clone()
    }

    pub fn csrf_token(&self) -> Option<String> {
        self.state.read().csrf_token.clone()
    }

    /// Returns a read-only view for status reporting.
    pub fn snapshot(&self) -> AuthSnapshot {
        let state = self.state.read();
        AuthSnapshot {
            has_bearer_token: self.config.bearer_token.is_some(),
            has_guest_token: state.guest_token.is_some(),
            has_csrf_token: state.csrf_token.is_some(),
            acquisition_in_flight: self.in_flight.load(Ordering::Acquire),
            acquisition_attempted: self.attempted.load(Ordering::Acquire),
        }
    }

    /// Returns the guest token, acquiring one if none is known.
    ///
    /// Acquisition runs at most once until [`refresh`](Self::refresh) is
    /// called. Failure leaves the token empty.
    pub async fn ensure_guest_token(&self) -> Option<String> {
        if let Some(token) = self.guest_token() {
            return Some(token);
        }
        if self.attempted.load(Ordering::Acquire) {
            return None;
        }
        self.acquire().await
    }

    /// Forces a new acquisition regardless of the current token.
    pub async fn refresh(&self) -> Option<String> {
        self.acquire().await
    }

    async fn acquire(&self) -> Option<String> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("Guest token acquisition already in flight");
            return self.guest_token();
        }
        let _guard = InFlightGuard(&self.in_flight);
        self.attempted.store(true, Ordering::Release);

        tracing::info!("Acquiring guest token");
        match self.run_plan().await {
            Some(token) => {
                self.set_guest_token(&token);
                tracing::info!("Obtained guest token");
                Some(token)
            }
            None => {
                tracing::warn!("Failed to obtain a guest token through any method");
                self.guest_token()
            }
        }
    }

    /// First non-empty result of the configured steps.
    async fn run_plan(&self) -> Option<String> {
        for step in self.config.plan() {
            if let Some(token) = self.run_step(&step).await.filter(|t| !t.is_empty()) {
                tracing::debug!("Guest token obtained via {:?}", step);
                return Some(token);
            }
        }
        None
    }

    async fn run_step(&self, step: &AcquisitionStep) -> Option<String> {
        match step {
            AcquisitionStep::Activate { user_agent } => self.activate(user_agent).await,
            AcquisitionStep::ScrapePage { url } => self.scrape(url).await,
        }
    }

    async fn activate(&self, user_agent: &str) -> Option<String> {
        let bearer = self.config.bearer_token.as_deref()?;
        let url = match Url::parse(&self.config.activation_url) {
            Ok(url) => url,
            Err(e) => {
                tracing::warn!("Invalid activation URL {}: {}", self.config.activation_url, e);
                return None;
            }
        };

        let request = OutboundRequest::post(url)
            .with_header("authorization", &format!("Bearer {}", bearer))
            .with_header("user-agent", user_agent)
            .with_header("content-type", "application/json")
            .with_header("origin", "https://twitter.com")
            .with_header("referer", "https://twitter.com/");

        let response = match self.upstream.fetch(request).await {
            Ok(response) => response,
            Err(e) => {
                tracing::debug!("Guest token activation failed: {}", e);
                return None;
            }
        };

        if !response.is_success() {
            tracing::debug!("Guest token activation returned {}", response.status);
            return None;
        }

        match serde_json::from_slice::<ActivationResponse>(&response.body) {
            Ok(parsed) => parsed.guest_token,
            Err(e) => {
                tracing::debug!("Unparseable activation response: {}", e);
                None
            }
        }
    }

    async fn scrape(&self, page: &str) -> Option<String> {
        let url = Url::parse(page).ok()?;
        let request = OutboundRequest::get(url)
            .with_header("user-agent", MOBILE_USER_AGENT)
            .with_header("accept", "text/html,application/xhtml+xml")
            .with_header("accept-language", "en-US,en;q=0.9")
            .with_header("cache-control", "no-cache, no-store, must-revalidate")
            .with_header("pragma", "no-cache");

        let response = match self.upstream.fetch(request).await {
            Ok(response) => response,
            Err(e) => {
                tracing::debug!("Fetching {} for guest token failed: {}", page, e);
                return None;
            }
        };

        self.observe(&response);
        if !response.is_success() {
            return None;
        }

        let html = String::from_utf8_lossy(&response.body);
        extract_embedded_guest_token(&html)
    }

    /// Updates tokens from any gated-site response.
    ///
    /// Looks at the `x-guest-token` header, `ct0` cookies, and for HTML the
    /// `gt` meta tag and hidden `authenticity_token` input.
    pub fn observe(&self, response: &ProxyResponse) {
        let html = response.is_html().then_some(&response.body[..]);
        let found = extract_passive_tokens(&response.headers, html);

        if let Some(token) = found.guest_token {
            self.set_guest_token(&token);
            tracing::debug!("Updated guest token from response");
        }
        if let Some(token) = found.csrf_token {
            self.set_csrf_token(&token);
            tracing::debug!("Updated CSRF token from response");
        }
    }

    fn set_guest_token(&self, token: &str) {
        if !token.is_empty() {
            self.state.write().guest_token = Some(token.to_string());
        }
    }

    fn set_csrf_token(&self, token: &str) {
        if !token.is_empty() {
            self.state.write().csrf_token = Some(token.to_string());
        }
    }

    /// Authentication headers for a gated API request.
    pub fn api_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let state = self.state.read().clone();

        if let Some(bearer) = &self.config.bearer_token {
            set_header(&mut headers, "authorization", &format!("Bearer {}", bearer));
        }
        if let Some(guest) = &state.guest_token {
            set_header(&mut headers, "x-guest-token", guest);
        }
        if let Some(csrf) = &state.csrf_token {
            set_header(&mut headers, "x-csrf-token", csrf);
            set_header(&mut headers, "x-twitter-auth-type", "OAuth2Session");
        }
        headers
    }
}

/// Returns true for statuses that warrant a token refresh and replay.
pub fn is_auth_failure(status: StatusCode) -> bool {
    matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN)
}

/// Finds a guest token embedded in a page.
pub fn extract_embedded_guest_token(html: &str) -> Option<String> {
    [&*GT_ASSIGNMENT, &*GUEST_TOKEN_LITERAL]
        .iter()
        .find_map(|re| re.captures(html).map(|c| c[1].to_string()))
        .filter(|t| !t.is_empty())
}

/// Extracts tokens from response headers and an optional HTML body.
pub fn extract_passive_tokens(headers: &HeaderMap, html: Option<&[u8]>) -> AuthState {
    let mut found = AuthState {
        guest_token: headers
            .get("x-guest-token")
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(str::to_string),
        csrf_token: headers
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .find_map(|cookie| CSRF_COOKIE.captures(cookie).map(|c| c[1].to_string())),
    };

    if let Some(body) = html {
        let html = String::from_utf8_lossy(body);
        if let Some(c) = GT_META.captures(&html) {
            found.guest_token = Some(c[1].to_string());
        }
        if let Some(c) = AUTHENTICITY_INPUT.captures(&html) {
            found.csrf_token = Some(c[1].to_string());
        }
    }

    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProxyError;
    use crate::upstream::testing::ScriptedUpstream;
    use hyper::header::{HeaderValue, CONTENT_TYPE};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::Notify;

    fn manager(bearer: Option<&str>, upstream: Arc<ScriptedUpstream>) -> TokenManager {
        let config = AuthConfig::default().with_bearer_token(bearer.map(str::to_string));
        TokenManager::new(config, upstream)
    }

    fn json(body: &str) -> ProxyResponse {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        ProxyResponse::new(StatusCode::OK, headers, body.to_string())
    }

    #[test]
    fn plan_skips_activation_without_bearer() {
        let plan = AuthConfig::default().plan();
        assert_eq!(
            plan,
            vec![
                AcquisitionStep::ScrapePage { url: "https://x.com/".into() },
                AcquisitionStep::ScrapePage { url: "https://twitter.com/".into() },
            ]
        );

        let plan = AuthConfig::default()
            .with_bearer_token(Some("AAA".into()))
            .plan();
        assert_eq!(plan.len(), 4);
        assert_eq!(
            plan[1],
            AcquisitionStep::Activate { user_agent: NATIVE_APP_USER_AGENT }
        );
    }

    #[test]
    fn empty_bearer_counts_as_unset() {
        let config = AuthConfig::default().with_bearer_token(Some("  ".into()));
        assert!(config.bearer_token.is_none());
    }

    #[test]
    fn debug_redacts_bearer() {
        let config = AuthConfig::default().with_bearer_token(Some("secret".into()));
        let printed = format!("{:?}", config);
        assert!(!printed.contains("secret"));
    }

    #[tokio::test]
    async fn activation_wins_first() {
        let upstream = Arc::new(ScriptedUpstream::new(|req| {
            assert_eq!(req.headers.get("authorization").unwrap(), "Bearer AAA");
            Ok(json(r#"{"guest_token":"12345"}"#))
        }));
        let tokens = manager(Some("AAA"), upstream.clone());

        assert_eq!(tokens.ensure_guest_token().await.as_deref(), Some("12345"));
        assert_eq!(upstream.call_count(), 1);
        assert!(tokens.snapshot().has_guest_token);
    }

    #[tokio::test]
    async fn falls_back_to_native_agent_then_pages() {
        let upstream = Arc::new(ScriptedUpstream::new(|req| {
            if req.url.as_str().contains("activate.json") {
                return Ok(ProxyResponse::new(StatusCode::FORBIDDEN, HeaderMap::new(), ""));
            }
            if req.url.host_str() == Some("x.com") {
                return Ok(ProxyResponse::html(StatusCode::OK, "<html>nothing</html>"));
            }
            Ok(ProxyResponse::html(
                StatusCode::OK,
                r#"<script>window.__INITIAL_STATE__={"GUEST_TOKEN": "777abc"}</script>"#,
            ))
        }));
        let tokens = manager(Some("AAA"), upstream.clone());

        assert_eq!(tokens.ensure_guest_token().await.as_deref(), Some("777abc"));
        assert_eq!(upstream.calls_to("activate.json"), 2);
        assert_eq!(upstream.calls_to("x.com/"), 1);
        assert_eq!(upstream.calls_to("twitter.com/"), 3);

        let native = &upstream.calls()[1];
        assert_eq!(native.headers.get("user-agent").unwrap(), NATIVE_APP_USER_AGENT);
    }

    #[tokio::test]
    async fn scrape_reads_gt_assignment() {
        let upstream = Arc::new(ScriptedUpstream::new(|_| {
            Ok(ProxyResponse::html(
                StatusCode::OK,
                r#"<script>document.cookie = "gt=1790000000000000000"</script>"#,
            ))
        }));
        let tokens = manager(None, upstream.clone());

        assert_eq!(
            tokens.ensure_guest_token().await.as_deref(),
            Some("1790000000000000000")
        );
        let first = &upstream.calls()[0];
        assert_eq!(
            first.headers.get("cache-control").unwrap(),
            "no-cache, no-store, must-revalidate"
        );
        assert_eq!(first.headers.get("user-agent").unwrap(), MOBILE_USER_AGENT);
    }

    #[tokio::test]
    async fn total_failure_is_not_an_error_and_runs_once() {
        let upstream = Arc::new(ScriptedUpstream::new(|_| {
            Err(ProxyError::Http("offline".into()))
        }));
        let tokens = manager(Some("AAA"), upstream.clone());

        assert_eq!(tokens.ensure_guest_token().await, None);
        assert_eq!(upstream.call_count(), 4);

        assert_eq!(tokens.ensure_guest_token().await, None);
        assert_eq!(upstream.call_count(), 4);

        tokens.refresh().await;
        assert_eq!(upstream.call_count(), 8);
        assert!(!tokens.snapshot().acquisition_in_flight);
    }

    /// Upstream whose activation endpoint blocks until released.
    #[derive(Debug, Default)]
    struct HeldActivation {
        started: Notify,
        release: Notify,
        activations: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Upstream for HeldActivation {
        async fn fetch(&self, request: OutboundRequest) -> crate::Result<ProxyResponse> {
            if request.url.as_str() != ACTIVATION_URL {
                return Ok(ProxyResponse::new(StatusCode::NOT_FOUND, HeaderMap::new(), ""));
            }
            self.activations.fetch_add(1, Ordering::SeqCst);
            self.started.notify_one();
            self.release.notified().await;
            Ok(json(r#"{"guest_token":"777"}"#))
        }
    }

    #[tokio::test]
    async fn overlapping_acquisition_returns_immediately() {
        let upstream = Arc::new(HeldActivation::default());
        let tokens = Arc::new(TokenManager::new(
            AuthConfig::default().with_bearer_token(Some("AAA".into())),
            upstream.clone(),
        ));

        let first = tokio::spawn({
            let tokens = tokens.clone();
            async move { tokens.refresh().await }
        });
        upstream.started.notified().await;
        assert!(tokens.snapshot().acquisition_in_flight);

        let second = tokio::time::timeout(Duration::from_secs(1), tokens.refresh())
            .await
            .expect("overlapping refresh waited for the first one");
        assert_eq!(second, None);

        upstream.release.notify_one();
        assert_eq!(first.await.unwrap().as_deref(), Some("777"));
        assert_eq!(upstream.activations.load(Ordering::SeqCst), 1);
        assert!(!tokens.snapshot().acquisition_in_flight);
        assert_eq!(tokens.guest_token().as_deref(), Some("777"));
    }

    #[tokio::test]
    async fn dropped_acquisition_clears_in_flight() {
        let upstream = Arc::new(HeldActivation::default());
        let tokens = TokenManager::new(
            AuthConfig::default().with_bearer_token(Some("AAA".into())),
            upstream.clone(),
        );

        {
            let acquisition = tokens.refresh();
            tokio::pin!(acquisition);
            tokio::select! {
                _ = &mut acquisition => panic!("activation should still be held"),
                _ = upstream.started.notified() => {}
            }
            assert!(tokens.snapshot().acquisition_in_flight);
        }

        assert!(!tokens.snapshot().acquisition_in_flight);
        assert_eq!(upstream.activations.load(Ordering::SeqCst), 1);
        assert_eq!(tokens.guest_token(), None);
    }

    #[test]
    fn observe_reads_headers_and_cookies() {
        let tokens = manager(None, Arc::new(ScriptedUpstream::unreachable()));
        let mut headers = HeaderMap::new();
        headers.insert("x-guest-token", HeaderValue::from_static("ABC123"));
        headers.append(SET_COOKIE, HeaderValue::from_static("guest_id=v1; Path=/"));
        headers.append(SET_COOKIE, HeaderValue::from_static("ct0=csrf42; Path=/; Secure"));

        tokens.observe(&ProxyResponse::new(StatusCode::OK, headers, ""));
        assert_eq!(tokens.guest_token().as_deref(), Some("ABC123"));
        assert_eq!(tokens.csrf_token().as_deref(), Some("csrf42"));
    }

    #[test]
    fn observe_reads_html_markers() {
        let tokens = manager(None, Arc::new(ScriptedUpstream::unreachable()));
        let html = r#"<html><head><meta content="998877" name="gt"></head>
<body><input type="hidden" value="tok_9" name="authenticity_token"></body></html>"#;

        tokens.observe(&ProxyResponse::html(StatusCode::OK, html));
        assert_eq!(tokens.guest_token().as_deref(), Some("998877"));
        assert_eq!(tokens.csrf_token().as_deref(), Some("tok_9"));
    }

    #[test]
    fn observe_never_clears_tokens() {
        let tokens = manager(None, Arc::new(ScriptedUpstream::unreachable()));
        let mut headers = HeaderMap::new();
        headers.insert("x-guest-token", HeaderValue::from_static("first"));
        tokens.observe(&ProxyResponse::new(StatusCode::OK, headers, ""));

        tokens.observe(&ProxyResponse::html(StatusCode::OK, "<html></html>"));
        assert_eq!(tokens.guest_token().as_deref(), Some("first"));
    }

    #[test]
    fn api_headers_only_carry_known_tokens() {
        let tokens = manager(Some("AAA"), Arc::new(ScriptedUpstream::unreachable()));
        let headers = tokens.api_headers();
        assert_eq!(headers.get("authorization").unwrap(), "Bearer AAA");
        assert!(headers.get("x-guest-token").is_none());
        assert!(headers.get("x-twitter-auth-type").is_none());

        let mut h = HeaderMap::new();
        h.insert("x-guest-token", HeaderValue::from_static("g"));
        h.insert(SET_COOKIE, HeaderValue::from_static("ct0=c"));
        tokens.observe(&ProxyResponse::new(StatusCode::OK, h, ""));

        let headers = tokens.api_headers();
        assert_eq!(headers.get("x-guest-token").unwrap(), "g");
        assert_eq!(headers.get("x-csrf-token").unwrap(), "c");
        assert_eq!(headers.get("x-twitter-auth-type").unwrap(), "OAuth2Session");
    }

    #[test]
    fn auth_failure_statuses() {
        assert!(is_auth_failure(StatusCode::UNAUTHORIZED));
        assert!(is_auth_failure(StatusCode::FORBIDDEN));
        assert!(!is_auth_failure(StatusCode::NOT_FOUND));
    }
}
