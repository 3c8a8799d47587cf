//! Per-domain request strategies.
//!
//! Each [`DomainClass`] maps to one [`DomainHandler`] through a
//! [`HandlerTable`]. A handler builds the outbound request, fetches it, and
//! post-processes the response. Handlers never return errors: network
//! failures degrade to a replay of the original request, the wrapper
//! document, or a failure page.

use std::sync::Arc;

use async_trait::async_trait;
use hyper::body::Bytes;
use hyper::header::X_FRAME_OPTIONS;
use hyper::Method;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use url::Url;

use crate::auth::{is_auth_failure, TokenManager};
use crate::clock::Clock;
use crate::domains::DomainClass;
use crate::error::ProxyError;
use crate::message::{set_header, Device, OutboundRequest, ProxyResponse, RequestContext};
use crate::policy::{
    cache_buster_param, headers_for_device, mobile_url, with_cache_buster, MOBILE_USER_AGENT,
};
use crate::rewrite::{self, RewritePolicy};
use crate::upstream::Upstream;
use crate::wrapper::{failure_response, wrapper_response};

/// GraphQL operation that needs [`USER_BY_SCREEN_NAME_FEATURES`].
pub const USER_BY_SCREEN_NAME: &str = "UserByScreenName";

/// Feature flags the gated API requires on `UserByScreenName` calls.
pub const USER_BY_SCREEN_NAME_FEATURES: &[(&str, bool)] = &[
    ("responsive_web_graphql_exclude_directive_enabled", true),
    ("verified_phone_label_enabled", false),
    ("responsive_web_home_pinned_timelines_enabled", true),
    ("responsive_web_graphql_timeline_navigation_enabled", true),
    ("responsive_web_graphql_skip_user_profile_image_extensions_enabled", false),
    ("c9s_tweet_anatomy_moderator_badge_enabled", true),
    ("tweetypie_unmention_optimization_enabled", true),
    ("responsive_web_edit_tweet_api_enabled", true),
    ("graphql_is_translatable_rweb_tweet_is_translatable_enabled", true),
    ("view_counts_everywhere_api_enabled", true),
    ("longform_notetweets_consumption_enabled", true),
    ("responsive_web_twitter_article_tweet_consumption_enabled", false),
    ("tweet_awards_web_tipping_enabled", false),
    ("freedom_of_speech_not_reach_fetch_enabled", true),
    ("standardized_nudges_misinfo", true),
    ("tweet_with_visibility_results_prefer_gql_limited_actions_policy_enabled", true),
    ("longform_notetweets_rich_text_read_enabled", true),
    ("longform_notetweets_inline_media_enabled", true),
    ("responsive_web_enhance_cards_enabled", false),
];

/// Gated-site hosts that serve pages (as opposed to API or media hosts).
const GATED_PAGE_HOSTS: &[&str] = &[
    "twitter.com",
    "www.twitter.com",
    "mobile.twitter.com",
    "x.com",
    "www.x.com",
    "mobile.x.com",
];

static PROFILE_PATH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^/[A-Za-z0-9_]+/?$").expect("Invalid regex pattern"));

/// Shared collaborators handed to every handler invocation.
#[derive(Debug, Clone)]
pub struct HandlerEnv {
    pub upstream: Arc<dyn Upstream>,
    pub tokens: Arc<TokenManager>,
    pub clock: Arc<dyn Clock>,
}

/// Result of a handler invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Response derived from an upstream fetch. Eligible for caching.
    Fetched(ProxyResponse),
    /// Locally generated document. Never cached.
    Synthetic(ProxyResponse),
}

impl Outcome {
    pub fn response(&self) -> &ProxyResponse {
        match self {
            Outcome::Fetched(r) | Outcome::Synthetic(r) => r,
        }
    }

    pub fn into_response(self) -> ProxyResponse {
        match self {
            Outcome::Fetched(r) | Outcome::Synthetic(r) => r,
        }
    }

    pub fn is_synthetic(&self) -> bool {
        matches!(self, Outcome::Synthetic(_))
    }
}

/// Strategy for one domain class.
#[async_trait]
pub trait DomainHandler: Send + Sync + std::fmt::Debug {
    /// Class this handler serves.
    fn class(&self) -> DomainClass;

    /// Builds the outbound request for an intercepted one.
    fn build_request(&self, ctx: &RequestContext, env: &HandlerEnv) -> OutboundRequest;

    /// Rewrites a fetched response before it is returned.
    fn post_process(&self, ctx: &RequestContext, env: &HandlerEnv, response: ProxyResponse) -> ProxyResponse;

    /// Runs the whole exchange.
    async fn handle(&self, ctx: &RequestContext, env: &HandlerEnv) -> Outcome {
        let request = self.build_request(ctx, env);
        match env.upstream.fetch(request).await {
            Ok(response) => Outcome::Fetched(self.post_process(ctx, env, response)),
            Err(e) => replay_original(self, ctx, env, e).await,
        }
    }
}

/// Replays the intercepted request unmodified after a failed fetch.
///
/// If that fails too, a renderable failure page is returned.
async fn replay_original<H>(handler: &H, ctx: &RequestContext, env: &HandlerEnv, error: ProxyError) -> Outcome
where
    H: DomainHandler + ?Sized,
{
    tracing::warn!(
        "{} fetch of {} failed, replaying original request: {}",
        handler.class(),
        ctx.url(),
        error
    );

    match env.upstream.fetch(ctx.to_outbound()).await {
        Ok(response) => Outcome::Fetched(handler.post_process(ctx, env, response)),
        Err(e) => {
            tracing::warn!("Replay of {} failed: {}", ctx.url(), e);
            Outcome::Synthetic(failure_response(ctx.url(), &e.to_string()))
        }
    }
}

/// Returns true for URLs that look like API calls.
pub fn is_api_url(url: &Url) -> bool {
    let lower = url.as_str().to_ascii_lowercase();
    lower.contains("/api/") || lower.contains("graphql")
}

fn light_rewrite(response: ProxyResponse) -> ProxyResponse {
    let policy = RewritePolicy::light(&response);
    rewrite::apply(&policy, response)
}

/// Copies the intercepted method and body onto a new URL and header set.
fn outbound(ctx: &RequestContext, url: Url, headers: hyper::HeaderMap) -> OutboundRequest {
    OutboundRequest {
        method: ctx.method().clone(),
        url,
        headers,
        body: ctx.body().clone(),
    }
}

/// Any site without special handling.
#[derive(Debug, Clone, Copy, Default)]
pub struct GeneralHandler;

#[async_trait]
impl DomainHandler for GeneralHandler {
    fn class(&self) -> DomainClass {
        DomainClass::General
    }

    fn build_request(&self, ctx: &RequestContext, env: &HandlerEnv) -> OutboundRequest {
        let headers = headers_for_device(DomainClass::General, ctx.headers(), ctx.device());
        let mut url = mobile_url(ctx.url(), ctx.mobile_preference());

        if ctx.method() == Method::GET && !is_api_url(&url) {
            url = with_cache_buster(&url, cache_buster_param(self.class()), env.clock.now_millis());
        }

        outbound(ctx, url, headers)
    }

    fn post_process(&self, _ctx: &RequestContext, _env: &HandlerEnv, response: ProxyResponse) -> ProxyResponse {
        light_rewrite(response)
    }
}

/// Video site: forced mobile host and client identification.
#[derive(Debug, Clone, Copy, Default)]
pub struct VideoSiteHandler;

impl VideoSiteHandler {
    fn is_api(url: &Url) -> bool {
        is_api_url(url) || url.path().starts_with("/youtubei/")
    }
}

#[async_trait]
impl DomainHandler for VideoSiteHandler {
    fn class(&self) -> DomainClass {
        DomainClass::VideoSite
    }

    fn build_request(&self, ctx: &RequestContext, env: &HandlerEnv) -> OutboundRequest {
        let headers = headers_for_device(DomainClass::VideoSite, ctx.headers(), Device::Mobile);
        let mut url = ctx.url().clone();

        if ctx.method() == Method::GET && !Self::is_api(&url) {
            url = with_cache_buster(
                &mobile_url(&url, true),
                cache_buster_param(self.class()),
                env.clock.now_millis(),
            );
        }

        outbound(ctx, url, headers)
    }

    fn post_process(&self, _ctx: &RequestContext, _env: &HandlerEnv, response: ProxyResponse) -> ProxyResponse {
        light_rewrite(response)
    }
}

/// Gated social site: token management, API augmentation, and the wrapper.
#[derive(Debug, Clone, Copy, Default)]
pub struct GatedSiteHandler;

impl GatedSiteHandler {
    /// Host `api.*`, an `/api/` path, or a GraphQL endpoint.
    pub fn is_api(ctx: &RequestContext) -> bool {
        ctx.host().starts_with("api.") || is_api_url(ctx.url())
    }

    pub fn is_page_host(host: &str) -> bool {
        GATED_PAGE_HOSTS.contains(&host)
    }

    /// Site root or a single-segment profile path on a page host.
    pub fn is_high_value(ctx: &RequestContext) -> bool {
        ctx.method() == Method::GET
            && Self::is_page_host(&ctx.host())
            && (ctx.path() == "/" || ctx.path().is_empty() || PROFILE_PATH.is_match(ctx.path()))
    }

    async fn handle_high_value(&self, ctx: &RequestContext, env: &HandlerEnv) -> Outcome {
        env.tokens.ensure_guest_token().await;

        match self.fetch_direct(ctx, env).await {
            Ok(Some(response)) => Outcome::Fetched(response),
            Ok(None) => {
                tracing::info!("{} refuses framing, serving wrapper", ctx.url());
                Outcome::Synthetic(wrapper_response(ctx.url(), env.clock.now_millis()))
            }
            Err(e) => {
                tracing::warn!("Direct fetch of {} failed, serving wrapper: {}", ctx.url(), e);
                Outcome::Synthetic(wrapper_response(ctx.url(), env.clock.now_millis()))
            }
        }
    }

    /// Checks the mobile page with a HEAD request, then fetches it with a full reconstruction.
    ///
    /// `Ok(None)` means the HEAD check indicated blocking.
    async fn fetch_direct(&self, ctx: &RequestContext, env: &HandlerEnv) -> crate::Result<Option<ProxyResponse>> {
        let head = OutboundRequest::head(mobile_url(ctx.url(), true))
            .with_header("user-agent", MOBILE_USER_AGENT);
        let checked = env.upstream.fetch(head).await?;

        if !checked.is_success() || checked.headers.contains_key(X_FRAME_OPTIONS) {
            tracing::debug!(
                "HEAD check of {} returned {} (x-frame-options: {})",
                ctx.url(),
                checked.status,
                checked.headers.contains_key(X_FRAME_OPTIONS)
            );
            return Ok(None);
        }

        let response = env.upstream.fetch(self.build_request(ctx, env)).await?;
        env.tokens.observe(&response);
        let policy = RewritePolicy::full(&response);
        Ok(Some(rewrite::apply(&policy, response)))
    }

    async fn handle_standard(&self, ctx: &RequestContext, env: &HandlerEnv) -> Outcome {
        let api = Self::is_api(ctx);
        if api && env.tokens.guest_token().is_none() {
            env.tokens.ensure_guest_token().await;
        }

        let response = match env.upstream.fetch(self.build_request(ctx, env)).await {
            Ok(response) => response,
            Err(e) => return self.network_fallback(ctx, env, e).await,
        };

        if !(api && is_auth_failure(response.status)) {
            return Outcome::Fetched(self.post_process(ctx, env, response));
        }

        tracing::info!(
            "Gated API {} answered {}, refreshing token and retrying once",
            ctx.url(),
            response.status
        );
        env.tokens.observe(&response);
        env.tokens.refresh().await;

        match env.upstream.fetch(self.build_request(ctx, env)).await {
            Ok(retried) => Outcome::Fetched(self.post_process(ctx, env, retried)),
            Err(e) => self.network_fallback(ctx, env, e).await,
        }
    }

    async fn network_fallback(&self, ctx: &RequestContext, env: &HandlerEnv, error: ProxyError) -> Outcome {
        if !Self::is_api(ctx) && Self::is_page_host(&ctx.host()) {
            tracing::warn!("Fetch of {} failed, serving wrapper: {}", ctx.url(), error);
            return Outcome::Synthetic(wrapper_response(ctx.url(), env.clock.now_millis()));
        }
        replay_original(self, ctx, env, error).await
    }
}

#[async_trait]
impl DomainHandler for GatedSiteHandler {
    fn class(&self) -> DomainClass {
        DomainClass::GatedSocialSite
    }

    fn build_request(&self, ctx: &RequestContext, env: &HandlerEnv) -> OutboundRequest {
        let mut headers = headers_for_device(DomainClass::GatedSocialSite, ctx.headers(), Device::Mobile);
        let mut url = mobile_url(ctx.url(), true);
        let mut body = ctx.body().clone();

        if Self::is_api(ctx) {
            for (name, value) in env.tokens.api_headers().iter() {
                headers.insert(name.clone(), value.clone());
            }
            if url.as_str().contains("graphql") {
                set_header(&mut headers, "content-type", "application/json");
            }
            if url.as_str().contains(USER_BY_SCREEN_NAME) {
                if ctx.method() == Method::GET {
                    set_feature_flag_query(&mut url);
                } else if ctx.method() == Method::POST {
                    if let Some(merged) = merge_feature_flags(&body) {
                        body = merged;
                    }
                }
            }
        } else if ctx.method() == Method::GET {
            url = with_cache_buster(&url, cache_buster_param(self.class()), env.clock.now_millis());
        }

        OutboundRequest {
            method: ctx.method().clone(),
            url,
            headers,
            body,
        }
    }

    fn post_process(&self, _ctx: &RequestContext, env: &HandlerEnv, response: ProxyResponse) -> ProxyResponse {
        env.tokens.observe(&response);
        light_rewrite(response)
    }

    async fn handle(&self, ctx: &RequestContext, env: &HandlerEnv) -> Outcome {
        if Self::is_high_value(ctx) {
            return self.handle_high_value(ctx, env).await;
        }
        self.handle_standard(ctx, env).await
    }
}

/// Sets every feature flag as a query parameter, replacing existing values.
fn set_feature_flag_query(url: &mut Url) {
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| !USER_BY_SCREEN_NAME_FEATURES.iter().any(|(flag, _)| k == flag))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    let mut pairs = url.query_pairs_mut();
    pairs.clear();
    pairs.extend_pairs(kept);
    for (flag, enabled) in USER_BY_SCREEN_NAME_FEATURES {
        pairs.append_pair(flag, if *enabled { "true" } else { "false" });
    }
}

/// Merges the feature flags into a JSON body's `variables` object.
///
/// Returns `None` when the body is not a JSON object.
fn merge_feature_flags(body: &Bytes) -> Option<Bytes> {
    let mut value: Value = match serde_json::from_slice(body) {
        Ok(value) => value,
        Err(e) => {
            tracing::debug!("Leaving non-JSON GraphQL body untouched: {}", e);
            return None;
        }
    };

    let variables = value
        .as_object_mut()?
        .entry("variables")
        .or_insert_with(|| Value::Object(Map::new()))
        .as_object_mut()?;
    for (flag, enabled) in USER_BY_SCREEN_NAME_FEATURES {
        variables.insert(flag.to_string(), Value::Bool(*enabled));
    }

    serde_json::to_vec(&value).ok().map(Bytes::from)
}

/// Handler strategies keyed by [`DomainClass`].
#[derive(Debug, Clone)]
pub struct HandlerTable {
    general: Arc<dyn DomainHandler>,
    video_site: Arc<dyn DomainHandler>,
    gated_site: Arc<dyn DomainHandler>,
}

impl Default for HandlerTable {
    fn default() -> Self {
        Self {
            general: Arc::new(GeneralHandler),
            video_site: Arc::new(VideoSiteHandler),
            gated_site: Arc::new(GatedSiteHandler),
        }
    }
}

impl HandlerTable {
    pub fn get(&self, class: DomainClass) -> &dyn DomainHandler {
        match class {
            DomainClass::General => self.general.as_ref(),
            DomainClass::VideoSite => self.video_site.as_ref(),
            DomainClass::GatedSocialSite => self.gated_site.as_ref(),
        }
    }
}
