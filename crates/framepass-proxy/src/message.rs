//! Request and response snapshots passed through the rewrite pipeline.
//!
//! The pipeline works on fully buffered messages: bodies are collected once
//! by the proxy adapter and handed around as [`Bytes`].

use hyper::body::Bytes;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, CONTENT_TYPE};
use hyper::{Method, StatusCode};
use url::Url;

/// Request header the embedding surface may set to pick a device profile.
pub const VIEW_HEADER: &str = "x-framepass-view";

/// Prefix of headers that are meaningful to the proxy only.
pub const INTERNAL_HEADER_PREFIX: &str = "x-framepass-";

/// Connection-scoped response headers that are never relayed.
pub const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Device profile the upstream request should imitate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Device {
    /// Desktop browser.
    #[default]
    Desktop,
    /// Mobile browser.
    Mobile,
}

impl Device {
    /// Maps the surface's boolean "mobile view" preference to a device.
    pub fn from_preference(mobile: bool) -> Self {
        if mobile {
            Device::Mobile
        } else {
            Device::Desktop
        }
    }

    /// Parses a `X-Framepass-View` header value.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mobile" => Some(Device::Mobile),
            "desktop" => Some(Device::Desktop),
            _ => None,
        }
    }

    /// Returns true for the mobile profile.
    pub fn is_mobile(&self) -> bool {
        matches!(self, Device::Mobile)
    }
}

/// An intercepted request, classified once and then read-only.
#[derive(Debug, Clone)]
pub struct RequestContext {
    url: Url,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
    initiator_is_own_surface: bool,
    mobile_default: bool,
    view_override: Option<Device>,
}

impl RequestContext {
    /// Creates a context from the intercepted request parts.
    ///
    /// Reads the `X-Framepass-View` override and strips every
    /// `X-Framepass-*` header so none of them reach the origin.
    pub fn new(method: Method, url: Url, mut headers: HeaderMap, body: Bytes) -> Self {
        let view_override = headers
            .get(VIEW_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(Device::parse);

        let internal: Vec<HeaderName> = headers
            .keys()
            .filter(|name| name.as_str().starts_with(INTERNAL_HEADER_PREFIX))
            .cloned()
            .collect();
        for name in internal {
            headers.remove(&name);
        }

        Self {
            url,
            method,
            headers,
            body,
            initiator_is_own_surface: false,
            mobile_default: false,
            view_override,
        }
    }

    /// Marks whether the request came from the embedding surface.
    pub fn from_surface(mut self, own_surface: bool) -> Self {
        self.initiator_is_own_surface = own_surface;
        self
    }

    /// Sets the mobile preference used when no explicit view header was sent.
    pub fn with_mobile_default(mut self, mobile: bool) -> Self {
        self.mobile_default = mobile;
        self
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Lowercased host name, empty when the URL has none.
    pub fn host(&self) -> String {
        self.url
            .host_str()
            .map(|h| h.trim_end_matches('.').to_ascii_lowercase())
            .unwrap_or_default()
    }

    pub fn path(&self) -> &str {
        self.url.path()
    }

    pub fn initiator_is_own_surface(&self) -> bool {
        self.initiator_is_own_surface
    }

    /// Effective mobile preference (explicit header first).
    pub fn mobile_preference(&self) -> bool {
        self.device().is_mobile()
    }

    pub fn device(&self) -> Device {
        self.view_override
            .unwrap_or(Device::from_preference(self.mobile_default))
    }

    /// Normalized request identity used as the cache key.
    ///
    /// Mobile requests get their own entries since handlers fetch a
    /// different variant of the page for them.
    pub fn cache_key(&self) -> String {
        let mut url = self.url.clone();
        url.set_fragment(None);

        let method = self.method.as_str().to_ascii_uppercase();
        if self.device().is_mobile() {
            format!("{} {} [mobile]", method, url)
        } else {
            format!("{} {}", method, url)
        }
    }

    /// Rebuilds the request exactly as received (minus internal headers).
    pub fn to_outbound(&self) -> OutboundRequest {
        OutboundRequest {
            method: self.method.clone(),
            url: self.url.clone(),
            headers: self.headers.clone(),
            body: self.body.clone(),
        }
    }
}

/// A request about to be sent upstream.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl OutboundRequest {
    /// Creates a body-less request.
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn head(url: Url) -> Self {
        Self::new(Method::HEAD, url)
    }

    pub fn post(url: Url) -> Self {
        Self::new(Method::POST, url)
    }

    /// Sets a header, ignoring names or values that are not valid HTTP.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        set_header(&mut self.headers, name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }
}

/// A buffered response, either from upstream or synthesized locally.
#[derive(Debug, Clone, PartialEq)]
pub struct ProxyResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ProxyResponse {
    pub fn new(status: StatusCode, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers,
            body: body.into(),
        }
    }

    /// Creates an HTML response with a UTF-8 content type.
    pub fn html(status: StatusCode, html: impl Into<String>) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/html; charset=utf-8"),
        );
        Self::new(status, headers, html.into())
    }

    /// Returns true for 2xx statuses.
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Returns a header value as a string, if present and valid.
    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Returns true when the response carries an HTML document.
    ///
    /// Falls back to sniffing the body when no content type was sent.
    pub fn is_html(&self) -> bool {
        match self.header_str(CONTENT_TYPE.as_str()) {
            Some(ct) => ct.to_ascii_lowercase().contains("text/html"),
            None => {
                let head = &self.body[..self.body.len().min(64)];
                let head = String::from_utf8_lossy(head).trim_start().to_ascii_lowercase();
                head.starts_with("<!doctype html") || head.starts_with("<html")
            }
        }
    }
}

/// Inserts a header, skipping invalid names or values.
///
/// Returns true if the header was set.
pub(crate) fn set_header(headers: &mut HeaderMap, name: &str, value: &str) -> bool {
    match (
        HeaderName::from_bytes(name.as_bytes()),
        HeaderValue::from_str(value),
    ) {
        (Ok(name), Ok(value)) => {
            headers.insert(name, value);
            true
        }
        _ => {
            tracing::debug!("Skipping invalid header {}", name);
            false
        }
    }
}

/// Removes hop-by-hop headers, including any named by `Connection`.
///
/// Bodies are always fully buffered, so framing is left to the server
/// that sends the message.
pub(crate) fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<String> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .filter(|token| !token.is_empty())
        .collect();

    for name in listed.iter().map(String::as_str).chain(HOP_BY_HOP_HEADERS.iter().copied()) {
        headers.remove(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx_with(headers: HeaderMap) -> RequestContext {
        RequestContext::new(
            Method::GET,
            Url::parse("https://example.com/page#frag").unwrap(),
            headers,
            Bytes::new(),
        )
    }

    #[test]
    fn internal_headers_are_stripped() {
        let mut headers = HeaderMap::new();
        headers.insert(VIEW_HEADER, HeaderValue::from_static("mobile"));
        headers.insert("x-framepass-debug", HeaderValue::from_static("1"));
        headers.insert("accept", HeaderValue::from_static("*/*"));

        let ctx = ctx_with(headers);
        assert!(ctx.headers().get(VIEW_HEADER).is_none());
        assert!(ctx.headers().get("x-framepass-debug").is_none());
        assert!(ctx.headers().get("accept").is_some());
    }

    #[test]
    fn view_header_overrides_default() {
        let mut headers = HeaderMap::new();
        headers.insert(VIEW_HEADER, HeaderValue::from_static("desktop"));
        let ctx = ctx_with(headers).with_mobile_default(true);
        assert!(!ctx.mobile_preference());

        let ctx = ctx_with(HeaderMap::new()).with_mobile_default(true);
        assert!(ctx.mobile_preference());
        assert_eq!(ctx.device(), Device::Mobile);
    }

    #[test]
    fn cache_key_drops_fragment() {
        let ctx = ctx_with(HeaderMap::new());
        assert_eq!(ctx.cache_key(), "GET https://example.com/page");
    }

    #[test]
    fn hop_by_hop_headers_are_stripped() {
        let mut headers = HeaderMap::new();
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("connection", HeaderValue::from_static("close, x-trace-hop"));
        headers.insert("x-trace-hop", HeaderValue::from_static("1"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/html"));

        strip_hop_by_hop(&mut headers);

        assert!(headers.get("transfer-encoding").is_none());
        assert!(headers.get("connection").is_none());
        assert!(headers.get("x-trace-hop").is_none());
        assert!(headers.get("keep-alive").is_none());
        assert_eq!(headers.get(CONTENT_TYPE).unwrap(), "text/html");
    }

    #[test]
    fn cache_key_separates_mobile_variant() {
        let desktop = ctx_with(HeaderMap::new());
        let mobile = ctx_with(HeaderMap::new()).with_mobile_default(true);
        assert_ne!(desktop.cache_key(), mobile.cache_key());
        assert!(mobile.cache_key().ends_with("[mobile]"));
    }

    #[test]
    fn html_detection_sniffs_without_content_type() {
        let res = ProxyResponse::new(StatusCode::OK, HeaderMap::new(), "  <!DOCTYPE html><html>");
        assert!(res.is_html());

        let res = ProxyResponse::new(StatusCode::OK, HeaderMap::new(), "{\"a\":1}");
        assert!(!res.is_html());

        let res = ProxyResponse::html(StatusCode::OK, "<p>x</p>");
        assert!(res.is_html());
    }

    #[test]
    fn set_header_rejects_invalid() {
        let mut headers = HeaderMap::new();
        assert!(!set_header(&mut headers, "bad header", "x"));
        assert!(set_header(&mut headers, "X-Test", "ok"));
        assert_eq!(headers.get("x-test").unwrap(), "ok");
    }
}
