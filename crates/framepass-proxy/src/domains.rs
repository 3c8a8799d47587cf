//! Domain classification and embedding-surface detection.
//!
//! Decides which requests the pipeline may touch at all (only those issued
//! by the embedding surface) and which handler strategy applies to them.

use hyper::header::{HeaderMap, ORIGIN, REFERER};
use url::Url;

/// Video-site domains (exact or any subdomain).
pub const VIDEO_SITE_DOMAINS: &[&str] = &[
    "youtube.com",
    "youtu.be",
    "ytimg.com",
    "yt3.ggpht.com",
    "yt3.googleusercontent.com",
];

/// Gated social-site domains (exact or any subdomain).
pub const GATED_SITE_DOMAINS: &[&str] = &[
    "twitter.com",
    "x.com",
    "abs.twimg.com",
    "pbs.twimg.com",
    "video.twimg.com",
];

/// Schemes used by browser extensions hosting the embedding surface.
const EXTENSION_SCHEMES: &[&str] = &["chrome-extension", "moz-extension"];

/// Handler family a request belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DomainClass {
    /// Any site without special handling.
    General,
    /// Video site (mobile host and client identification headers).
    VideoSite,
    /// Social site whose API requires guest/CSRF tokens.
    GatedSocialSite,
}

impl DomainClass {
    /// Returns the class name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            DomainClass::General => "general",
            DomainClass::VideoSite => "video_site",
            DomainClass::GatedSocialSite => "gated_social_site",
        }
    }
}

impl std::fmt::Display for DomainClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Strips port and trailing dot and lowercases a host.
pub fn normalize_host(host: &str) -> String {
    let host = host.split(':').next().unwrap_or(host);
    host.trim_end_matches('.').to_ascii_lowercase()
}

/// Returns true if `host` equals `domain` or is one of its subdomains.
pub fn matches_domain(host: &str, domain: &str) -> bool {
    host == domain
        || (host.len() > domain.len()
            && host.ends_with(domain)
            && host.as_bytes()[host.len() - domain.len() - 1] == b'.')
}

/// Classifies a host. Unknown hosts are always [`DomainClass::General`].
///
/// # Examples
///
/// ```
/// use framepass_proxy::{classify, DomainClass};
///
/// assert_eq!(classify("mobile.x.com"), DomainClass::GatedSocialSite);
/// assert_eq!(classify("www.youtube.com:443"), DomainClass::VideoSite);
/// assert_eq!(classify("box.com"), DomainClass::General);
/// ```
pub fn classify(host: &str) -> DomainClass {
    let host = normalize_host(host);
    if GATED_SITE_DOMAINS.iter().any(|d| matches_domain(&host, d)) {
        DomainClass::GatedSocialSite
    } else if VIDEO_SITE_DOMAINS.iter().any(|d| matches_domain(&host, d)) {
        DomainClass::VideoSite
    } else {
        DomainClass::General
    }
}

/// Recognizes requests issued by the embedding surface.
#[derive(Debug, Clone)]
pub struct SurfaceMatcher {
    /// `Referer`/`Origin` prefixes that identify the surface.
    pub origin_prefixes: Vec<String>,
    /// Substrings of the referrer that identify the surface page.
    pub page_markers: Vec<String>,
}

impl Default for SurfaceMatcher {
    fn default() -> Self {
        Self {
            origin_prefixes: vec![
                "chrome-extension://".to_string(),
                "moz-extension://".to_string(),
            ],
            page_markers: vec!["panel.html".to_string()],
        }
    }
}

impl SurfaceMatcher {
    /// Creates a matcher with explicit origin prefixes and no page markers.
    pub fn with_origins<I, S>(origins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            origin_prefixes: origins.into_iter().map(Into::into).collect(),
            page_markers: Vec::new(),
        }
    }

    /// Adds a referrer page marker.
    pub fn with_page_marker(mut self, marker: impl Into<String>) -> Self {
        self.page_markers.push(marker.into());
        self
    }

    /// Returns true if the request originates from the embedding surface.
    pub fn is_from_surface(&self, url: &Url, headers: &HeaderMap) -> bool {
        if EXTENSION_SCHEMES.contains(&url.scheme()) {
            return true;
        }

        let referrer = headers.get(REFERER).and_then(|v| v.to_str().ok());
        let origin = headers.get(ORIGIN).and_then(|v| v.to_str().ok());

        let prefixed = |value: Option<&str>| {
            value.is_some_and(|v| self.origin_prefixes.iter().any(|p| v.starts_with(p.as_str())))
        };

        if prefixed(referrer) || prefixed(origin) {
            return true;
        }

        referrer.is_some_and(|r| self.page_markers.iter().any(|m| r.contains(m.as_str())))
    }
}

/// Returns true for URLs the pipeline is able to fetch.
pub fn is_fetchable_scheme(url: &Url) -> bool {
    matches!(url.scheme(), "http" | "https")
}
