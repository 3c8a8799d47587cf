//! Header and user-agent policy table.
//!
//! Static mapping from [`DomainClass`] to the header bundle an outbound
//! request should carry. Everything here is pure data and pure functions.

use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use url::Url;

use crate::domains::DomainClass;
use crate::message::{Device, INTERNAL_HEADER_PREFIX};

/// Mobile browser user agent.
pub const MOBILE_USER_AGENT: &str = "Mozilla/5.0 (iPhone; CPU iPhone OS 15_0 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/15.0 Mobile/15E148 Safari/604.1";

/// Desktop browser user agent.
pub const DESKTOP_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.114 Safari/537.36";

/// Native-app user agent used as the second token-activation attempt.
pub const NATIVE_APP_USER_AGENT: &str = "TwitterAndroid/9.95.0-release.0 (29950000-r-0)";

/// Video-site mobile web origin.
pub const VIDEO_SITE_ORIGIN: &str = "https://m.youtube.com";

/// Gated-site mobile web origin.
pub const GATED_SITE_ORIGIN: &str = "https://mobile.twitter.com";

/// Headers never copied from the intercepted request.
///
/// `accept-encoding` is left to the upstream client so bodies arrive decoded.
const DROPPED_REQUEST_HEADERS: &[&str] = &[
    "user-agent",
    "origin",
    "referer",
    "host",
    "content-length",
    "accept-encoding",
    "connection",
    "keep-alive",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

const BROWSER_ACCEPT: &str =
    "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,image/apng,*/*;q=0.8";

const BROWSER_BUNDLE: &[(&str, &str)] = &[
    ("accept", BROWSER_ACCEPT),
    ("accept-language", "en-US,en;q=0.9"),
    ("upgrade-insecure-requests", "1"),
    ("sec-fetch-dest", "document"),
    ("sec-fetch-mode", "navigate"),
    ("sec-fetch-site", "none"),
    ("sec-fetch-user", "?1"),
    ("sec-ch-ua", "\"Google Chrome\";v=\"113\", \"Chromium\";v=\"113\""),
];

const DESKTOP_HINTS: &[(&str, &str)] = &[
    ("sec-ch-ua-mobile", "?0"),
    ("sec-ch-ua-platform", "\"macOS\""),
];

const MOBILE_HINTS: &[(&str, &str)] = &[
    ("sec-ch-ua-mobile", "?1"),
    ("sec-ch-ua-platform", "\"iOS\""),
];

const VIDEO_SITE_BUNDLE: &[(&str, &str)] = &[
    ("referer", "https://m.youtube.com/"),
    ("origin", VIDEO_SITE_ORIGIN),
    ("x-youtube-client-name", "2"),
    ("x-youtube-client-version", "2.20230721.00.00"),
];

const GATED_SITE_BUNDLE: &[(&str, &str)] = &[
    ("origin", GATED_SITE_ORIGIN),
    ("referer", "https://mobile.twitter.com/"),
    ("x-twitter-active-user", "yes"),
    ("x-twitter-client-language", "en"),
    ("x-twitter-client", "mobileweb"),
    ("x-twitter-client-version", "rweb-mobile"),
];

/// Builds outbound headers for a class using the desktop profile.
pub fn headers_for(class: DomainClass, original: &HeaderMap) -> HeaderMap {
    headers_for_device(class, original, Device::Desktop)
}

/// Builds outbound headers for a class and device profile.
///
/// Copies `original` minus the identity, hop-by-hop and internal headers,
/// then overlays the class bundle. Calling it again on its own output
/// yields the same map.
pub fn headers_for_device(class: DomainClass, original: &HeaderMap, device: Device) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(original.len() + 16);

    for (name, value) in original {
        let lower = name.as_str();
        if DROPPED_REQUEST_HEADERS.contains(&lower) || lower.starts_with(INTERNAL_HEADER_PREFIX) {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    match class {
        DomainClass::General => {
            let (agent, hints) = match device {
                Device::Desktop => (DESKTOP_USER_AGENT, DESKTOP_HINTS),
                Device::Mobile => (MOBILE_USER_AGENT, MOBILE_HINTS),
            };
            overlay(&mut headers, &[("user-agent", agent)]);
            overlay(&mut headers, BROWSER_BUNDLE);
            overlay(&mut headers, hints);
        }
        DomainClass::VideoSite => {
            overlay(&mut headers, &[("user-agent", MOBILE_USER_AGENT)]);
            overlay(&mut headers, VIDEO_SITE_BUNDLE);
        }
        DomainClass::GatedSocialSite => {
            overlay(&mut headers, &[("user-agent", MOBILE_USER_AGENT)]);
            overlay(&mut headers, GATED_SITE_BUNDLE);
        }
    }

    headers
}

fn overlay(headers: &mut HeaderMap, bundle: &[(&'static str, &'static str)]) {
    for (name, value) in bundle {
        headers.insert(
            HeaderName::from_static(name),
            HeaderValue::from_static(value),
        );
    }
}

/// Query parameter appended to defeat upstream caching, per class.
pub fn cache_buster_param(class: DomainClass) -> &'static str {
    match class {
        DomainClass::General => "_cb",
        DomainClass::VideoSite => "_yt",
        DomainClass::GatedSocialSite => "_t",
    }
}

/// Appends a cache-busting parameter to a URL.
pub fn with_cache_buster(url: &Url, param: &str, stamp: i64) -> Url {
    let mut url = url.clone();
    url.query_pairs_mut().append_pair(param, &stamp.to_string());
    url
}

/// Canonical mobile hostname for a host, if one is known.
pub fn mobile_host(host: &str) -> Option<String> {
    let mapped = match host {
        "twitter.com" | "www.twitter.com" => "mobile.twitter.com".to_string(),
        "x.com" | "www.x.com" => "mobile.x.com".to_string(),
        "youtube.com" | "www.youtube.com" => "m.youtube.com".to_string(),
        "reddit.com" | "www.reddit.com" => "old.reddit.com".to_string(),
        "www.facebook.com" => "m.facebook.com".to_string(),
        "www.wikipedia.org" => "en.m.wikipedia.org".to_string(),
        h if h.ends_with(".wikipedia.org") && !h.contains(".m.") => {
            h.replace(".wikipedia.org", ".m.wikipedia.org")
        }
        _ => return None,
    };
    Some(mapped)
}

/// Converts a URL to its mobile-site equivalent.
///
/// Only rewrites when `force` is set; unknown hosts are returned unchanged.
pub fn mobile_url(url: &Url, force: bool) -> Url {
    if !force {
        return url.clone();
    }

    let host = url.host_str().unwrap_or_default().to_ascii_lowercase();
    let Some(mobile) = mobile_host(&host) else {
        return url.clone();
    };

    let mut converted = url.clone();
    match converted.set_host(Some(&mobile)) {
        Ok(()) => converted,
        Err(e) => {
            tracing::warn!("Failed to convert {} to mobile host: {}", url, e);
            url.clone()
        }
    }
}
