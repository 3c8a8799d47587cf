//! Response rewriting that neutralizes framing defenses.
//!
//! Two strengths:
//!
//! - **Light** ([`rewrite_html_light`]): regex substitutions that turn
//!   `top`/`self`/`parent`/`frameElement` comparisons into constants, plus an
//!   override script, and removal of framing-defense headers.
//! - **Full** ([`rewrite_html_full`]): rebuilds the header set from a short
//!   allow-list, drops `document.domain` scripts and framing meta tags, then
//!   applies the light substitutions and injects the override script with a
//!   `no-referrer` policy.
//!
//! This is a best-effort heuristic over raw markup, not an HTML parser. Both
//! levels are idempotent: substituted text no longer matches, and injection
//! is guarded by [`OVERRIDE_MARKER`].

use std::borrow::Cow;

use hyper::header::{
    HeaderMap, HeaderValue, ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
    ACCESS_CONTROL_ALLOW_ORIGIN, CONTENT_LENGTH, CONTENT_TYPE, DATE, EXPIRES, LAST_MODIFIED,
};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};

use crate::message::ProxyResponse;

/// Attribute marking markup injected by the rewrite engine.
pub const OVERRIDE_MARKER: &str = "data-framepass-override";

/// Response header recording which rewrite level ran.
pub const REWRITE_HEADER: &str = "x-framepass-rewrite";

/// Response headers that prevent or restrict framing.
pub const FRAMING_DEFENSE_HEADERS: &[&str] = &[
    "x-frame-options",
    "frame-options",
    "content-security-policy",
    "content-security-policy-report-only",
    "cross-origin-embedder-policy",
    "cross-origin-opener-policy",
    "cross-origin-resource-policy",
];

/// Upstream headers kept by a full reconstruction.
const ESSENTIAL_HEADERS: &[hyper::header::HeaderName] =
    &[CONTENT_TYPE, CONTENT_LENGTH, DATE, EXPIRES, LAST_MODIFIED];

/// Script that makes the page believe it is the top-level window.
const OVERRIDE_SCRIPT: &str = r#"<script data-framepass-override>
(function () {
  try {
    Object.defineProperty(window, 'frameElement', { get: function () { return null; } });
    Object.defineProperty(window, 'top', { get: function () { return window.self; } });
    Object.defineProperty(window, 'parent', { get: function () { return window.self; } });
  } catch (e) {}
  try {
    var assign = window.location.assign.bind(window.location);
    var replace = window.location.replace.bind(window.location);
    window.location.assign = function (url) {
      if (typeof url === 'string' && url.indexOf('top.location') >= 0) { return; }
      return assign(url);
    };
    window.location.replace = function (url) {
      if (typeof url === 'string' && url.indexOf('top.location') >= 0) { return; }
      return replace(url);
    };
  } catch (e) {}
})();
</script>
"#;

/// Extra head markup for the full reconstruction.
const FULL_HEAD_PREFIX: &str = "<meta name=\"referrer\" content=\"no-referrer\" data-framepass-override>\n<style data-framepass-override>html, body { height: 100%; margin: 0; }</style>\n";

/// Frame-busting comparisons and their neutralized replacements, in order.
static FRAME_BUSTING_PATTERNS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    [
        (
            r"\bif\s*\(\s*(?:window\.)?top\s*!==?\s*(?:window\.)?self\s*\)",
            "if (false)",
        ),
        (
            r"\bif\s*\(\s*(?:window\.)?self\s*!==?\s*(?:window\.)?top\s*\)",
            "if (false)",
        ),
        (
            r"\bif\s*\(\s*(?:window\.)?parent\s*!==?\s*window\s*\)",
            "if (false)",
        ),
        (
            r"\b(?:window\.)?top\s*!==?\s*(?:window\.)?self\b(?P<tail>[^.\w$]|$)",
            "false${tail}",
        ),
        (
            r"\b(?:window\.)?self\s*!==?\s*(?:window\.)?top\b(?P<tail>[^.\w$]|$)",
            "false${tail}",
        ),
        (
            r"\b(?:window\.)?parent\s*!==?\s*window\b(?P<tail>[^.\w$]|$)",
            "false${tail}",
        ),
        (r"\bwindow\.frameElement\b", "null"),
    ]
    .into_iter()
    .map(|(p, r)| (Regex::new(p).expect("Invalid regex pattern"), r))
    .collect()
});

static HEAD_CLOSE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)</head\s*>").expect("Invalid regex pattern"));

static SCRIPT_BLOCK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<script\b[^>]*>.*?</script\s*>").expect("Invalid regex pattern")
});

static FRAMING_META: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?i)<meta\b[^>]*http-equiv\s*=\s*["']?(?:x-frame-options|content-security-policy(?:-report-only)?)["']?[^>]*>"#,
    )
    .expect("Invalid regex pattern")
});

/// Escape techniques that warrant the override script even without a
/// comparison to neutralize.
const ESCAPE_MARKERS: &[&str] = &["top.location"];

/// Rewrite decision for one response. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewritePolicy {
    /// Response headers to delete.
    pub strip_headers: Vec<&'static str>,
    /// Whether the HTML body goes through the light patch.
    pub html_patch_required: bool,
    /// Whether headers and body are fully reconstructed.
    pub full_reconstruction_required: bool,
}

impl RewritePolicy {
    /// Light patch: header backstop plus heuristic body patch for HTML.
    pub fn light(response: &ProxyResponse) -> Self {
        Self {
            strip_headers: FRAMING_DEFENSE_HEADERS.to_vec(),
            html_patch_required: response.is_html(),
            full_reconstruction_required: false,
        }
    }

    /// Full reconstruction for the highest-value pages.
    pub fn full(response: &ProxyResponse) -> Self {
        Self {
            strip_headers: FRAMING_DEFENSE_HEADERS.to_vec(),
            html_patch_required: response.is_html(),
            full_reconstruction_required: true,
        }
    }
}

/// Neutralizes frame-busting comparisons.
///
/// Returns the patched text and whether anything matched.
fn neutralize(html: &str) -> (String, bool) {
    let mut out = Cow::Borrowed(html);
    let mut matched = false;
    for (pattern, replacement) in FRAME_BUSTING_PATTERNS.iter() {
        if pattern.is_match(&out) {
            matched = true;
            out = Cow::Owned(pattern.replace_all(&out, *replacement).into_owned());
        }
    }
    (out.into_owned(), matched)
}

/// Inserts `markup` before the first `</head>`, unless already injected.
fn inject_before_head_close(html: &str, markup: &str) -> Option<String> {
    if html.contains(OVERRIDE_MARKER) {
        return None;
    }
    let close = HEAD_CLOSE.find(html)?;
    let mut out = String::with_capacity(html.len() + markup.len());
    out.push_str(&html[..close.start()]);
    out.push_str(markup);
    out.push_str(&html[close.start()..]);
    Some(out)
}

/// Level-1 heuristic patch of an HTML document.
pub fn rewrite_html_light(html: &str) -> String {
    let (patched, matched) = neutralize(html);
    let escapes = ESCAPE_MARKERS.iter().any(|m| patched.contains(m));

    if matched || escapes {
        if let Some(injected) = inject_before_head_close(&patched, OVERRIDE_SCRIPT) {
            return injected;
        }
    }
    patched
}

/// Level-2 reconstruction of an HTML document.
pub fn rewrite_html_full(html: &str) -> String {
    let without_domain_scripts = SCRIPT_BLOCK.replace_all(html, |caps: &Captures| {
        let block = &caps[0];
        if block.contains("document.domain") && !block.contains(OVERRIDE_MARKER) {
            String::new()
        } else {
            block.to_string()
        }
    });

    let (patched, _) = neutralize(&without_domain_scripts);
    let patched = FRAMING_META.replace_all(&patched, "").into_owned();

    let markup = format!("{}{}", FULL_HEAD_PREFIX, OVERRIDE_SCRIPT);
    inject_before_head_close(&patched, &markup).unwrap_or(patched)
}

/// Applies a rewrite policy to a response.
///
/// Bodies that are not valid UTF-8 are passed through unmodified.
pub fn apply(policy: &RewritePolicy, response: ProxyResponse) -> ProxyResponse {
    let ProxyResponse {
        status,
        headers: upstream_headers,
        body,
    } = response;

    let mut headers = if policy.full_reconstruction_required {
        let mut kept = HeaderMap::new();
        for name in ESSENTIAL_HEADERS {
            if let Some(value) = upstream_headers.get(name) {
                kept.insert(name.clone(), value.clone());
            }
        }
        kept.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
        kept.insert(
            ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static("GET, POST, OPTIONS"),
        );
        kept.insert(ACCESS_CONTROL_ALLOW_HEADERS, HeaderValue::from_static("*"));
        kept.insert(REWRITE_HEADER, HeaderValue::from_static("full"));
        kept
    } else {
        let mut copied = upstream_headers;
        for name in &policy.strip_headers {
            copied.remove(*name);
        }
        copied
    };

    if !policy.html_patch_required {
        return ProxyResponse::new(status, headers, body);
    }

    let text = match std::str::from_utf8(&body) {
        Ok(text) => text,
        Err(_) => {
            tracing::debug!("Skipping body rewrite of non UTF-8 document");
            return ProxyResponse::new(status, headers, body);
        }
    };

    let rewritten = if policy.full_reconstruction_required {
        rewrite_html_full(text)
    } else {
        rewrite_html_light(text)
    };

    if rewritten == text {
        return ProxyResponse::new(status, headers, body);
    }

    if !policy.full_reconstruction_required {
        headers.insert(REWRITE_HEADER, HeaderValue::from_static("light"));
    }
    headers.insert(CONTENT_LENGTH, HeaderValue::from(rewritten.len()));
    ProxyResponse::new(status, headers, rewritten)
}
