//! Synthetic documents served instead of an upstream response.
//!
//! The wrapper hosts the canonical mobile page in a sandboxed iframe when a
//! gated page cannot be embedded directly. The failure page is served when
//! neither the rewritten nor the original request could be fetched.

use hyper::header::{
    HeaderValue, ACCESS_CONTROL_ALLOW_ORIGIN, CONTENT_SECURITY_POLICY, X_FRAME_OPTIONS,
};
use hyper::StatusCode;
use url::Url;

use crate::message::ProxyResponse;
use crate::policy::{mobile_url, with_cache_buster};

/// Wrapper response header marking synthetic documents.
pub const SYNTHETIC_HEADER: &str = "x-framepass-synthetic";

/// Milliseconds before the wrapper shows its timeout message.
pub const WRAPPER_LOAD_TIMEOUT_MS: u64 = 20_000;

const PERMISSIVE_CSP: &str = "default-src * 'unsafe-inline' 'unsafe-eval' data: blob:; frame-src *;";

const IFRAME_SANDBOX: &str =
    "allow-same-origin allow-scripts allow-forms allow-popups allow-popups-to-escape-sandbox";

const WRAPPER_HTML: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0, viewport-fit=cover">
    <meta name="referrer" content="no-referrer">
    <title>Framepass viewer</title>
    <style>
        html, body {
            margin: 0;
            padding: 0;
            width: 100%;
            height: 100%;
            overflow: hidden;
            font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif;
        }
        #frame {
            position: fixed;
            inset: 0;
            width: 100%;
            height: 100%;
            border: none;
        }
        #loading {
            position: fixed;
            inset: 0;
            display: flex;
            flex-direction: column;
            justify-content: center;
            align-items: center;
            background: rgba(255, 255, 255, 0.9);
            z-index: 10;
            transition: opacity 0.3s;
        }
        .spinner {
            width: 48px;
            height: 48px;
            border: 5px solid #f3f3f3;
            border-top: 5px solid #1DA1F2;
            border-radius: 50%;
            animation: spin 1s linear infinite;
            margin-bottom: 1rem;
        }
        @keyframes spin {
            from { transform: rotate(0deg); }
            to { transform: rotate(360deg); }
        }
        #error {
            display: none;
            color: #E0245E;
            text-align: center;
            max-width: 80%;
        }
    </style>
</head>
<body>
    <div id="loading">
        <div class="spinner"></div>
        <div>Loading mobile view...</div>
        <div id="error"></div>
    </div>
    <iframe id="frame" sandbox="{{SANDBOX}}"
            allow="autoplay; clipboard-write; encrypted-media; picture-in-picture"
            title="Embedded page"></iframe>
    <script>
        var frame = document.getElementById('frame');
        var loading = document.getElementById('loading');
        var errorBox = document.getElementById('error');
        var loaded = false;

        function showError(message) {
            loading.style.opacity = '1';
            errorBox.textContent = message;
            errorBox.style.display = 'block';
        }

        frame.addEventListener('load', function () {
            loaded = true;
            loading.style.opacity = '0';
            loading.style.pointerEvents = 'none';
            setTimeout(function () { loading.style.display = 'none'; }, 300);
            try {
                var doc = frame.contentWindow.document;
                var script = doc.createElement('script');
                script.textContent =
                    "window.open = function () { return window; };" +
                    "Object.defineProperty(window, 'top', { get: function () { return window; } });" +
                    "Object.defineProperty(window, 'parent', { get: function () { return window; } });" +
                    "Object.defineProperty(document, 'domain', { get: function () { return location.hostname; }, set: function () {} });";
                doc.head.appendChild(script);
            } catch (e) {}
        });

        frame.addEventListener('error', function () {
            showError('Failed to load the page. The site may be temporarily unavailable.');
        });

        setTimeout(function () {
            if (!loaded) {
                showError('Loading is taking longer than expected. The site may be unavailable.');
            }
        }, {{TIMEOUT_MS}});

        try {
            frame.src = {{TARGET}};
        } catch (e) {
            showError('Error loading page: ' + e.message);
        }
    </script>
</body>
</html>"#;

const FAILURE_PAGE_HTML: &str = r#"<!DOCTYPE html>
<html>
<head>
    <title>Page unavailable</title>
    <style>
        body {
            font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif;
            display: flex;
            justify-content: center;
            align-items: center;
            min-height: 100vh;
            margin: 0;
            background: linear-gradient(135deg, #667eea 0%, #764ba2 100%);
            color: white;
        }
        .container {
            text-align: center;
            padding: 2rem;
            max-width: 500px;
        }
        h1 {
            margin: 0 0 1rem 0;
            font-size: 2rem;
        }
        .reason {
            background: rgba(255,255,255,0.2);
            padding: 1rem;
            border-radius: 8px;
            margin-top: 1rem;
            word-break: break-all;
        }
    </style>
</head>
<body>
    <div class="container">
        <h1>Page unavailable</h1>
        <p>The page could not be loaded through Framepass.</p>
        <div class="reason">
            <p><strong>URL:</strong> {{URL}}</p>
            <p><strong>Reason:</strong> {{REASON}}</p>
        </div>
    </div>
</body>
</html>"#;

/// URL the wrapper's iframe loads: canonical mobile host plus `_cb`.
pub fn wrapper_target(url: &Url, stamp_millis: i64) -> Url {
    with_cache_buster(&mobile_url(url, true), "_cb", stamp_millis)
}

/// Encodes a URL as a JavaScript string literal safe inside `<script>`.
fn script_literal(url: &Url) -> String {
    serde_json::Value::String(url.to_string())
        .to_string()
        .replace("</", "<\\/")
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

/// Builds the wrapper document for `url`.
///
/// Always a 200 HTML response with permissive framing headers.
pub fn wrapper_response(url: &Url, stamp_millis: i64) -> ProxyResponse {
    let target = wrapper_target(url, stamp_millis);
    let html = WRAPPER_HTML
        .replace("{{SANDBOX}}", IFRAME_SANDBOX)
        .replace("{{TIMEOUT_MS}}", &WRAPPER_LOAD_TIMEOUT_MS.to_string())
        .replace("{{TARGET}}", &script_literal(&target));

    let mut response = ProxyResponse::html(StatusCode::OK, html);
    let headers = &mut response.headers;
    headers.insert(X_FRAME_OPTIONS, HeaderValue::from_static("ALLOWALL"));
    headers.insert(CONTENT_SECURITY_POLICY, HeaderValue::from_static(PERMISSIVE_CSP));
    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(SYNTHETIC_HEADER, HeaderValue::from_static("wrapper"));
    response
}

/// Builds the 502 page shown when a request could not be fetched at all.
pub fn failure_response(url: &Url, reason: &str) -> ProxyResponse {
    let html = FAILURE_PAGE_HTML
        .replace("{{URL}}", &escape_html(url.as_str()))
        .replace("{{REASON}}", &escape_html(reason));

    let mut response = ProxyResponse::html(StatusCode::BAD_GATEWAY, html);
    response
        .headers
        .insert(SYNTHETIC_HEADER, HeaderValue::from_static("failure"));
    response
}
