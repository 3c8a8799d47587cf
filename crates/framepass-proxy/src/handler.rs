//! Adapter between the MITM proxy and the rewrite pipeline.
//!
//! Requests that do not come from the embedding surface are forwarded
//! before their body is read. Everything else is buffered, handed to the
//! [`Pipeline`], and answered directly with its response.

use http_body_util::{BodyExt, Full};
use hudsucker::{
    hyper::{Request, Response},
    Body, HttpContext, HttpHandler, RequestOrResponse,
};
use hyper::body::Bytes;
use hyper::header::HOST;
use url::Url;

use crate::message::{strip_hop_by_hop, ProxyResponse};
use crate::pipeline::{Dispatch, Pipeline};

/// Helper to convert bytes to Body
fn bytes_to_body(bytes: Bytes) -> Body {
    Body::from(Full::new(bytes))
}

/// Converts a pipeline response into a proxy response.
///
/// The body is sent whole, so hop-by-hop headers (a leftover
/// `transfer-encoding` in particular) are dropped.
fn into_hyper_response(response: ProxyResponse) -> Response<Body> {
    let ProxyResponse {
        status,
        mut headers,
        body,
    } = response;
    strip_hop_by_hop(&mut headers);

    let mut res = Response::new(bytes_to_body(body));
    *res.status_mut() = status;
    *res.headers_mut() = headers;
    res
}

/// Absolute URL of an intercepted request.
///
/// Origin-form URIs (no authority) are resolved against the `Host` header
/// as HTTPS, which is how requests arrive from an intercepted TLS tunnel.
fn request_url<B>(req: &Request<B>) -> Option<Url> {
    let uri = req.uri();
    if uri.scheme().is_some() && uri.authority().is_some() {
        return Url::parse(&uri.to_string()).ok();
    }

    let host = req.headers().get(HOST).and_then(|h| h.to_str().ok())?;
    let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
    Url::parse(&format!("https://{}{}", host, path)).ok()
}

/// HTTP handler for the MITM proxy.
#[derive(Clone, Debug)]
pub struct ProxyHandler {
    pipeline: Pipeline,
}

impl ProxyHandler {
    /// Creates a handler running requests through `pipeline`.
    pub fn new(pipeline: Pipeline) -> Self {
        Self { pipeline }
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Buffers the request and runs it through the pipeline.
    async fn intercept(&self, url: Url, req: Request<Body>) -> RequestOrResponse {
        let (parts, body) = req.into_parts();
        let body_bytes = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                tracing::warn!("Failed to read request body: {}", e);
                return RequestOrResponse::Request(Request::from_parts(parts, Body::empty()));
            }
        };

        let ctx = self.pipeline.context(
            parts.method.clone(),
            url,
            parts.headers.clone(),
            body_bytes.clone(),
        );

        match self.pipeline.handle(&ctx).await {
            Dispatch::Respond(response) => RequestOrResponse::Response(into_hyper_response(response)),
            Dispatch::PassThrough => {
                RequestOrResponse::Request(Request::from_parts(parts, bytes_to_body(body_bytes)))
            }
        }
    }
}

impl HttpHandler for ProxyHandler {
    async fn handle_request(
        &mut self,
        _ctx: &HttpContext,
        req: Request<Body>,
    ) -> RequestOrResponse {
        let url = match request_url(&req) {
            Some(url) => url,
            None => return RequestOrResponse::Request(req),
        };

        if !self.pipeline.should_intercept(&url, req.headers()) {
            return RequestOrResponse::Request(req);
        }

        tracing::debug!("Intercepting {} {}", req.method(), url);
        self.intercept(url, req).await
    }

    async fn handle_response(&mut self, _ctx: &HttpContext, res: Response<Body>) -> Response<Body> {
        // Pass-through traffic is returned untouched
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::pipeline::PipelineConfig;
    use crate::upstream::testing::chunked_origin;
    use crate::upstream::HttpUpstream;
    use hyper::body::Incoming;
    use hyper::header::{HeaderMap, HeaderValue, REFERER, TRANSFER_ENCODING};
    use hyper::service::service_fn;
    use hyper::{Method, StatusCode};
    use hyper_util::rt::TokioIo;
    use std::convert::Infallible;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    const FRAMED_PAGE: &str = "<html><head><title>t</title>\
        <script>if (top !== self) { top.location = self.location; }</script>\
        </head><body>hello</body></html>";

    #[test]
    fn absolute_uri_is_used_as_is() {
        let req = Request::builder()
            .uri("http://example.com/a?b=1")
            .body(())
            .unwrap();
        assert_eq!(
            request_url(&req).unwrap().as_str(),
            "http://example.com/a?b=1"
        );
    }

    #[test]
    fn origin_form_uses_host_header() {
        let req = Request::builder()
            .uri("/feed?x=1")
            .header(HOST, "x.com")
            .body(())
            .unwrap();
        assert_eq!(request_url(&req).unwrap().as_str(), "https://x.com/feed?x=1");
    }

    #[test]
    fn missing_host_is_none() {
        let req = Request::builder().uri("/feed").body(()).unwrap();
        assert!(request_url(&req).is_none());
    }

    #[tokio::test]
    async fn pipeline_response_is_converted() {
        let mut headers = HeaderMap::new();
        headers.insert("x-test", HeaderValue::from_static("1"));
        let response = ProxyResponse::new(StatusCode::IM_A_TEAPOT, headers, "short and stout");

        let res = into_hyper_response(response);
        assert_eq!(res.status(), StatusCode::IM_A_TEAPOT);
        assert_eq!(res.headers().get("x-test").unwrap(), "1");

        let body = res.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, Bytes::from_static(b"short and stout"));
    }

    #[test]
    fn handler_debug_and_clone() {
        let pipeline = Pipeline::new(PipelineConfig::default()).unwrap();
        let handler = ProxyHandler::new(pipeline);
        let cloned = handler.clone();
        assert!(format!("{:?}", cloned).contains("ProxyHandler"));
        assert!(cloned.pipeline().cache().is_empty());
    }

    #[tokio::test]
    async fn rewritten_chunked_page_is_served_by_hyper() {
        let addr = chunked_origin("text/html", FRAMED_PAGE).await;
        let upstream = HttpUpstream::new(Duration::from_secs(5)).unwrap();
        let pipeline = Pipeline::with_upstream(
            PipelineConfig::default(),
            Arc::new(upstream),
            Arc::new(SystemClock),
        );

        let mut headers = HeaderMap::new();
        headers.insert(REFERER, HeaderValue::from_static("chrome-extension://abc/panel.html"));
        let url = Url::parse(&format!("http://{}/page", addr)).unwrap();
        let ctx = pipeline.context(Method::GET, url, headers, Bytes::new());

        let response = match pipeline.handle(&ctx).await {
            Dispatch::Respond(response) => response,
            Dispatch::PassThrough => panic!("expected a rewritten response"),
        };
        assert!(response.headers.get(TRANSFER_ENCODING).is_none());
        assert_eq!(response.header_str("x-framepass-rewrite"), Some("light"));

        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let served = tokio::spawn(async move {
            hyper::server::conn::http1::Builder::new()
                .serve_connection(
                    TokioIo::new(server),
                    service_fn(move |_req: Request<Incoming>| {
                        let response = response.clone();
                        async move { Ok::<_, Infallible>(into_hyper_response(response)) }
                    }),
                )
                .await
        });

        client
            .write_all(b"GET /page HTTP/1.1\r\nHost: origin.test\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();

        assert!(served.await.unwrap().is_ok());
        let text = String::from_utf8_lossy(&received);
        assert!(text.starts_with("HTTP/1.1 200 OK"));
        assert!(text.contains("if (false)"));
        assert!(!text.contains("top !== self"));
    }

    #[test]
    fn leftover_framing_headers_are_not_sent() {
        let mut headers = HeaderMap::new();
        headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert("content-length", HeaderValue::from_static("5"));
        let res = into_hyper_response(ProxyResponse::new(StatusCode::OK, headers, "hello"));

        assert!(res.headers().get(TRANSFER_ENCODING).is_none());
        assert_eq!(res.headers().get("content-length").unwrap(), "5");
    }
}
