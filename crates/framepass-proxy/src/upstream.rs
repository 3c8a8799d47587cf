//! Outbound HTTP client used by the pipeline and the token manager.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::message::{strip_hop_by_hop, OutboundRequest, ProxyResponse};

/// Default timeout for a single upstream exchange.
pub const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

/// Performs upstream HTTP exchanges.
#[async_trait]
pub trait Upstream: Send + Sync + std::fmt::Debug {
    /// Sends a request and buffers the whole response.
    async fn fetch(&self, request: OutboundRequest) -> Result<ProxyResponse>;
}

/// [`Upstream`] backed by a shared `reqwest` client.
///
/// Redirects are not followed so the embedding surface sees them as-is.
/// Compressed bodies are decoded by the client, and the buffered response
/// carries no hop-by-hop headers.
#[derive(Debug, Clone)]
pub struct HttpUpstream {
    client: reqwest::Client,
}

impl HttpUpstream {
    /// Creates a client with the given per-request timeout.
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        Ok(Self { client })
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn fetch(&self, request: OutboundRequest) -> Result<ProxyResponse> {
        let OutboundRequest {
            method,
            url,
            headers,
            body,
        } = request;

        tracing::debug!("Upstream {} {}", method, url);

        let response = self
            .client
            .request(method, url)
            .headers(headers)
            .body(body)
            .send()
            .await?;

        let status = response.status();
        let mut headers = response.headers().clone();
        strip_hop_by_hop(&mut headers);
        let body = response.bytes().await?;

        Ok(ProxyResponse::new(status, headers, body))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::error::ProxyError;
    use hyper::StatusCode;
    use parking_lot::Mutex;
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    type Responder = dyn Fn(&OutboundRequest) -> Result<ProxyResponse> + Send + Sync;

    /// Upstream that answers from a closure and records every request.
    pub(crate) struct ScriptedUpstream {
        responder: Box<Responder>,
        calls: Mutex<Vec<OutboundRequest>>,
    }

    impl std::fmt::Debug for ScriptedUpstream {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("ScriptedUpstream")
                .field("calls", &self.calls.lock().len())
                .finish()
        }
    }

    impl ScriptedUpstream {
        pub(crate) fn new<F>(responder: F) -> Self
        where
            F: Fn(&OutboundRequest) -> Result<ProxyResponse> + Send + Sync + 'static,
        {
            Self {
                responder: Box::new(responder),
                calls: Mutex::new(Vec::new()),
            }
        }

        /// Upstream that fails every request.
        pub(crate) fn unreachable() -> Self {
            Self::new(|_| Err(ProxyError::Http("connection refused".to_string())))
        }

        /// Upstream that answers every request with an empty status.
        pub(crate) fn status(status: StatusCode) -> Self {
            Self::new(move |_| Ok(ProxyResponse::new(status, Default::default(), "")))
        }

        pub(crate) fn calls(&self) -> Vec<OutboundRequest> {
            self.calls.lock().clone()
        }

        pub(crate) fn call_count(&self) -> usize {
            self.calls.lock().len()
        }

        /// Number of recorded calls whose URL contains `needle`.
        pub(crate) fn calls_to(&self, needle: &str) -> usize {
            self.calls
                .lock()
                .iter()
                .filter(|r| r.url.as_str().contains(needle))
                .count()
        }
    }

    /// Local origin that answers every request with a chunked body.
    pub(crate) async fn chunked_origin(content_type: &'static str, body: &'static str) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }

                let head = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n",
                    content_type
                );
                let _ = stream.write_all(head.as_bytes()).await;
                for part in body.as_bytes().chunks(64) {
                    let _ = stream.write_all(format!("{:x}\r\n", part.len()).as_bytes()).await;
                    let _ = stream.write_all(part).await;
                    let _ = stream.write_all(b"\r\n").await;
                }
                let _ = stream.write_all(b"0\r\n\r\n").await;
                let _ = stream.shutdown().await;
            }
        });

        addr
    }

    #[async_trait]
    impl Upstream for ScriptedUpstream {
        async fn fetch(&self, request: OutboundRequest) -> Result<ProxyResponse> {
            let result = (self.responder)(&request);
            self.calls.lock().push(request);
            result
        }
    }
}
