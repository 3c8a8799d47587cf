//! Framepass Proxy - request/response rewrite pipeline for embedding
//! third-party pages in a frame.
//!
//! This crate hosts a TLS-intercepting proxy that rewrites traffic issued by
//! the operator's embedding surface so that pages refusing to be framed can
//! still be shown inside it.
//!
//! ## Features
//!
//! - Generates root CA certificate on first run
//! - Touches only requests issued by the embedding surface (passthrough for others)
//! - Per-domain request strategies (general, video site, gated social site)
//! - Strips framing-defense headers and neutralizes frame-busting scripts
//! - Guest/CSRF token lifecycle for the gated site's API, with one retry on 401/403
//! - Wrapper document fallback when a page cannot be embedded directly
//! - In-memory TTL cache with a selective caching policy
//!
//! ## Architecture
//!
//! ```text
//! Client Request → Proxy → Surface Check → From surface?
//!                                            │
//!                          ┌─────────────────┴─────────────────┐
//!                          │ No                                │ Yes
//!                          ▼                                   ▼
//!                     Passthrough                        Cache lookup ── hit ──→ Response
//!                                                              │ miss
//!                                                              ▼
//!                                                    Classify → Domain Handler
//!                                                              │
//!                                            ┌─────────────────┼─────────────────┐
//!                                            ▼                 ▼                 ▼
//!                                         General          Video site       Gated site
//!                                            │                 │      (tokens, retry, wrapper)
//!                                            └────────→ Rewrite Engine ←─────────┘
//!                                                              │
//!                                                              ▼
//!                                                     Cache store → Response
//! ```

pub mod auth;
mod ca;
pub mod cache;
pub mod clock;
pub mod control;
pub mod domains;
mod error;
mod handler;
pub mod handlers;
pub mod message;
pub mod pipeline;
pub mod policy;
mod proxy;
pub mod rewrite;
pub mod upstream;
pub mod wrapper;

pub use auth::{AuthConfig, AuthSnapshot, TokenManager};
pub use ca::{CaManager, CaManagerError};
pub use cache::{ResponseCache, DEFAULT_CACHE_TTL};
pub use control::{ControlMessage, ControlReply};
pub use domains::{classify, DomainClass, SurfaceMatcher};
pub use error::{ProxyError, Result};
pub use handler::ProxyHandler;
pub use message::{Device, ProxyResponse, RequestContext};
pub use pipeline::{Dispatch, Pipeline, PipelineConfig, PipelineStatus};
pub use proxy::{ProxyConfig, ProxyHandle, ProxyServer};
pub use upstream::{HttpUpstream, Upstream, DEFAULT_UPSTREAM_TIMEOUT};

/// Default proxy port.
pub const DEFAULT_PROXY_PORT: u16 = 8766;
