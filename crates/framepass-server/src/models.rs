//! API request and response models.

use chrono::{DateTime, Utc};
use serde::Serialize;

use framepass_proxy::{AuthSnapshot, PipelineStatus};

/// Response body for GET /api/status.
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    /// Server start time.
    pub started_at: DateTime<Utc>,
    /// Seconds since start.
    pub uptime_secs: i64,
    pub cache_enabled: bool,
    pub cache_entries: usize,
    /// Last mobile preference reported by the surface.
    pub mobile_preference: bool,
    /// Token presence flags, never token values.
    pub auth: AuthSnapshot,
}

impl StatusResponse {
    pub fn new(started_at: DateTime<Utc>, status: PipelineStatus) -> Self {
        Self {
            started_at,
            uptime_secs: (Utc::now() - started_at).num_seconds().max(0),
            cache_enabled: status.cache_enabled,
            cache_entries: status.cache_entries,
            mobile_preference: status.mobile_preference,
            auth: status.auth,
        }
    }
}

/// Response body for DELETE /api/cache.
#[derive(Debug, Serialize)]
pub struct CacheClearResponse {
    /// Number of entries removed.
    pub cleared: usize,
}

/// Response body for POST /api/auth/refresh.
#[derive(Debug, Serialize)]
pub struct TokenRefreshResponse {
    /// Whether a guest token is held after the refresh.
    pub has_guest_token: bool,
}
