//! Application state for the control API.

use chrono::{DateTime, Utc};

use framepass_proxy::{CaManager, Pipeline};

/// Shared application state.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Pipeline shared with the running proxy.
    pub pipeline: Pipeline,
    /// CA whose certificate is offered for installation, if any.
    pub ca_manager: Option<CaManager>,
    /// When the server state was created.
    pub started_at: DateTime<Utc>,
}

impl AppState {
    /// Creates state around the proxy's pipeline.
    pub fn new(pipeline: Pipeline) -> Self {
        Self {
            pipeline,
            ca_manager: None,
            started_at: Utc::now(),
        }
    }

    /// Exposes the CA certificate through `GET /api/ca`.
    pub fn with_ca_manager(mut self, ca_manager: CaManager) -> Self {
        self.ca_manager = Some(ca_manager);
        self
    }
}
