//! API route handlers.

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::{debug, info};

use framepass_proxy::ControlMessage;

use crate::error::{ApiError, Result};
use crate::models::{CacheClearResponse, StatusResponse, TokenRefreshResponse};
use crate::state::AppState;

/// POST /api/control - Deliver a surface control message.
///
/// Answers with the reply as JSON, or 204 when the message has no reply.
/// Bodies that are not a known control message get a 400.
pub async fn control(
    State(state): State<AppState>,
    payload: std::result::Result<Json<ControlMessage>, JsonRejection>,
) -> Result<Response> {
    let Json(message) = payload.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    debug!("Control message for {}", message.url());

    Ok(match state.pipeline.on_control(message).await {
        Some(reply) => Json(reply).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    })
}

/// GET /api/status - Pipeline status.
pub async fn get_status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse::new(state.started_at, state.pipeline.status()))
}

/// DELETE /api/cache - Drop every cached response.
pub async fn clear_cache(State(state): State<AppState>) -> Json<CacheClearResponse> {
    let cache = state.pipeline.cache();
    let cleared = cache.len();
    cache.clear();

    info!("Cleared {} cached responses", cleared);
    Json(CacheClearResponse { cleared })
}

/// POST /api/auth/refresh - Force a new guest token acquisition.
pub async fn refresh_token(State(state): State<AppState>) -> Json<TokenRefreshResponse> {
    let token = state.pipeline.tokens().refresh().await;
    Json(TokenRefreshResponse {
        has_guest_token: token.is_some(),
    })
}

/// GET /api/ca - Root certificate (PEM) for installation in the browser.
pub async fn get_ca_cert(State(state): State<AppState>) -> Result<Response> {
    let ca_manager = state
        .ca_manager
        .as_ref()
        .ok_or_else(|| ApiError::NotFound("CA certificate is not configured".into()))?;

    if !ca_manager.ca_exists() {
        return Err(ApiError::NotFound("CA certificate has not been generated".into()));
    }

    let pem = ca_manager.read_cert_pem()?;
    Ok((
        [
            (header::CONTENT_TYPE, "application/x-pem-file"),
            (
                header::CONTENT_DISPOSITION,
                "attachment; filename=\"framepass-ca.crt\"",
            ),
        ],
        pem,
    )
        .into_response())
}
