//! HTTP router for sportswire-sync
//!
//! The operational surface: health, sync runs and status, the run and error
//! logs, and the OAuth connect/callback/disconnect/status endpoints.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Redirect, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::database::{ErrorLog, SyncStateStore};
use crate::error::{CredentialError, SyncError};
use crate::models::{EntityKey, LeagueId, PreviewSummary, Provider, SyncDecision};
use crate::oauth::{CallbackParams, OAuthManager};
use crate::sync::{SchedulerStatus, SyncEngine};

/// Default number of log entries returned
pub const DEFAULT_PAGE_LIMIT: u32 = 50;

/// Upper bound on log entries per request
pub const MAX_PAGE_LIMIT: u32 = 500;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<SyncEngine>,
    pub oauth: Arc<OAuthManager>,
    pub sync_state: Arc<dyn SyncStateStore>,
    pub errors: Arc<dyn ErrorLog>,

    /// Present when the scheduler is running
    pub scheduler: Option<Arc<RwLock<SchedulerStatus>>>,
}

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Optional league selection for full and preview runs
#[derive(Debug, Default, Deserialize)]
pub struct LeaguesRequest {
    pub leagues: Option<Vec<LeagueId>>,
}

#[derive(Debug, Deserialize)]
pub struct SelectiveRequest {
    pub external_ids: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct PreviewResponse {
    pub summary: PreviewSummary,
    pub decisions: Vec<SyncDecision>,
}

#[derive(Debug, Default, Deserialize)]
pub struct LogsQuery {
    pub limit: Option<u32>,
}

impl LogsQuery {
    fn effective_limit(&self) -> u32 {
        self.limit.unwrap_or(DEFAULT_PAGE_LIMIT).clamp(1, MAX_PAGE_LIMIT)
    }
}

/// Build the application router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/sync/full", post(sync_full_handler))
        .route("/api/sync/preview", post(sync_preview_handler))
        .route("/api/sync/selective", post(sync_selective_handler))
        .route("/api/sync/entities/:key", post(sync_entity_handler))
        .route("/api/sync/cancel", post(sync_cancel_handler))
        .route("/api/sync/status", get(sync_status_handler))
        .route("/api/logs/runs", get(run_log_handler))
        .route("/api/logs/errors", get(error_log_handler))
        .route("/api/oauth/:provider/connect", get(oauth_connect_handler))
        .route("/api/oauth/:provider/callback", get(oauth_callback_handler))
        .route("/api/oauth/:provider/disconnect", post(oauth_disconnect_handler))
        .route("/api/oauth/:provider/status", get(oauth_status_handler))
        .with_state(state)
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({ "error": message.into() }))).into_response()
}

fn sync_error_response(err: SyncError) -> Response {
    let status = match &err {
        SyncError::AlreadyRunning => StatusCode::CONFLICT,
        SyncError::UnknownEntity(_) => StatusCode::NOT_FOUND,
        SyncError::Fetch(_) => StatusCode::BAD_GATEWAY,
        SyncError::Credential(e) if e.requires_operator() => StatusCode::CONFLICT,
        SyncError::SchedulerUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        SyncError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        tracing::error!(error = %err, "Sync request failed");
    }
    error_response(status, err.to_string())
}

fn credential_error_response(err: CredentialError) -> Response {
    let status = match &err {
        CredentialError::NotConnected(_) | CredentialError::NotConfigured(_) => {
            StatusCode::NOT_FOUND
        }
        CredentialError::ReauthRequired(_) => StatusCode::CONFLICT,
        CredentialError::Authorization(_) => StatusCode::BAD_REQUEST,
        CredentialError::Http(_) => StatusCode::BAD_GATEWAY,
        CredentialError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        tracing::error!(error = %err, "Credential request failed");
    }
    error_response(status, err.to_string())
}

fn parse_provider(raw: &str) -> Result<Provider, Response> {
    raw.parse::<Provider>()
        .map_err(|e| error_response(StatusCode::BAD_REQUEST, e))
}

async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn sync_full_handler(
    State(state): State<AppState>,
    body: Option<Json<LeaguesRequest>>,
) -> Response {
    let leagues = body.and_then(|Json(b)| b.leagues);
    match state.engine.run_full(leagues).await {
        Ok(result) => (StatusCode::OK, Json(result)).into_response(),
        Err(e) => sync_error_response(e),
    }
}

async fn sync_preview_handler(
    State(state): State<AppState>,
    body: Option<Json<LeaguesRequest>>,
) -> Response {
    let leagues = body.and_then(|Json(b)| b.leagues);
    match state.engine.run_preview(leagues).await {
        Ok(decisions) => Json(PreviewResponse {
            summary: PreviewSummary::from_decisions(&decisions),
            decisions,
        })
        .into_response(),
        Err(e) => sync_error_response(e),
    }
}

async fn sync_selective_handler(
    State(state): State<AppState>,
    Json(req): Json<SelectiveRequest>,
) -> Response {
    if req.external_ids.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "external_ids must not be empty");
    }
    match state.engine.run_selective(&req.external_ids).await {
        Ok(result) => Json(result).into_response(),
        Err(e) => sync_error_response(e),
    }
}

async fn sync_entity_handler(State(state): State<AppState>, Path(key): Path<String>) -> Response {
    match state.engine.run_for_entity(&EntityKey::new(key)).await {
        Ok(result) => Json(result).into_response(),
        Err(e) => sync_error_response(e),
    }
}

async fn sync_cancel_handler(State(state): State<AppState>) -> Response {
    let cancelled = state.engine.cancel();
    Json(serde_json::json!({ "cancelled": cancelled })).into_response()
}

async fn sync_status_handler(State(state): State<AppState>) -> Response {
    let engine = match state.engine.status().await {
        Ok(status) => status,
        Err(e) => return sync_error_response(e),
    };
    let scheduler = match &state.scheduler {
        Some(status) => Some(status.read().await.clone()),
        None => None,
    };
    Json(serde_json::json!({ "engine": engine, "scheduler": scheduler })).into_response()
}

async fn run_log_handler(
    State(state): State<AppState>,
    Query(query): Query<LogsQuery>,
) -> Response {
    match state.sync_state.recent_runs(query.effective_limit()).await {
        Ok(runs) => Json(serde_json::json!({ "runs": runs })).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Failed to read run log");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to read run log")
        }
    }
}

async fn error_log_handler(
    State(state): State<AppState>,
    Query(query): Query<LogsQuery>,
) -> Response {
    match state.errors.recent_errors(query.effective_limit()).await {
        Ok(errors) => Json(serde_json::json!({ "errors": errors })).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Failed to read error log");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to read error log")
        }
    }
}

async fn oauth_connect_handler(
    State(state): State<AppState>,
    Path(provider): Path<String>,
) -> Response {
    let provider = match parse_provider(&provider) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    match state.oauth.connect(provider).await {
        Ok(url) => Redirect::to(&url).into_response(),
        Err(e) => credential_error_response(e),
    }
}

async fn oauth_callback_handler(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Query(params): Query<CallbackParams>,
) -> Response {
    let provider = match parse_provider(&provider) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    match state.oauth.complete(provider, params).await {
        Ok(credential) => Json(serde_json::json!({
            "provider": provider,
            "connected": true,
            "expires_at": credential.expires_at,
        }))
        .into_response(),
        Err(e) => credential_error_response(e),
    }
}

async fn oauth_disconnect_handler(
    State(state): State<AppState>,
    Path(provider): Path<String>,
) -> Response {
    let provider = match parse_provider(&provider) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    match state.oauth.disconnect(provider).await {
        Ok(removed) => {
            Json(serde_json::json!({ "provider": provider, "removed": removed })).into_response()
        }
        Err(e) => credential_error_response(e),
    }
}

async fn oauth_status_handler(
    State(state): State<AppState>,
    Path(provider): Path<String>,
) -> Response {
    let provider = match parse_provider(&provider) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    match state.oauth.status(provider).await {
        Ok(status) => Json(status).into_response(),
        Err(e) => credential_error_response(e),
    }
}
