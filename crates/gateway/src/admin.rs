use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use gateway_core::SessionStatus;
use shared::{
    domain::SessionKey,
    error::{ApiError, ErrorCode},
};
use storage::Storage;
use tracing::{error, info};

use crate::supervisor::CurrentGateway;

const OPERATOR_REMOVAL: &str = "Your registration was removed by the gateway operator.";

#[derive(Clone)]
pub struct AdminState {
    pub storage: Storage,
    pub gateway: CurrentGateway,
}

type ApiResult<T> = Result<T, (StatusCode, Json<ApiError>)>;

pub fn build_router(state: Arc<AdminState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/sessions", get(list_sessions))
        .route("/sessions/:key", get(show_session).delete(remove_session))
        .with_state(state)
}

async fn healthz(State(state): State<Arc<AdminState>>) -> ApiResult<&'static str> {
    state.storage.health_check().await.map_err(|e| {
        error!("admin: storage health check failed: {e:#}");
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ApiError::new(ErrorCode::Internal, e.to_string())),
        )
    })?;
    Ok("ok")
}

async fn list_sessions(State(state): State<Arc<AdminState>>) -> Json<Vec<SessionStatus>> {
    let gateway = state.gateway.read().await.clone();
    match gateway {
        Some(gateway) => Json(gateway.sessions().await),
        None => Json(Vec::new()),
    }
}

async fn show_session(
    State(state): State<Arc<AdminState>>,
    Path(key): Path<String>,
) -> ApiResult<Json<SessionStatus>> {
    let key = SessionKey::new(key);
    let gateway = state.gateway.read().await.clone();
    let status = match gateway {
        Some(gateway) => gateway.session_status(&key).await,
        None => None,
    };
    status.map(Json).ok_or_else(|| not_found(&key))
}

/// Tears the user down through the live gateway, or just deletes the record
/// while the transport is down.
async fn remove_session(
    State(state): State<Arc<AdminState>>,
    Path(key): Path<String>,
) -> ApiResult<StatusCode> {
    let key = SessionKey::new(key);
    let gateway = state.gateway.read().await.clone();
    let removed = match gateway {
        Some(gateway) => gateway.remove_user(&key, OPERATOR_REMOVAL).await,
        None => state.storage.delete_credentials(&key).await.map_err(|e| {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiError::new(ErrorCode::Internal, e.to_string())),
            )
        })?,
    };
    if !removed {
        return Err(not_found(&key));
    }
    info!(session = %key, "admin: session removed");
    Ok(StatusCode::NO_CONTENT)
}

fn not_found(key: &SessionKey) -> (StatusCode, Json<ApiError>) {
    (
        StatusCode::NOT_FOUND,
        Json(ApiError::new(
            ErrorCode::NotFound,
            format!("no session for {key}"),
        )),
    )
}

#[cfg(test)]
#[path = "tests/admin_tests.rs"]
mod tests;
