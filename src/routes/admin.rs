use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use std::sync::Arc;

use crate::AppState;

type ApiError = (StatusCode, Json<serde_json::Value>);

/// All admin endpoints require the X-Admin-Key header to match ADMIN_KEY.
/// With no key configured the surface is disabled entirely.
fn check_admin_key(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let configured = state.config.admin_key.as_deref().ok_or((
        StatusCode::FORBIDDEN,
        Json(serde_json::json!({ "error": "Admin desabilitado" })),
    ))?;

    let provided = headers
        .get("x-admin-key")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    if provided != configured {
        return Err((
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({ "error": "Chave de admin inválida" })),
        ));
    }
    Ok(())
}

/// DELETE /api/admin/playlist/:hash - drop one cache entry
pub async fn delete_playlist(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(hash): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    check_admin_key(&state, &headers)?;

    state.cache.delete_entry(&hash).await;
    tracing::info!(hash = %hash, "cache entry deleted by admin");

    Ok(Json(serde_json::json!({ "deleted": true, "hash": hash })))
}

/// GET /api/admin/stats - cache and queue totals
pub async fn get_stats(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    check_admin_key(&state, &headers)?;

    Ok(Json(serde_json::json!({
        "cacheEntries": state.cache.entry_count().await,
        "cacheBytes": state.cache.disk_usage_bytes().await,
        "pendingJobs": state.queue.pending_len(),
        "trackedJobs": state.queue.jobs_len().await,
    })))
}

/// DELETE /api/admin/expired - force an expiry sweep
pub async fn delete_expired(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    check_admin_key(&state, &headers)?;

    let removed = state.cache.cleanup_expired().await;
    Ok(Json(serde_json::json!({ "removed": removed })))
}
