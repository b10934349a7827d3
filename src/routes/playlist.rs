use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::models::{
    CacheMetadata, GroupsResponse, ItemsQuery, ItemsResponse, ParseRequest, ParseSubmitResponse,
    SeriesResponse,
};
use crate::services::cache::CacheLookup;
use crate::services::m3u_parser::hash_url;
use crate::AppState;

type ApiError = (StatusCode, Json<serde_json::Value>);

fn bad_request(message: &str) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({ "error": message })),
    )
}

fn not_found() -> ApiError {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({ "error": "Playlist não encontrada" })),
    )
}

fn gone() -> ApiError {
    (
        StatusCode::GONE,
        Json(serde_json::json!({ "error": "Cache expirado" })),
    )
}

fn internal(message: &str) -> ApiError {
    let correlation_id = uuid::Uuid::new_v4().to_string();
    tracing::error!(correlation_id = %correlation_id, "{}", message);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": message, "correlationId": correlation_id })),
    )
}

/// 404 on missing hash, 410 on expired cache
async fn require_meta(state: &AppState, hash: &str) -> Result<CacheMetadata, ApiError> {
    match state.cache.lookup(hash).await {
        CacheLookup::Found(meta) => Ok(meta),
        CacheLookup::Expired => Err(gone()),
        CacheLookup::Missing => Err(not_found()),
    }
}

fn valid_submission_url(raw: &str) -> bool {
    match url::Url::parse(raw) {
        Ok(parsed) => matches!(parsed.scheme(), "http" | "https"),
        Err(_) => false,
    }
}

/// POST /api/playlist/parse - submit a playlist URL
///
/// Cache hit returns the completed metadata immediately; a miss enqueues a
/// background job. Concurrent submissions for the same URL coalesce onto
/// one job via the hash lock.
pub async fn parse_playlist(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ParseRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if payload.url.is_empty() || !valid_submission_url(&payload.url) {
        return Err(bad_request("URL inválida"));
    }

    let hash = hash_url(&payload.url);

    if let CacheLookup::Found(mut meta) = state.cache.lookup(&hash).await {
        if meta.is_completed() {
            tracing::info!(hash = %hash, "cache hit");
            // Lean payload when the client will fetch groups separately
            if !payload.options.include_groups {
                meta.groups = Vec::new();
            }
            return Ok(Json(ParseSubmitResponse {
                success: true,
                cached: true,
                queued: false,
                hash,
                data: Some(meta),
                job_id: None,
                queue_position: None,
            }));
        }
    }

    let outcome = state
        .queue
        .submit(&hash, &payload.url, payload.options)
        .await;
    if outcome.coalesced {
        tracing::info!(hash = %hash, job_id = %outcome.job_id, "submission coalesced");
    } else {
        tracing::info!(hash = %hash, job_id = %outcome.job_id, "job enqueued");
    }

    Ok(Json(ParseSubmitResponse {
        success: true,
        cached: false,
        queued: true,
        hash,
        data: None,
        job_id: Some(outcome.job_id),
        queue_position: Some(outcome.queue_position),
    }))
}

/// Response for the status endpoint
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParseStatusResponse {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub items_parsed: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub items_total: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub groups_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub series_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_phase: Option<crate::services::progress::ParsePhase>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub can_navigate: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<i64>,
}

/// GET /api/playlist/:hash/status - poll-friendly parse progress
pub async fn get_parse_status(
    State(state): State<Arc<AppState>>,
    Path(hash): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    if let Some(progress) = state.progress.get(&hash).await {
        return Ok(Json(ParseStatusResponse {
            status: progress.status().to_string(),
            items_parsed: Some(progress.items_parsed),
            items_total: progress.items_total,
            groups_count: Some(progress.groups_count),
            series_count: Some(progress.series_count),
            current_phase: Some(progress.current_phase),
            error: progress.error.clone(),
            can_navigate: progress.can_navigate,
            elapsed_ms: Some(progress.elapsed_ms()),
        }));
    }

    // No live progress: a completed cache entry still answers
    match state.cache.lookup(&hash).await {
        CacheLookup::Found(meta) if meta.is_completed() => Ok(Json(ParseStatusResponse {
            status: "complete".to_string(),
            items_parsed: Some(meta.stats.total_items as u64),
            items_total: Some(meta.stats.total_items as u64),
            groups_count: Some(meta.stats.group_count as u64),
            series_count: Some(meta.series_stats.total_series as u64),
            current_phase: Some(crate::services::progress::ParsePhase::Complete),
            error: None,
            can_navigate: true,
            elapsed_ms: None,
        })),
        CacheLookup::Expired => Err(gone()),
        _ => Err(not_found()),
    }
}

/// Response for the validate endpoint
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateResponse {
    pub valid: bool,
    pub hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<crate::models::PlaylistStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<i64>,
}

/// GET /api/playlist/:hash/validate - cache validity without the payload,
/// used by TVs to auto-resume after a restart
pub async fn validate_cache(
    State(state): State<Arc<AppState>>,
    Path(hash): Path<String>,
) -> impl IntoResponse {
    match state.cache.lookup(&hash).await {
        CacheLookup::Found(meta) => Json(ValidateResponse {
            valid: meta.is_completed(),
            hash: meta.hash,
            url: Some(meta.url),
            stats: Some(meta.stats),
            expires_at: Some(meta.expires_at),
            created_at: Some(meta.created_at),
        }),
        _ => Json(ValidateResponse {
            valid: false,
            hash,
            url: None,
            stats: None,
            expires_at: None,
            created_at: None,
        }),
    }
}

/// GET /api/playlist/:hash/stats
pub async fn get_stats(
    State(state): State<Arc<AppState>>,
    Path(hash): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let meta = require_meta(&state, &hash).await?;
    Ok(Json(serde_json::json!({
        "hash": meta.hash,
        "stats": meta.stats,
        "seriesStats": meta.series_stats,
        "parsingStatus": meta.parsing_status,
        "createdAt": meta.created_at,
        "expiresAt": meta.expires_at,
    })))
}

/// Query params for groups
#[derive(Deserialize, Default)]
pub struct GroupsQuery {
    pub media_kind: Option<String>,
}

/// GET /api/playlist/:hash/groups - group aggregates, optionally filtered
/// by media kind; safe during an in-progress parse
pub async fn get_groups(
    State(state): State<Arc<AppState>>,
    Path(hash): Path<String>,
    Query(query): Query<GroupsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let meta = require_meta(&state, &hash).await?;

    let groups: Vec<_> = match &query.media_kind {
        Some(kind) => meta
            .groups
            .into_iter()
            .filter(|g| g.media_kind.to_string().eq_ignore_ascii_case(kind))
            .collect(),
        None => meta.groups,
    };

    Ok(Json(GroupsResponse {
        total: groups.len(),
        groups,
    }))
}

/// Query params for series
#[derive(Deserialize, Default)]
pub struct SeriesQuery {
    pub group: Option<String>,
}

/// GET /api/playlist/:hash/series - series table; empty until completion
pub async fn get_series(
    State(state): State<Arc<AppState>>,
    Path(hash): Path<String>,
    Query(query): Query<SeriesQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let meta = require_meta(&state, &hash).await?;

    let series = meta.series.unwrap_or_default();
    let series: Vec<_> = match &query.group {
        Some(group) => series
            .into_iter()
            .filter(|s| s.group.eq_ignore_ascii_case(group))
            .collect(),
        None => series,
    };

    Ok(Json(SeriesResponse {
        total: series.len(),
        series,
    }))
}

/// GET /api/playlist/items/:hash - paginated items
///
/// Unfiltered pages are O(limit) random access through the offset index;
/// group/kind filters fall back to a bounded scan.
pub async fn get_items(
    State(state): State<Arc<AppState>>,
    Path(hash): Path<String>,
    Query(query): Query<ItemsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let meta = require_meta(&state, &hash).await?;
    let limit = query.limit.min(state.config.max_items_page);
    let offset = query.offset;

    let (items, total) = if query.group.is_some() || query.media_kind.is_some() {
        state
            .cache
            .read_items_filtered(
                &hash,
                offset,
                limit,
                query.group.as_deref(),
                query.media_kind.as_deref(),
            )
            .await
            .map_err(|e| internal(&format!("Erro ao buscar itens: {}", e)))?
    } else {
        let items = state
            .cache
            .read_items(&hash, offset, limit)
            .await
            .map_err(|e| internal(&format!("Erro ao buscar itens: {}", e)))?;
        let total = if meta.is_completed() {
            meta.stats.total_items
        } else {
            state.cache.persisted_count(&hash).await.unwrap_or(0)
        };
        (items, total)
    };

    let has_more = offset + items.len() < total;

    Ok(Json(ItemsResponse {
        items,
        total,
        limit,
        offset,
        has_more,
    }))
}

#[derive(Deserialize)]
pub struct PreviewQuery {
    #[serde(default = "default_preview_limit")]
    pub limit: usize,
}

fn default_preview_limit() -> usize {
    500
}

/// GET /api/playlist/items/:hash/preview - first items, safe mid-parse
pub async fn get_preview(
    State(state): State<Arc<AppState>>,
    Path(hash): Path<String>,
    Query(query): Query<PreviewQuery>,
) -> Result<impl IntoResponse, ApiError> {
    require_meta(&state, &hash).await?;
    let limit = query.limit.min(state.config.max_items_page);

    let items = state
        .cache
        .read_preview(&hash, limit)
        .await
        .map_err(|e| internal(&format!("Erro ao buscar prévia: {}", e)))?;

    let count = items.len();
    Ok(Json(serde_json::json!({
        "items": items,
        "limit": limit,
        "count": count,
    })))
}

#[derive(Deserialize)]
pub struct PartialQuery {
    #[serde(default = "default_partial_limit")]
    pub limit: usize,
}

fn default_partial_limit() -> usize {
    100
}

/// GET /api/playlist/items/:hash/partial - early-navigation slice
pub async fn get_partial(
    State(state): State<Arc<AppState>>,
    Path(hash): Path<String>,
    Query(query): Query<PartialQuery>,
) -> Result<impl IntoResponse, ApiError> {
    require_meta(&state, &hash).await?;
    let limit = query.limit.min(state.config.max_items_page);

    let items = state
        .cache
        .read_preview(&hash, limit)
        .await
        .map_err(|e| internal(&format!("Erro ao buscar itens parciais: {}", e)))?;
    let persisted = state.cache.persisted_count(&hash).await.unwrap_or(0);

    Ok(Json(serde_json::json!({
        "items": items,
        "limit": limit,
        "persisted": persisted,
    })))
}

/// Query params for series episodes
#[derive(Deserialize)]
pub struct SeriesEpisodesQuery {
    #[serde(default = "default_episodes_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

fn default_episodes_limit() -> usize {
    100
}

/// GET /api/playlist/:hash/series/:series_id/episodes
pub async fn get_series_episodes(
    State(state): State<Arc<AppState>>,
    Path((hash, series_id)): Path<(String, String)>,
    Query(query): Query<SeriesEpisodesQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let meta = require_meta(&state, &hash).await?;

    let known = meta
        .series
        .as_ref()
        .map(|list| list.iter().any(|s| s.id == series_id))
        .unwrap_or(false);
    if !known {
        return Err((
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "Série não encontrada" })),
        ));
    }

    let (episodes, total) = state
        .cache
        .series_episodes(&hash, &series_id, query.offset, query.limit)
        .await
        .map_err(|e| internal(&format!("Erro ao buscar episódios: {}", e)))?;

    let has_more = query.offset + episodes.len() < total;

    Ok(Json(serde_json::json!({
        "seriesId": series_id,
        "episodes": episodes,
        "total": total,
        "limit": query.limit,
        "offset": query.offset,
        "hasMore": has_more,
    })))
}

/// Query params for search
#[derive(Deserialize)]
pub struct SearchQuery {
    pub q: String,
    #[serde(default = "default_search_limit")]
    pub limit: usize,
}

fn default_search_limit() -> usize {
    50
}

/// GET /api/playlist/:hash/search - case-insensitive substring search over
/// normalized titles
pub async fn search_items(
    State(state): State<Arc<AppState>>,
    Path(hash): Path<String>,
    Query(query): Query<SearchQuery>,
) -> Result<impl IntoResponse, ApiError> {
    if query.q.trim().is_empty() {
        return Err(bad_request("Parâmetro 'q' é obrigatório"));
    }

    require_meta(&state, &hash).await?;
    let limit = query.limit.min(100);

    let items = state
        .cache
        .search_items(&hash, &query.q, limit)
        .await
        .map_err(|e| internal(&format!("Erro na busca: {}", e)))?;

    let total = items.len();
    Ok(Json(serde_json::json!({
        "items": items,
        "query": query.q,
        "total": total,
        "limit": limit,
    })))
}
