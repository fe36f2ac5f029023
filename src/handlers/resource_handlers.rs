//! HTTP handlers for resource listing, download links, stats and admin edits.
//! All work is delegated to `ResourceService`.

use crate::{
    errors::AppError,
    models::resource::{ResourcePatch, ResourceRecord, ResourceStats},
    services::resource_service::{DownloadLink, RefreshSummary},
    state::AppState,
};
use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use serde::Deserialize;
use std::time::Duration;
use uuid::Uuid;

/// Upper bound on how long a download request waits for a link refresh.
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub active_only: Option<bool>,
}

/// `GET /api/resources` — active resources only.
pub async fn list_resources(
    State(state): State<AppState>,
) -> Result<Json<Vec<ResourceRecord>>, AppError> {
    Ok(Json(state.resources.list(true).await?))
}

/// `GET /admin/resources?active_only=` — everything unless filtered.
pub async fn list_all_resources(
    State(state): State<AppState>,
    Query(q): Query<ListQuery>,
) -> Result<Json<Vec<ResourceRecord>>, AppError> {
    let active_only = q.active_only.unwrap_or(false);
    Ok(Json(state.resources.list(active_only).await?))
}

/// `GET /api/resources/{id}` — inactive resources are reported as missing.
pub async fn get_resource(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ResourceRecord>, AppError> {
    let record = state.resources.get(id).await?;
    if !record.is_active {
        return Err(AppError::not_found(format!("resource `{}` not found", id)));
    }
    Ok(Json(record))
}

/// `GET /admin/resources/{id}`
pub async fn get_any_resource(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ResourceRecord>, AppError> {
    Ok(Json(state.resources.get(id).await?))
}

/// `POST /api/resources/{id}/download` — returns a usable link and counts it.
pub async fn download_resource(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<DownloadLink>, AppError> {
    match tokio::time::timeout(DOWNLOAD_TIMEOUT, state.resources.download(id)).await {
        Ok(link) => Ok(Json(link?)),
        Err(_) => Err(AppError::new(
            StatusCode::GATEWAY_TIMEOUT,
            "timed out waiting for a download link",
        )),
    }
}

/// `GET /api/resources/stats`
pub async fn resource_stats(
    State(state): State<AppState>,
) -> Result<Json<ResourceStats>, AppError> {
    Ok(Json(state.resources.stats().await?))
}

/// `POST /admin/resources/refresh-urls` — sweep every active record now.
pub async fn refresh_urls(
    State(state): State<AppState>,
) -> Result<Json<RefreshSummary>, AppError> {
    Ok(Json(state.resources.force_refresh_all().await?))
}

/// `PUT /admin/resources/{id}`
pub async fn update_resource(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(patch): Json<ResourcePatch>,
) -> Result<Json<ResourceRecord>, AppError> {
    Ok(Json(state.resources.update(id, patch).await?))
}

/// `DELETE /admin/resources/{id}` — soft delete.
pub async fn delete_resource(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    state.resources.deactivate(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `DELETE /admin/resources/{id}/purge` — remove the object and the row.
pub async fn purge_resource(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    state.resources.purge(id).await?;
    Ok(StatusCode::NO_CONTENT)
}
