//! Upload intake and signed-link file serving.
//! Bodies are streamed in both directions rather than buffered in memory.

use crate::{
    errors::AppError,
    models::resource::ResourceRecord,
    services::resource_service::NewResource,
    state::AppState,
};
use axum::{
    Json,
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use chrono::Utc;
use futures::StreamExt;
use serde::Deserialize;
use std::io;
use tokio_util::io::ReaderStream;

const TITLE_HEADER: &str = "x-resource-title";
const CATEGORY_HEADER: &str = "x-resource-category";
const DESCRIPTION_HEADER: &str = "x-resource-description";
const DEFAULT_CATEGORY: &str = "general";

/// Query string carried by every signed link.
#[derive(Debug, Deserialize)]
pub struct SignedLinkQuery {
    pub expires: i64,
    pub signature: String,
}

fn header_text(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// `PUT /admin/uploads/{*key}` — store the body and register a resource for it.
pub async fn upload_resource(
    State(state): State<AppState>,
    Path(key): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> Result<(StatusCode, Json<ResourceRecord>), AppError> {
    let title = header_text(&headers, TITLE_HEADER)
        .ok_or_else(|| AppError::bad_request(format!("{} header is required", TITLE_HEADER)))?;
    let category =
        header_text(&headers, CATEGORY_HEADER).unwrap_or_else(|| DEFAULT_CATEGORY.to_string());
    let description = header_text(&headers, DESCRIPTION_HEADER);
    let content_type = header_text(&headers, header::CONTENT_TYPE.as_str());

    let stream = body
        .into_data_stream()
        .map(|chunk| chunk.map_err(io::Error::other));
    let staged = state.objects.stage_stream(&key, stream).await?;
    tracing::debug!(key = %key, etag = %staged.etag, "upload staged");

    let registered = state
        .resources
        .register_upload(
            NewResource {
                title,
                category,
                description,
                object_key: key.clone(),
                content_type,
                size_bytes: staged.size_bytes,
            },
            state.objects.commit(&staged),
        )
        .await;

    // Only reached with an uncommitted file when registration failed.
    state.objects.discard(&staged).await;
    Ok((StatusCode::CREATED, Json(registered?)))
}

/// `GET /files/{*key}?expires=&signature=` — stream the object if the link verifies.
pub async fn serve_file(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(link): Query<SignedLinkQuery>,
) -> Result<Response, AppError> {
    state
        .objects
        .verify(&key, link.expires, &link.signature, Utc::now())?;

    let file = state.objects.open(&key).await?;
    let content_type = match state.resources.content_type_for(&key).await {
        Ok(found) => found,
        Err(err) => {
            tracing::warn!("content type lookup for {} failed: {}", key, err);
            None
        }
    };
    let length = file.metadata().await.map(|m| m.len()).ok();
    let file_name = key.rsplit('/').next().unwrap_or(&key).replace('"', "");

    let mut response = Body::from_stream(ReaderStream::new(file)).into_response();
    let headers = response.headers_mut();
    let content_type = content_type
        .and_then(|value| HeaderValue::from_str(&value).ok())
        .unwrap_or_else(|| HeaderValue::from_static("application/octet-stream"));
    headers.insert(header::CONTENT_TYPE, content_type);
    if let Some(length) = length {
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
    }
    if let Ok(value) = HeaderValue::from_str(&format!("attachment; filename=\"{}\"", file_name)) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    Ok(response)
}
