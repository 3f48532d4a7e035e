use axum::{
    body::Body,
    extract::{Path, State},
    response::Response,
    Json,
};

use super::RouteState;
use crate::http_objects::{ApiError, FileMetadata, UploadStatus};

pub async fn download_chunk(
    Path((file_name, chunk_index)): Path<(String, u64)>,
    State(state): State<RouteState>,
) -> Result<Response<Body>, ApiError> {
    let storage_reader = state
        .uploads
        .download_chunk(&file_name, chunk_index)
        .await?;

    Response::builder()
        .header("Content-Type", "application/octet-stream")
        .body(Body::from_stream(storage_reader))
        .map_err(|e| ApiError::internal_error_str(&e.to_string()))
}

pub async fn file_metadata(
    Path(file_name): Path<String>,
    State(state): State<RouteState>,
) -> Result<Json<FileMetadata>, ApiError> {
    let chunk_count = state.uploads.chunk_count(&file_name).await?;
    Ok(Json(FileMetadata { chunk_count }))
}

pub async fn upload_status(
    Path(file_name): Path<String>,
    State(state): State<RouteState>,
) -> Result<Json<UploadStatus>, ApiError> {
    let snapshot = state
        .uploads
        .registry()
        .snapshot(&file_name)
        .ok_or_else(|| ApiError::not_found(&format!("no upload in progress for {}", file_name)))?;
    Ok(Json(snapshot.into()))
}
