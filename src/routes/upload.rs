use axum::{extract::State, http::HeaderMap};
use base64::{engine::general_purpose::STANDARD, Engine};
use bytes::Bytes;

use super::RouteState;
use crate::{
    http_objects::{ApiError, CHUNK_INDEX_HEADER, FILE_NAME_HEADER, TOTAL_CHUNKS_HEADER},
    uploads::ChunkUpload,
};

/// Reads the base64 encoded logical file name.
fn file_name_from_headers(headers: &HeaderMap) -> Result<String, ApiError> {
    let encoded = headers
        .get(FILE_NAME_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ApiError::bad_request("file name required"))?;
    let decoded = STANDARD
        .decode(encoded.trim())
        .map_err(|e| ApiError::bad_request(&format!("invalid {} header: {}", FILE_NAME_HEADER, e)))?;
    String::from_utf8(decoded)
        .map_err(|_| ApiError::bad_request("file name is not valid utf-8"))
}

fn u64_header(headers: &HeaderMap, name: &str) -> Result<Option<u64>, ApiError> {
    let Some(value) = headers.get(name) else {
        return Ok(None);
    };
    value
        .to_str()
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Some)
        .ok_or_else(|| ApiError::bad_request(&format!("{} must be a non-negative integer", name)))
}

#[tracing::instrument(skip_all)]
pub async fn upload_chunk(
    State(state): State<RouteState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<&'static str, ApiError> {
    let file_name = file_name_from_headers(&headers)?;
    let chunk_index = u64_header(&headers, CHUNK_INDEX_HEADER)?
        .ok_or_else(|| ApiError::bad_request("chunk index required"))?;
    let total_chunks = u64_header(&headers, TOTAL_CHUNKS_HEADER)?;

    state
        .uploads
        .upload_chunk(ChunkUpload {
            file_name,
            chunk_index,
            total_chunks,
            data: body,
        })
        .await?;
    Ok("Chunk uploaded successfully")
}

#[tracing::instrument(skip_all)]
pub async fn cancel_upload(
    State(state): State<RouteState>,
    headers: HeaderMap,
) -> Result<&'static str, ApiError> {
    let file_name = file_name_from_headers(&headers)?;
    state.uploads.cancel_upload(&file_name).await?;
    Ok("Canceled upload and deleted partial uploaded chunks")
}
