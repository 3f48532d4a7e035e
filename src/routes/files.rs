use axum::{
    extract::{Path, State},
    response::Html,
};

use super::RouteState;
use crate::http_objects::{render_file_list, ApiError, FileListAction};

async fn list_files(state: &RouteState, action: FileListAction) -> Result<Html<String>, ApiError> {
    let html = match state.uploads.list_files().await? {
        Some(files) => render_file_list(&files, action),
        None => action.empty_message().to_string(),
    };
    Ok(Html(html))
}

pub async fn list_files_for_download(
    State(state): State<RouteState>,
) -> Result<Html<String>, ApiError> {
    list_files(&state, FileListAction::Download).await
}

pub async fn list_files_for_delete(
    State(state): State<RouteState>,
) -> Result<Html<String>, ApiError> {
    list_files(&state, FileListAction::Delete).await
}

pub async fn delete_file(
    Path(file_name): Path<String>,
    State(state): State<RouteState>,
) -> Result<&'static str, ApiError> {
    state.uploads.delete_file(&file_name).await?;
    Ok("File deleted successfully")
}

pub async fn delete_all_files(State(state): State<RouteState>) -> Result<&'static str, ApiError> {
    state.uploads.delete_all().await?;
    Ok("All files deleted successfully")
}
