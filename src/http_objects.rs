use std::fmt::Write;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::uploads::{SessionSnapshot, UploadError};

pub const FILE_NAME_HEADER: &str = "x-file-name";
pub const CHUNK_INDEX_HEADER: &str = "x-chunk-index";
pub const TOTAL_CHUNKS_HEADER: &str = "x-total-chunks";

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiError {
    #[serde(skip)]
    status_code: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status_code: StatusCode, message: &str) -> Self {
        Self {
            status_code,
            message: message.to_string(),
        }
    }

    pub fn bad_request(message: &str) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: &str) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn internal_error_str(e: &str) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, e)
    }

    pub fn status_code(&self) -> StatusCode {
        self.status_code
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        error!("API Error: {} - {}", self.status_code, self.message);
        (self.status_code, self.message).into_response()
    }
}

impl From<UploadError> for ApiError {
    fn from(e: UploadError) -> Self {
        let status_code = match &e {
            UploadError::Validation(_) |
            UploadError::UploadCanceled { .. } |
            UploadError::DeletionInProgress => StatusCode::BAD_REQUEST,
            UploadError::ContainerNotFound { .. } => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status_code, &e.to_string())
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    pub chunk_count: usize,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UploadStatus {
    pub file_name: String,
    pub pending_chunks: Vec<u64>,
    pub committed_chunks: Vec<u64>,
    pub canceled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_chunks: Option<u64>,
}

impl From<SessionSnapshot> for UploadStatus {
    fn from(snapshot: SessionSnapshot) -> Self {
        Self {
            file_name: snapshot.file_name,
            pending_chunks: snapshot.pending_chunks,
            committed_chunks: snapshot.committed_chunks,
            canceled: snapshot.canceled,
            expected_chunks: snapshot.expected_chunks,
        }
    }
}

/// Button rendered next to each file of an HTML file list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileListAction {
    Download,
    Delete,
}

impl FileListAction {
    fn class(&self) -> &'static str {
        match self {
            FileListAction::Download => "download-button",
            FileListAction::Delete => "delete-button",
        }
    }

    fn label(&self) -> &'static str {
        match self {
            FileListAction::Download => "Download",
            FileListAction::Delete => "Delete",
        }
    }

    /// Shown instead of a list when the container does not exist.
    pub fn empty_message(&self) -> &'static str {
        match self {
            FileListAction::Download => "No Files to Download :(",
            FileListAction::Delete => "No Files Uploaded Yet!",
        }
    }
}

pub fn render_file_list<'a>(
    files: impl IntoIterator<Item = &'a String>,
    action: FileListAction,
) -> String {
    let mut html = String::new();
    for file_name in files {
        let name = html_escape::encode_safe(file_name);
        let _ = write!(
            html,
            r#"<div class="file-item">{name}<button class="{}" data-filename="{name}">{}</button></div>"#,
            action.class(),
            action.label(),
        );
    }
    html
}
