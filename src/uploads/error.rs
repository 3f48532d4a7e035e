#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum UploadError {
    /// Missing or malformed request input, rejected before any state changes.
    #[error("{0}")]
    Validation(String),

    #[error("upload of {file_name} was canceled")]
    UploadCanceled { file_name: String },

    #[error("failed to write {target}: {cause:#}")]
    StoreWriteFailed { target: String, cause: anyhow::Error },

    #[error("failed to read {target}: {cause:#}")]
    StoreReadFailed { target: String, cause: anyhow::Error },

    #[error("failed to delete {target}: {cause:#}")]
    StoreDeleteFailed { target: String, cause: anyhow::Error },

    #[error("container {container} not found")]
    ContainerNotFound { container: String },

    #[error("deletion already in progress")]
    DeletionInProgress,
}

impl UploadError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Failures caused by the object store rather than by the request.
    pub fn is_store_failure(&self) -> bool {
        matches!(
            self,
            Self::StoreWriteFailed { .. } |
                Self::StoreReadFailed { .. } |
                Self::StoreDeleteFailed { .. }
        )
    }
}
