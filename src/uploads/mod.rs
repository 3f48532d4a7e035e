//! Chunked upload coordination over the blob store.
//!
//! A logical file is stored as one object per chunk, keyed
//! `<file name>.<chunk index>`. The [`UploadRegistry`] tracks which chunks of
//! each file are in flight so that a cancellation can wait for them before it
//! purges the file.

mod cancel;
mod deletion;
mod error;
mod listing;
mod registry;
mod transfer;

use std::sync::Arc;

use anyhow::Result;
use blob_store::BlobStorage;
use bytes::Bytes;
pub use deletion::DeletionGuard;
pub use error::UploadError;
use metrics::upload_stats;
pub use registry::{SessionSnapshot, UploadRegistry};
use serde::{Deserialize, Serialize};
use tracing::info;

const MAX_FILE_NAME_BYTES: usize = 1024;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UploadConfig {
    #[serde(default = "default_max_chunk_size_bytes")]
    pub max_chunk_size_bytes: usize,
    #[serde(default = "default_max_chunk_index")]
    pub max_chunk_index: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_chunk_size_bytes: default_max_chunk_size_bytes(),
            max_chunk_index: default_max_chunk_index(),
        }
    }
}

fn default_max_chunk_size_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_max_chunk_index() -> u64 {
    100_000
}

/// One chunk as received from a client.
#[derive(Debug, Clone)]
pub struct ChunkUpload {
    pub file_name: String,
    pub chunk_index: u64,
    pub total_chunks: Option<u64>,
    pub data: Bytes,
}

pub fn chunk_key(file_name: &str, chunk_index: u64) -> String {
    format!("{}.{}", file_name, chunk_index)
}

/// Splits a stored key into its file name and chunk index. Keys whose last
/// `.` segment is not an index are not chunks.
pub fn parse_chunk_key(key: &str) -> Option<(&str, u64)> {
    let (file_name, index) = key.rsplit_once('.')?;
    if file_name.is_empty() || index.is_empty() || !index.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((file_name, index.parse().ok()?))
}

pub fn validate_file_name(file_name: &str) -> Result<(), UploadError> {
    if file_name.is_empty() {
        return Err(UploadError::validation("file name is empty"));
    }
    if file_name.len() > MAX_FILE_NAME_BYTES {
        return Err(UploadError::validation(format!(
            "file name is longer than {} bytes",
            MAX_FILE_NAME_BYTES
        )));
    }
    if file_name.contains('/') || file_name.chars().any(char::is_control) {
        return Err(UploadError::validation(
            "file name must not contain '/' or control characters",
        ));
    }
    Ok(())
}

/// Owns the upload state of one container: the session registry, the bulk
/// deletion guard and the blob store they coordinate.
#[derive(Debug)]
pub struct UploadManager {
    blob_storage: Arc<BlobStorage>,
    container: String,
    registry: UploadRegistry,
    deletion_guard: DeletionGuard,
    limits: UploadConfig,
    metrics: Arc<upload_stats::Metrics>,
}

impl UploadManager {
    pub fn new(blob_storage: Arc<BlobStorage>, container: &str, limits: UploadConfig) -> Self {
        Self {
            blob_storage,
            container: container.to_string(),
            registry: UploadRegistry::new(),
            deletion_guard: DeletionGuard::new(),
            limits,
            metrics: Arc::new(upload_stats::Metrics::new()),
        }
    }

    pub fn container(&self) -> &str {
        &self.container
    }

    pub fn limits(&self) -> &UploadConfig {
        &self.limits
    }

    pub fn registry(&self) -> &UploadRegistry {
        &self.registry
    }

    pub fn deletion_guard(&self) -> &DeletionGuard {
        &self.deletion_guard
    }

    /// Creates the container if it does not exist yet.
    pub async fn ensure_container(&self) -> Result<()> {
        ensure_container(&self.blob_storage, &self.container).await
    }
}

async fn ensure_container(blob_storage: &BlobStorage, container: &str) -> Result<()> {
    if !blob_storage.container_exists(container).await? {
        blob_storage.create_container(container).await?;
        info!(container, "container did not exist, created it");
    }
    Ok(())
}
