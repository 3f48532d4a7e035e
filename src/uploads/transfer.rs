use blob_store::PutResult;
use opentelemetry::KeyValue;
use tracing::{debug, warn};

use super::{chunk_key, ensure_container, validate_file_name, ChunkUpload, UploadError, UploadManager};

impl UploadManager {
    /// Stores one chunk and records it as committed.
    ///
    /// Once the chunk is registered as pending the store write runs on its own
    /// task, so dropping the returned future (for example when the client
    /// disconnects) never aborts a write that a cancellation may be waiting on.
    #[tracing::instrument(skip_all, fields(file_name = %upload.file_name, chunk_index = upload.chunk_index))]
    pub async fn upload_chunk(&self, upload: ChunkUpload) -> Result<PutResult, UploadError> {
        if let Err(err) = self.validate_chunk(&upload) {
            self.reject(&err);
            return Err(err);
        }

        let pending = match self.registry.begin_chunk(
            &upload.file_name,
            upload.chunk_index,
            upload.total_chunks,
        ) {
            Ok(pending) => pending,
            Err(err) => {
                self.reject(&err);
                return Err(err);
            }
        };

        let key = chunk_key(&upload.file_name, upload.chunk_index);
        let blob_storage = self.blob_storage.clone();
        let container = self.container.clone();
        let metrics = self.metrics.clone();
        let task_key = key.clone();
        let data = upload.data;
        let write = tokio::spawn(async move {
            let res = async {
                ensure_container(&blob_storage, &container).await?;
                blob_storage.put(&container, &task_key, data).await
            }
            .await;
            match res {
                Ok(put_result) => {
                    pending.commit();
                    metrics.chunks_uploaded.add(1, &[]);
                    metrics.chunk_bytes.add(put_result.size_bytes, &[]);
                    Ok(put_result)
                }
                // dropping `pending` releases the chunk without committing it
                Err(err) => Err(err),
            }
        });

        match write.await {
            Ok(Ok(put_result)) => {
                debug!(key = %put_result.key, size = put_result.size_bytes, "chunk committed");
                Ok(put_result)
            }
            Ok(Err(cause)) => {
                warn!(%key, "chunk write failed: {:#}", cause);
                Err(UploadError::StoreWriteFailed { target: key, cause })
            }
            Err(join_err) => Err(UploadError::StoreWriteFailed {
                target: key,
                cause: anyhow::anyhow!("chunk write task failed: {}", join_err),
            }),
        }
    }

    fn validate_chunk(&self, upload: &ChunkUpload) -> Result<(), UploadError> {
        validate_file_name(&upload.file_name)?;
        if upload.chunk_index > self.limits.max_chunk_index {
            return Err(UploadError::validation(format!(
                "chunk index {} exceeds the maximum of {}",
                upload.chunk_index, self.limits.max_chunk_index
            )));
        }
        if upload.data.len() > self.limits.max_chunk_size_bytes {
            return Err(UploadError::validation(format!(
                "chunk of {} bytes exceeds the maximum of {} bytes",
                upload.data.len(),
                self.limits.max_chunk_size_bytes
            )));
        }
        if let Some(total) = upload.total_chunks {
            if total == 0 || total > self.limits.max_chunk_index.saturating_add(1) {
                return Err(UploadError::validation(format!(
                    "declared chunk count {} is out of range",
                    total
                )));
            }
            if upload.chunk_index >= total {
                return Err(UploadError::validation(format!(
                    "chunk index {} is out of range for {} chunks",
                    upload.chunk_index, total
                )));
            }
        }
        Ok(())
    }

    fn reject(&self, err: &UploadError) {
        let reason = match err {
            UploadError::UploadCanceled { .. } => "canceled",
            _ => "invalid",
        };
        self.metrics
            .chunks_rejected
            .add(1, &[KeyValue::new("reason", reason)]);
        debug!("chunk rejected: {}", err);
    }
}
