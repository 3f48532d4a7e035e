use std::collections::BTreeSet;

use bytes::Bytes;
use futures::{stream::BoxStream, TryStreamExt};
use tracing::info;

use super::{chunk_key, parse_chunk_key, validate_file_name, UploadError, UploadManager};

const DELETE_CONCURRENCY: usize = 16;

impl UploadManager {
    /// Logical file names present in the container, sorted. `None` when the
    /// container does not exist.
    pub async fn list_files(&self) -> Result<Option<BTreeSet<String>>, UploadError> {
        let exists = self
            .blob_storage
            .container_exists(&self.container)
            .await
            .map_err(|cause| self.read_failed(cause))?;
        if !exists {
            return Ok(None);
        }

        let files: BTreeSet<String> = self
            .blob_storage
            .list(&self.container, "", false)
            .try_filter_map(|object| {
                let file_name = parse_chunk_key(&object.name).map(|(name, _)| name.to_string());
                futures::future::ready(Ok(file_name))
            })
            .try_collect()
            .await
            .map_err(|cause| self.read_failed(cause))?;
        Ok(Some(files))
    }

    /// Number of stored chunks of `file_name`.
    pub async fn chunk_count(&self, file_name: &str) -> Result<usize, UploadError> {
        validate_file_name(file_name)?;
        Ok(self.chunk_keys(file_name).await?.len())
    }

    /// Streams one stored chunk.
    pub async fn download_chunk(
        &self,
        file_name: &str,
        chunk_index: u64,
    ) -> Result<BoxStream<'static, anyhow::Result<Bytes>>, UploadError> {
        validate_file_name(file_name)?;
        let key = chunk_key(file_name, chunk_index);
        self.blob_storage
            .get(&self.container, &key)
            .await
            .map_err(|cause| UploadError::StoreReadFailed { target: key, cause })
    }

    /// Deletes every stored chunk of `file_name` and forgets its session if no
    /// write is in flight. Returns the number of deleted chunks.
    #[tracing::instrument(skip(self))]
    pub async fn delete_file(&self, file_name: &str) -> Result<usize, UploadError> {
        validate_file_name(file_name)?;
        let deleted = self.delete_chunks(file_name).await?;
        self.registry.forget_idle(file_name);
        info!(deleted, "deleted file");
        Ok(deleted)
    }

    pub(super) async fn delete_chunks(&self, file_name: &str) -> Result<usize, UploadError> {
        let keys = self.chunk_keys(file_name).await?;
        self.delete_keys(keys).await
    }

    /// Keys of the form `<file_name>.<index>`. Other files sharing the name as
    /// a prefix, such as `video2.0` for `video`, are not included.
    async fn chunk_keys(&self, file_name: &str) -> Result<Vec<String>, UploadError> {
        self.blob_storage
            .list(&self.container, file_name, false)
            .try_filter_map(|object| {
                let is_chunk = parse_chunk_key(&object.name).is_some_and(|(name, _)| name == file_name);
                futures::future::ready(Ok(is_chunk.then_some(object.name)))
            })
            .try_collect()
            .await
            .map_err(|cause| UploadError::StoreReadFailed {
                target: file_name.to_string(),
                cause,
            })
    }

    pub(super) async fn delete_keys(&self, keys: Vec<String>) -> Result<usize, UploadError> {
        let deleted = keys.len();
        futures::stream::iter(keys.into_iter().map(Ok::<_, UploadError>))
            .try_for_each_concurrent(DELETE_CONCURRENCY, |key| async move {
                self.blob_storage
                    .delete(&self.container, &key)
                    .await
                    .map_err(|cause| UploadError::StoreDeleteFailed { target: key, cause })
            })
            .await?;
        self.metrics.objects_deleted.add(deleted as u64, &[]);
        Ok(deleted)
    }

    fn read_failed(&self, cause: anyhow::Error) -> UploadError {
        UploadError::StoreReadFailed {
            target: self.container.clone(),
            cause,
        }
    }
}
