use tracing::info;

use super::{validate_file_name, UploadError, UploadManager};

impl UploadManager {
    /// Cancels the upload of `file_name` and purges its stored chunks.
    ///
    /// New chunks are rejected as soon as this is called. Chunk writes that
    /// were already accepted are allowed to finish before anything is deleted.
    /// On a failed purge the session stays canceled and the call can simply be
    /// repeated. Returns the number of deleted chunks.
    #[tracing::instrument(skip(self))]
    pub async fn cancel_upload(&self, file_name: &str) -> Result<usize, UploadError> {
        validate_file_name(file_name)?;

        let session = self.registry.mark_canceled(file_name);
        let in_flight = session.pending_count();
        if in_flight > 0 {
            info!(in_flight, "waiting for in-flight chunks before purging");
        }
        session.wait_drained().await;

        let deleted = self.delete_chunks(file_name).await?;
        self.registry.remove(&session);
        self.metrics.uploads_canceled.add(1, &[]);
        info!(deleted, "upload canceled");
        Ok(deleted)
    }
}
