use std::sync::atomic::{AtomicBool, Ordering};

use futures::TryStreamExt;
use tracing::info;

use super::{UploadError, UploadManager};

/// Process-wide flag that lets only one container wipe run at a time.
#[derive(Debug, Default)]
pub struct DeletionGuard {
    in_progress: AtomicBool,
}

impl DeletionGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims the flag, or fails right away if another wipe holds it.
    pub fn try_acquire(&self) -> Result<DeletionPermit<'_>, UploadError> {
        self.in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| UploadError::DeletionInProgress)?;
        Ok(DeletionPermit { guard: self })
    }

    pub fn is_held(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }
}

/// Releases the [`DeletionGuard`] when dropped, whatever the outcome of the
/// wipe.
#[derive(Debug)]
pub struct DeletionPermit<'a> {
    guard: &'a DeletionGuard,
}

impl Drop for DeletionPermit<'_> {
    fn drop(&mut self) {
        self.guard.in_progress.store(false, Ordering::Release);
    }
}

impl UploadManager {
    /// Deletes every object of the container and then the container itself.
    #[tracing::instrument(skip(self), fields(container = %self.container))]
    pub async fn delete_all(&self) -> Result<usize, UploadError> {
        let _permit = self.deletion_guard.try_acquire()?;

        let exists = self
            .blob_storage
            .container_exists(&self.container)
            .await
            .map_err(|cause| UploadError::StoreReadFailed {
                target: self.container.clone(),
                cause,
            })?;
        if !exists {
            return Err(UploadError::ContainerNotFound {
                container: self.container.clone(),
            });
        }

        let keys: Vec<String> = self
            .blob_storage
            .list(&self.container, "", true)
            .map_ok(|object| object.name)
            .try_collect()
            .await
            .map_err(|cause| UploadError::StoreReadFailed {
                target: self.container.clone(),
                cause,
            })?;
        let deleted = self.delete_keys(keys).await?;

        self.blob_storage
            .delete_container(&self.container)
            .await
            .map_err(|cause| UploadError::StoreDeleteFailed {
                target: self.container.clone(),
                cause,
            })?;
        let forgotten = self.registry.forget_all_idle();
        info!(deleted, forgotten, "deleted all files");
        Ok(deleted)
    }
}
