use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use axum_server::Handle;
use blob_store::BlobStorage;
use tokio::signal;
use tracing::info;

use crate::{
    config::ServerConfig,
    routes::{create_routes, RouteState},
    uploads::UploadManager,
};

const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct Service {
    pub config: ServerConfig,
    pub blob_storage: Arc<BlobStorage>,
    pub uploads: Arc<UploadManager>,
}

impl Service {
    pub async fn new(config: ServerConfig) -> Result<Self> {
        let blob_storage =
            BlobStorage::new(&config.blob_storage).context("error initializing BlobStorage")?;
        Self::with_blob_storage(config, blob_storage).await
    }

    pub async fn with_blob_storage(config: ServerConfig, blob_storage: BlobStorage) -> Result<Self> {
        let blob_storage = Arc::new(blob_storage);
        let uploads = Arc::new(UploadManager::new(
            blob_storage.clone(),
            &config.blob_storage.container,
            config.uploads.clone(),
        ));
        uploads
            .ensure_container()
            .await
            .with_context(|| format!("error creating container {}", config.blob_storage.container))?;

        Ok(Self {
            config,
            blob_storage,
            uploads,
        })
    }

    pub async fn start(&self) -> Result<()> {
        let route_state = RouteState {
            uploads: self.uploads.clone(),
        };

        let handle = Handle::new();
        let handle_sh = handle.clone();
        tokio::spawn(async move {
            shutdown_signal(handle_sh).await;
            info!("graceful shutdown signal received, shutting down server gracefully");
        });

        let addr: SocketAddr = self.config.listen_addr.parse()?;
        info!("server api listening on {}", self.config.listen_addr);
        let routes = create_routes(route_state);
        axum_server::bind(addr)
            .handle(handle)
            .serve(routes.into_make_service())
            .await?;

        Ok(())
    }
}

async fn shutdown_signal(handle: Handle) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("failed to install Ctrl+C handler: {:?}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install signal handler: {:?}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
        },
        _ = terminate => {
        },
    }
    // accepted chunk writes get a chance to finish before the process exits
    handle.graceful_shutdown(Some(GRACEFUL_SHUTDOWN_TIMEOUT));
}

#[cfg(test)]
mod tests {
    use blob_store::BlobStorageConfig;

    use super::Service;
    use crate::{config::ServerConfig, testing::chunk};

    #[tokio::test]
    async fn test_service_on_local_filesystem() -> anyhow::Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let config = ServerConfig {
            blob_storage: BlobStorageConfig::new(temp_dir.path().join("blobs").to_str().unwrap()),
            ..Default::default()
        };
        let service = Service::new(config).await?;
        assert!(service.blob_storage.container_exists("uploads").await?);

        let uploads = &service.uploads;
        uploads.upload_chunk(chunk("report.pdf", 0, b"AAA")).await?;
        uploads.upload_chunk(chunk("report.pdf", 1, b"BBB")).await?;
        assert_eq!(uploads.chunk_count("report.pdf").await?, 2);
        assert_eq!(
            service.blob_storage.read_bytes("uploads", "report.pdf.1").await?.as_ref(),
            b"BBB"
        );

        assert_eq!(uploads.cancel_upload("report.pdf").await?, 2);
        assert_eq!(uploads.chunk_count("report.pdf").await?, 0);
        Ok(())
    }
}
