use std::{env, fmt::Debug, sync::Arc};

use anyhow::{anyhow, Context, Result};
use bytes::{Bytes, BytesMut};
use futures::{future, stream::BoxStream, StreamExt, TryStreamExt};
use metrics::{blob_storage, Timer};
use object_store::{
    aws::{AmazonS3Builder, AmazonS3ConfigKey},
    parse_url,
    parse_url_opts,
    path::Path,
    ObjectStore,
    ObjectStoreScheme,
    PutPayload,
};
use opentelemetry::KeyValue;
use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info};
use url::Url;

const CONTAINERS_DIR: &str = "containers";
const OBJECTS_DIR: &str = "objects";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobStorageConfig {
    #[serde(default = "default_blob_store_path")]
    pub path: String,
    #[serde(default = "default_container")]
    pub container: String,
    #[serde(default)]
    pub region: Option<String>,
}

impl BlobStorageConfig {
    pub fn new(path: &str) -> Self {
        BlobStorageConfig {
            path: format!("file://{}", path),
            container: default_container(),
            region: None,
        }
    }
}

impl Default for BlobStorageConfig {
    fn default() -> Self {
        BlobStorageConfig {
            path: default_blob_store_path(),
            container: default_container(),
            region: None,
        }
    }
}

fn default_blob_store_path() -> String {
    format!(
        "file://{}",
        env::current_dir()
            .expect("unable to get current directory")
            .join("chunkstore_storage/blobs")
            .to_str()
            .expect("unable to get path as string")
    )
}

fn default_container() -> String {
    "uploads".to_string()
}

#[derive(Debug, Clone)]
pub struct PutResult {
    pub key: String,
    pub size_bytes: u64,
}

/// A stored object, named relative to its container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub name: String,
    pub size: u64,
}

/// Container-addressed blob storage over any [`ObjectStore`].
///
/// A container is a namespace inside the configured store URL. It exists when
/// its marker object `containers/<name>` exists, and its objects live under
/// `objects/<name>/`.
#[derive(Clone)]
pub struct BlobStorage {
    object_store: Arc<dyn ObjectStore>,
    path: Path,
    metrics: Arc<blob_storage::Metrics>,
}

impl Debug for BlobStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobStorage")
            .field("object_store", &self.object_store.to_string())
            .field("path", &self.path)
            .finish()
    }
}

impl BlobStorage {
    pub fn new(config: &BlobStorageConfig) -> Result<Self> {
        debug!("using blob store path: {}", config.path);
        let (object_store, path) = Self::build_object_store(&config.path, config.region.clone())?;
        Ok(Self::from_object_store(Arc::from(object_store), path))
    }

    pub fn from_object_store(object_store: Arc<dyn ObjectStore>, path: Path) -> Self {
        Self {
            object_store,
            path,
            metrics: Arc::new(blob_storage::Metrics::new()),
        }
    }

    pub fn build_object_store(
        url_str: &str,
        region: Option<String>,
    ) -> Result<(Box<dyn ObjectStore>, Path)> {
        let url = &url_str
            .parse::<Url>()
            .with_context(|| format!("invalid blob store url: {}", url_str))?;
        let (scheme, _) = ObjectStoreScheme::parse(url)?;
        match scheme {
            ObjectStoreScheme::AmazonS3 => {
                // inject AWS environment variables to prioritize keys over instance metadata
                // credentials.
                let opts: Vec<(AmazonS3ConfigKey, String)> = env::vars_os()
                    .filter_map(|(os_key, os_value)| {
                        if let (Some(key), Some(value)) = (os_key.to_str(), os_value.to_str()) {
                            if key.starts_with("AWS_") {
                                if let Ok(config_key) = key.to_ascii_lowercase().parse() {
                                    return Some((config_key, String::from(value)));
                                }
                            }
                        }
                        None
                    })
                    .collect();

                let mut s3_builder = AmazonS3Builder::new().with_url(url_str);
                for (key, value) in opts.iter() {
                    s3_builder = s3_builder.with_config(*key, value.clone());
                }
                if let Some(region) = region {
                    s3_builder = s3_builder.with_region(region);
                }
                // For supporting localstack/minio for testing
                if let Ok(val) = env::var("AWS_ENDPOINT_URL") {
                    if val.starts_with("http://") {
                        s3_builder = s3_builder.with_allow_http(true);
                    }
                    s3_builder = s3_builder.with_endpoint(val);
                }
                let s3 = s3_builder
                    .build()
                    .context("failed to create s3 object store")?;
                let (_, path) = parse_url_opts(url, opts)?;
                info!("using s3 blob store at {}", url_str);
                Ok((Box::new(s3), path))
            }
            ObjectStoreScheme::Local => {
                let dir = url
                    .to_file_path()
                    .map_err(|_| anyhow!("invalid local blob store path: {}", url_str))?;
                std::fs::create_dir_all(&dir).with_context(|| {
                    format!("unable to create blob store directory {}", dir.display())
                })?;
                Ok(parse_url(url)?)
            }
            _ => Ok(parse_url(url)?),
        }
    }

    pub fn get_object_store(&self) -> Arc<dyn ObjectStore> {
        self.object_store.clone()
    }

    fn marker_path(&self, container: &str) -> Path {
        self.path.child(CONTAINERS_DIR).child(container)
    }

    fn container_path(&self, container: &str) -> Path {
        self.path.child(OBJECTS_DIR).child(container)
    }

    fn object_path(&self, container: &str, key: &str) -> Path {
        key.split('/')
            .filter(|part| !part.is_empty())
            .fold(self.container_path(container), |path, part| path.child(part))
    }

    pub async fn container_exists(&self, container: &str) -> Result<bool> {
        let labels = &[KeyValue::new("op", "head")];
        let _timer = Timer::start_with_labels(&self.metrics.operations, labels);
        match self.object_store.head(&self.marker_path(container)).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(anyhow!("can't check container {:?}: {:?}", container, e)),
        }
    }

    pub async fn create_container(&self, container: &str) -> Result<()> {
        let labels = &[KeyValue::new("op", "put")];
        let _timer = Timer::start_with_labels(&self.metrics.operations, labels);
        self.object_store
            .put(&self.marker_path(container), PutPayload::default())
            .await
            .map_err(|e| anyhow!("can't create container {:?}: {:?}", container, e))?;
        info!(container, "created container");
        Ok(())
    }

    /// Removes the container marker. Objects still stored under the container
    /// are left untouched; callers delete them first.
    pub async fn delete_container(&self, container: &str) -> Result<()> {
        let labels = &[KeyValue::new("op", "delete")];
        let _timer = Timer::start_with_labels(&self.metrics.operations, labels);
        match self.object_store.delete(&self.marker_path(container)).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => {
                info!(container, "deleted container");
                Ok(())
            }
            Err(e) => Err(anyhow!("can't delete container {:?}: {:?}", container, e)),
        }
    }

    /// Stores `data` under `key`, replacing any existing object.
    pub async fn put(&self, container: &str, key: &str, data: Bytes) -> Result<PutResult> {
        let labels = &[KeyValue::new("op", "put")];
        let _timer = Timer::start_with_labels(&self.metrics.operations, labels);
        let size_bytes = data.len() as u64;
        self.object_store
            .put(&self.object_path(container, key), PutPayload::from(data))
            .await
            .map_err(|e| anyhow!("can't put object {:?}: {:?}", key, e))?;
        Ok(PutResult {
            key: key.to_string(),
            size_bytes,
        })
    }

    pub async fn get(
        &self,
        container: &str,
        key: &str,
    ) -> Result<BoxStream<'static, Result<Bytes>>> {
        let labels = &[KeyValue::new("op", "get")];
        let _timer = Timer::start_with_labels(&self.metrics.operations, labels);
        let (tx, rx) = mpsc::unbounded_channel();
        let get_result = self
            .object_store
            .get(&self.object_path(container, key))
            .await
            .map_err(|e| match e {
                object_store::Error::NotFound { .. } => {
                    anyhow!(ObjectNotFound(key.to_string()))
                }
                e => anyhow!("can't get object {:?}: {:?}", key, e),
            })?;
        let key = key.to_string();
        tokio::spawn(async move {
            let mut stream = get_result.into_stream();
            while let Some(chunk) = stream.next().await {
                let _ = tx.send(
                    chunk.map_err(|e| anyhow!("error reading object {:?}: {:?}", key.clone(), e)),
                );
            }
        });
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    pub async fn read_bytes(&self, container: &str, key: &str) -> Result<Bytes> {
        let mut reader = self.get(container, key).await?;
        let mut bytes = BytesMut::new();
        while let Some(chunk) = reader.next().await {
            bytes.extend_from_slice(&chunk?);
        }
        Ok(bytes.into())
    }

    /// Lists the objects of `container` whose key starts with `prefix`.
    ///
    /// The returned stream is lazy and can only be consumed once. With
    /// `recursive` unset, keys nested below a `/` are skipped.
    pub fn list(
        &self,
        container: &str,
        prefix: &str,
        recursive: bool,
    ) -> BoxStream<'static, Result<ObjectInfo>> {
        let root = self.container_path(container);
        let prefix = prefix.to_string();
        let container = container.to_string();
        self.object_store
            .list(Some(&root))
            .map_err(move |e| anyhow!("can't list container {:?}: {:?}", container, e))
            .try_filter_map(move |meta| {
                let object = relative_key(&root, &meta.location)
                    .filter(|name| name.starts_with(&prefix))
                    .filter(|name| recursive || !name.contains('/'))
                    .map(|name| ObjectInfo {
                        name,
                        size: meta.size as u64,
                    });
                future::ready(Ok(object))
            })
            .boxed()
    }

    /// Deletes `key`. Deleting a missing object succeeds.
    pub async fn delete(&self, container: &str, key: &str) -> Result<()> {
        let labels = &[KeyValue::new("op", "delete")];
        let _timer = Timer::start_with_labels(&self.metrics.operations, labels);
        match self
            .object_store
            .delete(&self.object_path(container, key))
            .await
        {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(anyhow!("can't delete object {:?}: {:?}", key, e)),
        }
    }
}

/// Returned (wrapped in [`anyhow::Error`]) by [`BlobStorage::get`] for a
/// missing key.
#[derive(Debug)]
pub struct ObjectNotFound(pub String);

impl std::fmt::Display for ObjectNotFound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "object not found: {}", self.0)
    }
}

impl std::error::Error for ObjectNotFound {}

pub fn is_not_found(err: &anyhow::Error) -> bool {
    err.downcast_ref::<ObjectNotFound>().is_some()
}

// Path parts come back percent-encoded; keys are handed out decoded so they
// round-trip through `object_path`.
fn relative_key(root: &Path, location: &Path) -> Option<String> {
    let parts: Vec<String> = location
        .prefix_match(root)?
        .map(|part| percent_decode_str(part.as_ref()).decode_utf8_lossy().into_owned())
        .collect();
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}
