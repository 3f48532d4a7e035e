use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
        Mutex,
    },
};

use anyhow::Result;
use async_trait::async_trait;
use blob_store::BlobStorage;
use bytes::Bytes;
use futures::{stream::BoxStream, TryStreamExt};
use object_store::{
    memory::InMemory,
    path::Path,
    GetOptions,
    GetResult,
    ListResult,
    MultipartUpload,
    ObjectMeta,
    ObjectStore,
    PutMultipartOptions,
    PutOptions,
    PutPayload,
    PutResult,
};
use tokio::sync::watch;
use tracing::subscriber;
use tracing_subscriber::{layer::SubscriberExt, Layer};

use crate::{
    config::ServerConfig,
    service::Service,
    uploads::{ChunkUpload, UploadConfig, UploadManager},
};

pub fn chunk(file_name: &str, chunk_index: u64, data: &[u8]) -> ChunkUpload {
    ChunkUpload {
        file_name: file_name.to_string(),
        chunk_index,
        total_chunks: None,
        data: Bytes::copy_from_slice(data),
    }
}

pub struct TestService {
    pub blob_storage: Arc<BlobStorage>,
    pub uploads: Arc<UploadManager>,
    pub gate: GatedStore,
}

impl TestService {
    pub async fn new() -> Result<Self> {
        Self::with_limits(UploadConfig::default()).await
    }

    pub async fn with_limits(limits: UploadConfig) -> Result<Self> {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug"));
        let _ = subscriber::set_global_default(
            tracing_subscriber::registry()
                .with(tracing_subscriber::fmt::layer().with_filter(env_filter)),
        );

        let gate = GatedStore::new();
        let blob_storage =
            BlobStorage::from_object_store(Arc::new(gate.clone()), Path::default());
        let cfg = ServerConfig {
            uploads: limits,
            ..Default::default()
        };
        let service = Service::with_blob_storage(cfg, blob_storage).await?;

        Ok(Self {
            blob_storage: service.blob_storage.clone(),
            uploads: service.uploads.clone(),
            gate,
        })
    }

    /// Stored keys of the default container, sorted.
    pub async fn keys(&self) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self
            .blob_storage
            .list(self.uploads.container(), "", true)
            .map_ok(|object| object.name)
            .try_collect()
            .await?;
        keys.sort();
        Ok(keys)
    }

    pub async fn read(&self, key: &str) -> Result<Bytes> {
        self.blob_storage
            .read_bytes(self.uploads.container(), key)
            .await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    PutStarted(String),
    PutFinished(String),
    Delete(String),
}

#[derive(Debug)]
struct Gate {
    closed: watch::Sender<bool>,
    waiting: watch::Sender<usize>,
}

impl Gate {
    fn new() -> Self {
        Self {
            closed: watch::channel(false).0,
            waiting: watch::channel(0).0,
        }
    }

    async fn pass(&self) {
        let mut closed = self.closed.subscribe();
        if !*closed.borrow_and_update() {
            return;
        }
        self.waiting.send_modify(|n| *n += 1);
        let _ = closed.wait_for(|closed| !*closed).await;
        self.waiting.send_modify(|n| *n -= 1);
    }

    async fn wait_for_waiting(&self, count: usize) {
        let mut waiting = self.waiting.subscribe();
        let _ = waiting.wait_for(|n| *n >= count).await;
    }
}

#[derive(Debug)]
struct GateState {
    puts: Gate,
    deletes: Gate,
    fail_puts: AtomicBool,
    fail_deletes: AtomicBool,
    started_puts: AtomicUsize,
    events: Mutex<Vec<StoreEvent>>,
}

/// In-memory object store whose chunk writes and deletes can be held back or
/// made to fail. Container markers pass through untouched.
#[derive(Debug, Clone)]
pub struct GatedStore {
    inner: Arc<InMemory>,
    state: Arc<GateState>,
}

impl GatedStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(InMemory::new()),
            state: Arc::new(GateState {
                puts: Gate::new(),
                deletes: Gate::new(),
                fail_puts: AtomicBool::new(false),
                fail_deletes: AtomicBool::new(false),
                started_puts: AtomicUsize::new(0),
                events: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn hold_puts(&self) {
        self.state.puts.closed.send_replace(true);
    }

    pub fn release_puts(&self) {
        self.state.puts.closed.send_replace(false);
    }

    pub async fn wait_for_held_puts(&self, count: usize) {
        self.state.puts.wait_for_waiting(count).await;
    }

    pub fn hold_deletes(&self) {
        self.state.deletes.closed.send_replace(true);
    }

    pub fn release_deletes(&self) {
        self.state.deletes.closed.send_replace(false);
    }

    pub async fn wait_for_held_deletes(&self, count: usize) {
        self.state.deletes.wait_for_waiting(count).await;
    }

    pub fn fail_puts(&self, fail: bool) {
        self.state.fail_puts.store(fail, Ordering::SeqCst);
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.state.fail_deletes.store(fail, Ordering::SeqCst);
    }

    pub fn started_puts(&self) -> usize {
        self.state.started_puts.load(Ordering::SeqCst)
    }

    pub fn events(&self) -> Vec<StoreEvent> {
        self.state.events.lock().unwrap().clone()
    }

    pub fn deletes(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                StoreEvent::Delete(key) => Some(key),
                _ => None,
            })
            .collect()
    }

    fn record(&self, event: StoreEvent) {
        self.state.events.lock().unwrap().push(event);
    }
}

impl Default for GatedStore {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for GatedStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GatedStore({})", self.inner)
    }
}

// only objects of a container are gated, container markers are not
fn chunk_name(location: &Path) -> Option<String> {
    if !location.as_ref().starts_with("objects/") {
        return None;
    }
    location.filename().map(str::to_string)
}

fn injected(what: &str) -> object_store::Error {
    object_store::Error::Generic {
        store: "GatedStore",
        source: format!("injected {} failure", what).into(),
    }
}

#[async_trait]
impl ObjectStore for GatedStore {
    async fn put_opts(
        &self,
        location: &Path,
        payload: PutPayload,
        opts: PutOptions,
    ) -> object_store::Result<PutResult> {
        let Some(name) = chunk_name(location) else {
            return self.inner.put_opts(location, payload, opts).await;
        };
        self.state.started_puts.fetch_add(1, Ordering::SeqCst);
        self.record(StoreEvent::PutStarted(name.clone()));
        self.state.puts.pass().await;
        if self.state.fail_puts.load(Ordering::SeqCst) {
            return Err(injected("put"));
        }
        let res = self.inner.put_opts(location, payload, opts).await?;
        self.record(StoreEvent::PutFinished(name));
        Ok(res)
    }

    async fn put_multipart_opts(
        &self,
        location: &Path,
        opts: PutMultipartOptions,
    ) -> object_store::Result<Box<dyn MultipartUpload>> {
        self.inner.put_multipart_opts(location, opts).await
    }

    async fn get_opts(&self, location: &Path, options: GetOptions) -> object_store::Result<GetResult> {
        self.inner.get_opts(location, options).await
    }

    async fn delete(&self, location: &Path) -> object_store::Result<()> {
        let Some(name) = chunk_name(location) else {
            return self.inner.delete(location).await;
        };
        self.record(StoreEvent::Delete(name));
        self.state.deletes.pass().await;
        if self.state.fail_deletes.load(Ordering::SeqCst) {
            return Err(injected("delete"));
        }
        self.inner.delete(location).await
    }

    fn list(&self, prefix: Option<&Path>) -> BoxStream<'static, object_store::Result<ObjectMeta>> {
        self.inner.list(prefix)
    }

    async fn list_with_delimiter(&self, prefix: Option<&Path>) -> object_store::Result<ListResult> {
        self.inner.list_with_delimiter(prefix).await
    }

    async fn copy(&self, from: &Path, to: &Path) -> object_store::Result<()> {
        self.inner.copy(from, to).await
    }

    async fn copy_if_not_exists(&self, from: &Path, to: &Path) -> object_store::Result<()> {
        self.inner.copy_if_not_exists(from, to).await
    }
}
