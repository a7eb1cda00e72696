//! Shared test infrastructure for integration tests
//!
//! Provides an in-memory object store with fault injection, session
//! parameter builders, data generators, and a TestServer that spawns the
//! real binary on a filesystem backend.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::process::{Child, Command};
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use swift_upload_proxy::metrics::Metrics;
use swift_upload_proxy::storage::{ByteStream, ObjectStore, PutOptions, StorageError};
use swift_upload_proxy::types::{ObjectPath, ResumableParams, SegmentPrefix, UploadKey};
use swift_upload_proxy::upload::UploadSession;
use tempfile::TempDir;
use tokio::time::sleep;

/// Port counter to avoid conflicts between tests.
static PORT_COUNTER: AtomicU16 = AtomicU16::new(19400);

pub const GIB: u64 = 1 << 30;
pub const MIB: u64 = 1 << 20;

// === In-memory backend ===

/// In-memory `ObjectStore`.
///
/// Content-Length is recorded, not enforced, so segmented uploads can
/// declare multi-GiB chunks while sending a few bytes each.
#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<BTreeMap<String, Bytes>>,
    manifests: Mutex<HashMap<String, String>>,
    put_log: Mutex<Vec<String>>,
    timeout_puts: Mutex<HashSet<String>>,
    rejected_manifests: AtomicUsize,
    manifest_writes: AtomicUsize,
}

fn key_of(path: &ObjectPath) -> String {
    path.to_string()
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The next PUT to `path` times out without storing anything.
    pub fn time_out_next_put(&self, path: &ObjectPath) {
        self.timeout_puts.lock().insert(key_of(path));
    }

    /// The next `n` manifest writes are rejected with a 500.
    pub fn reject_manifests(&self, n: usize) {
        self.rejected_manifests.store(n, Ordering::SeqCst);
    }

    /// Successful manifest writes so far.
    pub fn manifest_writes(&self) -> usize {
        self.manifest_writes.load(Ordering::SeqCst)
    }

    /// Completed or attempted PUTs to `path`.
    pub fn put_count(&self, path: &ObjectPath) -> usize {
        let key = key_of(path);
        self.put_log.lock().iter().filter(|k| **k == key).count()
    }

    /// Total PUTs of any object.
    pub fn total_puts(&self) -> usize {
        self.put_log.lock().len()
    }

    /// Store an object directly, bypassing the log and faults.
    pub fn insert(&self, path: &ObjectPath, data: impl Into<Bytes>) {
        self.objects.lock().insert(key_of(path), data.into());
    }

    /// Body a GET of `path` would return: the object itself, or the
    /// concatenation of its manifest's segments.
    pub fn object_body(&self, path: &ObjectPath) -> Option<Vec<u8>> {
        let key = key_of(path);
        let objects = self.objects.lock();
        if let Some(data) = objects.get(&key) {
            return Some(data.to_vec());
        }
        let manifest = self.manifests.lock().get(&key).cloned()?;
        let prefix = format!("{}/{}", path.account, manifest);
        Some(
            objects
                .range(prefix.clone()..)
                .take_while(|(k, _)| k.starts_with(&prefix))
                .flat_map(|(_, v)| v.to_vec())
                .collect(),
        )
    }

    pub fn manifest_of(&self, path: &ObjectPath) -> Option<String> {
        self.manifests.lock().get(&key_of(path)).cloned()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn head_object(&self, path: &ObjectPath) -> Result<bool, StorageError> {
        let key = key_of(path);
        Ok(self.objects.lock().contains_key(&key) || self.manifests.lock().contains_key(&key))
    }

    async fn list_segments(&self, prefix: &SegmentPrefix) -> Result<Vec<String>, StorageError> {
        let container = format!("{}/{}/", prefix.account, prefix.container);
        let full = format!("{}{}", container, prefix.prefix);
        Ok(self
            .objects
            .lock()
            .keys()
            .filter(|k| k.starts_with(&full))
            .map(|k| k[container.len()..].to_string())
            .collect())
    }

    async fn put_object(
        &self,
        path: &ObjectPath,
        mut body: ByteStream,
        _opts: PutOptions,
    ) -> Result<(), StorageError> {
        let key = key_of(path);
        self.put_log.lock().push(key.clone());
        if self.timeout_puts.lock().remove(&key) {
            return Err(StorageError::Timeout(format!("PUT {}", key)));
        }

        let mut data = Vec::new();
        while let Some(frame) = body.next().await {
            data.extend_from_slice(&frame?);
        }
        self.objects.lock().insert(key, Bytes::from(data));
        Ok(())
    }

    async fn put_manifest(
        &self,
        path: &ObjectPath,
        segments: &SegmentPrefix,
        _content_type: Option<String>,
    ) -> Result<(), StorageError> {
        let rejected = self
            .rejected_manifests
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if rejected {
            return Err(StorageError::Rejected {
                status: 500,
                context: format!("manifest PUT {}", path),
            });
        }
        self.manifest_writes.fetch_add(1, Ordering::SeqCst);
        self.manifests
            .lock()
            .insert(key_of(path), segments.manifest_value());
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "memory"
    }
}

// === Session helpers ===

/// Declared metadata for an upload of `total_size` bytes in `chunk_size`
/// chunks; the last chunk absorbs the remainder.
pub fn upload_params(total_size: u64, chunk_size: u64, total_chunks: u32) -> ResumableParams {
    ResumableParams {
        chunk_size,
        total_size,
        total_chunks,
        content_type: "application/octet-stream".to_string(),
        identifier: format!("{}-upload.bin", total_size),
        filename: "upload.bin".to_string(),
        relative_path: "incoming/upload.bin".to_string(),
    }
}

pub fn destination() -> ObjectPath {
    ObjectPath::new("project", "container", "incoming/upload.bin")
}

pub fn segment_path(n: u32) -> ObjectPath {
    SegmentPrefix::for_object(&destination()).segment(n)
}

pub async fn open_session(
    store: &Arc<MemoryStore>,
    params: ResumableParams,
    reorder_window: u32,
) -> Arc<UploadSession> {
    open_session_with_metrics(store, params, reorder_window, Metrics::new()).await
}

pub async fn open_session_with_metrics(
    store: &Arc<MemoryStore>,
    params: ResumableParams,
    reorder_window: u32,
    metrics: Metrics,
) -> Arc<UploadSession> {
    let key = UploadKey {
        identifier: params.identifier.clone(),
        destination: destination(),
    };
    UploadSession::open(
        key,
        params,
        store.clone() as Arc<dyn ObjectStore>,
        reorder_window,
        metrics,
    )
    .await
    .expect("session should open")
}

// === Data generators ===

/// Deterministic pseudo-random bytes.
pub fn generate_binary(size: usize, seed: u64) -> Vec<u8> {
    let mut state = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
    (0..size)
        .map(|_| {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            (state >> 33) as u8
        })
        .collect()
}

// === Test server ===

/// Test server wrapper that spawns a real swift_upload_proxy binary
pub struct TestServer {
    process: Child,
    port: u16,
    data_dir: TempDir,
}

impl TestServer {
    /// Start a test server with filesystem backend
    pub async fn filesystem() -> Self {
        Self::filesystem_with_window(1).await
    }

    /// Start a test server with filesystem backend and a custom reorder window
    pub async fn filesystem_with_window(window: u32) -> Self {
        let data_dir = TempDir::new().expect("Failed to create temp dir");
        let port = PORT_COUNTER.fetch_add(1, Ordering::SeqCst);
        let config = format!(
            concat!(
                "listen_addr = \"127.0.0.1:{}\"\n",
                "reorder_window = {}\n\n",
                "[backend]\n",
                "type = \"filesystem\"\n",
                "path = \"{}\"\n",
            ),
            port,
            window,
            data_dir.path().join("store").display()
        );
        let config_path = data_dir.path().join("test.toml");
        std::fs::write(&config_path, &config).expect("Failed to write test config");

        let process = Command::new(env!("CARGO_BIN_EXE_swift_upload_proxy"))
            .env("SUP_CONFIG", &config_path)
            .env("RUST_LOG", "swift_upload_proxy=warn")
            .spawn()
            .expect("Failed to start server");

        let mut server = Self {
            process,
            port,
            data_dir,
        };
        server.wait_ready().await;
        server
    }

    async fn wait_ready(&mut self) {
        let addr = format!("127.0.0.1:{}", self.port);
        for _ in 0..150 {
            if std::net::TcpStream::connect(&addr).is_ok() {
                sleep(Duration::from_millis(100)).await;
                return;
            }

            if let Ok(Some(status)) = self.process.try_wait() {
                panic!("Server exited before becoming ready: {}", status);
            }

            sleep(Duration::from_millis(100)).await;
        }

        let _ = self.process.kill();
        panic!("Timed out waiting for server on {}", addr);
    }

    /// Get the HTTP endpoint URL
    pub fn endpoint(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    /// Path of an object in the filesystem backend
    pub fn object_file(&self, project: &str, container: &str, name: &str) -> std::path::PathBuf {
        self.data_dir
            .path()
            .join("store")
            .join(project)
            .join(container)
            .join(name)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = self.process.kill();
    }
}
