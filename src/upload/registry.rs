//! In-memory registry of upload sessions, keyed by upload identity.
//!
//! Sessions live as long as clients keep touching them. After
//! `session_idle_secs` without a request the entry is evicted and any
//! unfinished streamed write is torn down.

use super::session::UploadSession;
use crate::api::UploadError;
use crate::metrics::Metrics;
use crate::storage::ObjectStore;
use crate::types::{ResumableParams, UploadKey};
use moka::notification::RemovalCause;
use moka::sync::Cache;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info};

/// Holder for a session that may still be opening. Concurrent first
/// requests for one identity share the same open.
#[derive(Default)]
struct SessionSlot {
    session: OnceCell<Arc<UploadSession>>,
}

pub struct SessionRegistry {
    sessions: Cache<UploadKey, Arc<SessionSlot>>,
    store: Arc<dyn ObjectStore>,
    reorder_window: u32,
    metrics: Metrics,
    /// Serializes removal of failed sessions.
    replace: Mutex<()>,
}

impl SessionRegistry {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        reorder_window: u32,
        idle_timeout: Duration,
        metrics: Metrics,
    ) -> Self {
        let sessions = Cache::builder()
            .time_to_idle(idle_timeout)
            .eviction_listener(
                |key: Arc<UploadKey>, slot: Arc<SessionSlot>, cause: RemovalCause| {
                    if let Some(session) = slot.session.get() {
                        if cause == RemovalCause::Expired {
                            info!("Upload session {} idle, evicting", key);
                        }
                        session.abandon();
                    }
                },
            )
            .build();
        Self {
            sessions,
            store,
            reorder_window,
            metrics,
            replace: Mutex::new(()),
        }
    }

    /// Session for `key`, opening it on first contact.
    ///
    /// A session whose streamed write failed is replaced by a fresh one, so
    /// the client's next probe starts the upload over. Requests that
    /// disagree with the session's declared sizes are rejected.
    pub async fn get_or_create(
        &self,
        key: UploadKey,
        params: ResumableParams,
    ) -> Result<Arc<UploadSession>, UploadError> {
        loop {
            let slot = self
                .sessions
                .get_with(key.clone(), || Arc::new(SessionSlot::default()));

            let session = slot
                .session
                .get_or_try_init(|| {
                    UploadSession::open(
                        key.clone(),
                        params.clone(),
                        Arc::clone(&self.store),
                        self.reorder_window,
                        self.metrics.clone(),
                    )
                })
                .await?
                .clone();
            self.metrics
                .upload_active_sessions
                .set(self.sessions.entry_count() as i64);

            if session.is_failed() {
                debug!("Replacing failed upload session {}", key);
                self.remove_slot(&key, &slot);
                continue;
            }
            if !session.params().same_upload(&params) {
                return Err(UploadError::MetadataMismatch(format!(
                    "upload {} was started with {} bytes in {} chunks of {}",
                    key,
                    session.params().total_size,
                    session.params().total_chunks,
                    session.params().chunk_size
                )));
            }
            return Ok(session);
        }
    }

    /// Number of sessions held, after pending evictions are applied.
    pub fn session_count(&self) -> usize {
        self.sessions.run_pending_tasks();
        self.sessions.entry_count() as usize
    }

    fn remove_slot(&self, key: &UploadKey, slot: &Arc<SessionSlot>) {
        let _guard = self.replace.lock();
        if let Some(current) = self.sessions.get(key) {
            if Arc::ptr_eq(&current, slot) {
                self.sessions.invalidate(key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FilesystemBackend;
    use crate::types::ObjectPath;
    use tempfile::TempDir;

    fn params(identifier: &str, total_size: u64) -> ResumableParams {
        ResumableParams {
            chunk_size: 4,
            total_size,
            total_chunks: ((total_size + 3) / 4).max(1) as u32,
            content_type: "text/plain".to_string(),
            identifier: identifier.to_string(),
            filename: "a.txt".to_string(),
            relative_path: "a.txt".to_string(),
        }
    }

    fn key(identifier: &str) -> UploadKey {
        UploadKey {
            identifier: identifier.to_string(),
            destination: ObjectPath::new("proj", "cont", "a.txt"),
        }
    }

    async fn registry(dir: &TempDir) -> SessionRegistry {
        let store: Arc<dyn ObjectStore> =
            Arc::new(FilesystemBackend::new(dir.path().to_path_buf()).await.unwrap());
        SessionRegistry::new(store, 1, Duration::from_secs(60), Metrics::new())
    }

    #[tokio::test]
    async fn test_same_identity_shares_session() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir).await;

        let a = registry.get_or_create(key("x"), params("x", 8)).await.unwrap();
        let b = registry.get_or_create(key("x"), params("x", 8)).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        let c = registry.get_or_create(key("y"), params("y", 8)).await.unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(registry.session_count(), 2);
    }

    #[tokio::test]
    async fn test_metadata_mismatch_rejected() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir).await;

        registry.get_or_create(key("x"), params("x", 8)).await.unwrap();
        let err = registry
            .get_or_create(key("x"), params("x", 12))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, UploadError::MetadataMismatch(_)));
    }

    #[tokio::test]
    async fn test_failed_session_is_replaced() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir).await;

        let first = registry.get_or_create(key("x"), params("x", 8)).await.unwrap();
        first.abandon();
        assert!(first.is_failed());

        let second = registry.get_or_create(key("x"), params("x", 8)).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(!second.is_failed());
    }

    #[tokio::test]
    async fn test_invalid_params_do_not_open() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir).await;

        let mut bad = params("x", 8);
        bad.total_chunks = 0;
        let err = registry.get_or_create(key("x"), bad).await.err().unwrap();
        assert!(matches!(err, UploadError::InvalidChunk(_)));

        // The identity stays usable with valid metadata
        let session = registry.get_or_create(key("x"), params("x", 8)).await.unwrap();
        assert!(!session.is_failed());
    }
}
