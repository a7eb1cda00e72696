//! Per-upload session state machine.
//!
//! A session is created on first contact for an upload identity. Its mode is
//! fixed at that point from the declared total size:
//!
//! - **segmented** (≥ 5 GiB): every chunk is its own backend object in the
//!   segment container; the request whose chunk brings the byte total to the
//!   declared size writes the manifest.
//! - **monolithic**: chunks are reordered into one backend write whose body
//!   is chunk 0 ‖ chunk 1 ‖ … ‖ chunk N-1.
//!
//! Segmented sessions recover progress from the backend's segment listing,
//! so a client that lost its local state can re-probe and skip stored chunks.

use super::payload::ChunkPayload;
use super::producer::{ChunkEntry, OrderedStreamProducer, StreamHandle};
use super::progress::{Claim, Progress, ProgressSnapshot, SessionStatus};
use super::reorder::PushError;
use crate::api::UploadError;
use crate::metrics::Metrics;
use crate::storage::{ObjectStore, PutOptions, StorageError};
use crate::types::{
    ChunkOutcome, ObjectPath, ResumableParams, SegmentPrefix, UploadKey, UploadMode,
    SEGMENT_CONTENT_TYPE,
};
use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::time::Instant;
use tokio::sync::oneshot;
use tracing::{debug, info, instrument, warn};

pub struct UploadSession {
    key: UploadKey,
    params: ResumableParams,
    mode: UploadMode,
    segments: SegmentPrefix,
    store: Arc<dyn ObjectStore>,
    progress: Arc<Progress>,
    reorder_window: u32,
    /// Started on the first accepted chunk of a monolithic session.
    stream: OnceLock<StreamHandle>,
    metrics: Metrics,
}

impl UploadSession {
    /// Create a session and, for segmented uploads, recover chunks the
    /// backend already holds.
    #[instrument(skip_all, fields(upload = %key))]
    pub async fn open(
        key: UploadKey,
        params: ResumableParams,
        store: Arc<dyn ObjectStore>,
        reorder_window: u32,
        metrics: Metrics,
    ) -> Result<Arc<Self>, UploadError> {
        params.validate().map_err(UploadError::InvalidChunk)?;

        let mode = if params.is_segmented() {
            UploadMode::Segmented
        } else {
            UploadMode::Monolithic
        };
        let session = Arc::new(Self {
            segments: SegmentPrefix::for_object(&key.destination),
            progress: Progress::new(params.total_size),
            key,
            params,
            mode,
            store,
            reorder_window,
            stream: OnceLock::new(),
            metrics,
        });

        if mode == UploadMode::Segmented {
            session.discover_segments().await?;
        }
        info!(
            "Opened {} upload session ({} bytes in {} chunks)",
            mode.label(),
            session.params.total_size,
            session.params.total_chunks
        );
        Ok(session)
    }

    /// Seed completed chunks from the segment listing. If every chunk is
    /// already there (interrupted before the manifest), finalize now.
    async fn discover_segments(&self) -> Result<(), UploadError> {
        let names = self
            .timed("list_segments", self.store.list_segments(&self.segments))
            .await?;

        let recovered: Vec<(u32, u64)> = names
            .iter()
            .filter_map(|name| self.segments.parse_chunk_index(name))
            .filter_map(|n| self.params.expected_chunk_size(n).map(|size| (n, size)))
            .collect();
        if recovered.is_empty() {
            return Ok(());
        }

        info!("Recovered {} stored segments", recovered.len());
        self.progress.seed(recovered);

        if self.progress.begin_recovered_finalize() {
            let exists = self
                .timed("head_object", self.store.head_object(&self.key.destination))
                .await?;
            if exists {
                self.progress.end_recovered_finalize(true);
                return Ok(());
            }
            let result = self.write_manifest().await;
            self.progress.end_recovered_finalize(result.is_ok());
            result?;
        }
        Ok(())
    }

    /// Run one backend call, recording its latency whatever the outcome.
    async fn timed<T>(
        &self,
        op: &str,
        call: impl Future<Output = Result<T, StorageError>>,
    ) -> Result<T, StorageError> {
        let started = Instant::now();
        let result = call.await;
        self.metrics.observe_backend(op, started);
        result
    }

    pub fn key(&self) -> &UploadKey {
        &self.key
    }

    pub fn params(&self) -> &ResumableParams {
        &self.params
    }

    pub fn mode(&self) -> UploadMode {
        self.mode
    }

    pub fn progress(&self) -> ProgressSnapshot {
        self.progress.snapshot()
    }

    pub fn is_completed(&self, n: u32) -> bool {
        self.progress.is_completed(n)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.progress.status(), SessionStatus::Failed(_))
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.progress.status(), SessionStatus::Complete)
    }

    /// Existence check for one chunk.
    ///
    /// A present destination object (or manifest) answers for every chunk.
    /// Otherwise only chunks this session has accounted for are present.
    #[instrument(skip(self), fields(upload = %self.key))]
    pub async fn check_chunk(&self, n: u32) -> Result<ChunkOutcome, UploadError> {
        let exists = self
            .timed("head_object", self.store.head_object(&self.key.destination))
            .await?;
        if exists {
            return Ok(ChunkOutcome::AlreadyPresent);
        }
        if self.progress.is_completed(n) {
            return Ok(ChunkOutcome::AlreadyPresent);
        }
        Err(UploadError::NotFound)
    }

    /// Accept one chunk.
    ///
    /// `declared_size` is the client's `resumableCurrentChunkSize`; when given
    /// it must equal the size implied by the session's metadata.
    #[instrument(skip(self, payload), fields(upload = %self.key, mode = self.mode.label()))]
    pub async fn ingest_chunk(
        &self,
        n: u32,
        declared_size: Option<u64>,
        payload: ChunkPayload,
    ) -> Result<ChunkOutcome, UploadError> {
        let size = self.params.expected_chunk_size(n).ok_or_else(|| {
            UploadError::InvalidChunk(format!(
                "chunk {} is out of range for {} chunks",
                n, self.params.total_chunks
            ))
        })?;
        if let Some(declared) = declared_size {
            if declared != size {
                return Err(UploadError::InvalidChunk(format!(
                    "chunk {} declared {} bytes, expected {}",
                    n, declared, size
                )));
            }
        }

        match self.mode {
            UploadMode::Segmented => self.ingest_segment(n, size, payload).await,
            UploadMode::Monolithic => self.ingest_streamed(n, size, payload).await,
        }
    }

    async fn ingest_segment(
        &self,
        n: u32,
        size: u64,
        payload: ChunkPayload,
    ) -> Result<ChunkOutcome, UploadError> {
        let _in_flight = match self.progress.claim(n)? {
            Claim::AlreadyComplete => {
                debug!("Chunk {} already stored, skipping", n);
                return Ok(ChunkOutcome::AlreadyPresent);
            }
            Claim::Claimed(guard) => guard,
        };

        let opts = PutOptions {
            content_length: Some(size),
            content_type: Some(SEGMENT_CONTENT_TYPE.to_string()),
        };
        let segment = self.segments.segment(n);
        self.timed(
            "put_segment",
            self.store.put_object(&segment, payload.into_stream(), opts),
        )
        .await
        .map_err(|e| {
            warn!("Segment {} PUT failed: {}", n, e);
            UploadError::from(e)
        })?;

        if !self.progress.commit_or_finalize(n, size) {
            debug!("Stored segment {}", n);
            return Ok(ChunkOutcome::Stored);
        }

        let result = self.write_manifest().await;
        self.progress.end_finalize(n, size, result.is_ok());
        result?;
        Ok(ChunkOutcome::Stored)
    }

    async fn write_manifest(&self) -> Result<(), UploadError> {
        let content_type = Some(self.params.content_type.clone()).filter(|ct| !ct.is_empty());
        let result = self
            .timed(
                "put_manifest",
                self.store
                    .put_manifest(&self.key.destination, &self.segments, content_type),
            )
            .await;
        self.metrics.record_manifest(result.is_ok());

        match result {
            Ok(()) => {
                info!(
                    "Wrote manifest {} -> {}",
                    self.key.destination,
                    self.segments.manifest_value()
                );
                Ok(())
            }
            Err(e) => {
                warn!("Manifest write for {} failed: {}", self.key.destination, e);
                Err(UploadError::FinalizationFailed(e.to_string()))
            }
        }
    }

    async fn ingest_streamed(
        &self,
        n: u32,
        size: u64,
        payload: ChunkPayload,
    ) -> Result<ChunkOutcome, UploadError> {
        let _in_flight = match self.progress.claim(n)? {
            Claim::AlreadyComplete => return Ok(ChunkOutcome::AlreadyPresent),
            Claim::Claimed(guard) => guard,
        };

        let stream = self.stream.get_or_init(|| {
            OrderedStreamProducer::start(
                Arc::clone(&self.store),
                self.key.destination.clone(),
                PutOptions {
                    content_length: Some(self.params.total_size),
                    content_type: Some(self.params.content_type.clone()),
                },
                self.params.total_chunks,
                self.reorder_window,
                Arc::clone(&self.progress),
            )
        });

        let (done_tx, done_rx) = oneshot::channel();
        let entry = ChunkEntry {
            size,
            payload,
            done: done_tx,
        };
        match stream.buffer.push(n, entry).await {
            Ok(()) => {}
            Err(PushError::Duplicate(n)) => return Err(UploadError::ChunkInFlight(n)),
            Err(PushError::Stale(_)) => return Ok(ChunkOutcome::AlreadyPresent),
            Err(PushError::Closed) => return self.closed_outcome(),
        }

        match done_rx.await {
            Ok(Ok(())) => Ok(ChunkOutcome::Stored),
            Ok(Err(e)) => Err(e),
            Err(_) => self.closed_outcome(),
        }
    }

    /// Outcome for a chunk that could not be queued because the stream ended.
    fn closed_outcome(&self) -> Result<ChunkOutcome, UploadError> {
        match self.progress.status() {
            SessionStatus::Complete => Ok(ChunkOutcome::AlreadyPresent),
            SessionStatus::Failed(e) => Err(e),
            SessionStatus::Active => Err(UploadError::SessionFailed(
                "upload stream closed".to_string(),
            )),
        }
    }

    /// Tear down a session that will not be finished (idle eviction).
    pub fn abandon(&self) {
        if self.is_complete() {
            return;
        }
        let err = self
            .progress
            .fail(UploadError::SessionFailed("upload abandoned".to_string()));
        if let Some(stream) = self.stream.get() {
            if !stream.is_finished() {
                warn!("Abandoning streamed upload {}", self.key);
                stream.abort(err);
            }
        }
    }
}

impl Drop for UploadSession {
    fn drop(&mut self) {
        if let Some(stream) = self.stream.get() {
            if !stream.is_finished() {
                stream.abort(UploadError::SessionFailed("upload session dropped".to_string()));
            }
        }
    }
}

/// Destination of an upload: `{container}/{relativePath}` in `{project}`.
pub fn destination_for(project: &str, container: &str, params: &ResumableParams) -> ObjectPath {
    ObjectPath::new(
        project,
        container,
        params.relative_path.trim_start_matches('/'),
    )
}
