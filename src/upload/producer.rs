//! Ordered stream producer for non-segmented uploads.
//!
//! One task per session drains the reorder buffer in chunk order and feeds
//! the body of the session's single backend write. It is the only writer of
//! the session's accounting in this mode.

use super::payload::ChunkPayload;
use super::progress::Progress;
use super::reorder::ReorderBuffer;
use crate::api::UploadError;
use crate::storage::{ObjectStore, PutOptions, StorageError};
use crate::types::ObjectPath;
use bytes::Bytes;
use futures::StreamExt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, warn};

/// Frames buffered between the producer and the outbound write.
const BODY_FRAMES: usize = 4;

/// One queued chunk.
pub struct ChunkEntry {
    pub size: u64,
    pub payload: ChunkPayload,
    /// Resolved once the chunk is accounted for, or the session fails.
    pub done: oneshot::Sender<Result<(), UploadError>>,
}

/// Handle kept by the session while the stream is running.
pub struct StreamHandle {
    pub buffer: Arc<ReorderBuffer<ChunkEntry>>,
    task: JoinHandle<()>,
    write: AbortHandle,
}

impl StreamHandle {
    /// Cancel the backend write, stop consuming and fail every queued chunk.
    pub fn abort(&self, reason: UploadError) {
        self.write.abort();
        for (_, entry) in self.buffer.close() {
            let _ = entry.done.send(Err(reason.clone()));
        }
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

pub struct OrderedStreamProducer {
    buffer: Arc<ReorderBuffer<ChunkEntry>>,
    progress: Arc<Progress>,
    total_chunks: u32,
    body: Option<mpsc::Sender<Result<Bytes, io::Error>>>,
    /// Set just before the body is ended after the last chunk.
    sealed: Arc<AtomicBool>,
    write: Option<JoinHandle<Result<(), StorageError>>>,
    destination: ObjectPath,
}

impl OrderedStreamProducer {
    /// Start the single outbound write and its consumer task.
    pub fn start(
        store: Arc<dyn ObjectStore>,
        destination: ObjectPath,
        opts: PutOptions,
        total_chunks: u32,
        window: u32,
        progress: Arc<Progress>,
    ) -> StreamHandle {
        let buffer = Arc::new(ReorderBuffer::new(window));
        let (body_tx, body_rx) = mpsc::channel(BODY_FRAMES);
        let sealed = Arc::new(AtomicBool::new(false));

        // The body only ends cleanly once sealed. If the sender goes away
        // earlier the write sees an error instead of a short object.
        let body = {
            let sealed = Arc::clone(&sealed);
            futures::stream::unfold(Some(body_rx), move |rx| {
                let sealed = Arc::clone(&sealed);
                async move {
                    let mut rx = rx?;
                    match rx.recv().await {
                        Some(item) => Some((item, Some(rx))),
                        None if sealed.load(Ordering::Acquire) => None,
                        None => Some((
                            Err(io::Error::other("upload aborted before its last chunk")),
                            None,
                        )),
                    }
                }
            })
            .boxed()
        };
        let write = {
            let destination = destination.clone();
            tokio::spawn(async move { store.put_object(&destination, body, opts).await })
        };
        let write_abort = write.abort_handle();
        info!("Started streamed write to {}", destination);

        let producer = Self {
            buffer: Arc::clone(&buffer),
            progress,
            total_chunks,
            body: Some(body_tx),
            sealed,
            write: Some(write),
            destination,
        };
        let task = tokio::spawn(producer.run());
        StreamHandle {
            buffer,
            task,
            write: write_abort,
        }
    }

    async fn run(mut self) {
        while let Some((n, entry)) = self.buffer.pop_next().await {
            let ChunkEntry {
                size,
                payload,
                done,
            } = entry;

            if let Err(e) = self.forward(n, size, payload).await {
                let _ = done.send(Err(self.fail(e)));
                return;
            }

            if n + 1 < self.total_chunks {
                self.progress.commit(n, size);
                let _ = done.send(Ok(()));
                self.buffer.advance();
                continue;
            }

            // Last chunk: end the body and wait for the backend to accept the
            // object before reporting anything as complete.
            self.sealed.store(true, Ordering::Release);
            self.body = None;
            match self.finish_write().await {
                Ok(()) => {
                    self.progress.commit(n, size);
                    self.progress.complete();
                    self.buffer.advance();
                    self.buffer.close();
                    info!("Streamed write to {} complete", self.destination);
                    let _ = done.send(Ok(()));
                }
                Err(e) => {
                    let _ = done.send(Err(self.fail(e)));
                }
            }
            return;
        }
        debug!("Reorder buffer closed, producer for {} exiting", self.destination);
    }

    /// Copy one payload into the outbound body, checking its length.
    async fn forward(&mut self, n: u32, size: u64, payload: ChunkPayload) -> Result<(), UploadError> {
        let mut stream = payload.into_stream();
        let mut seen = 0u64;
        while let Some(frame) = stream.next().await {
            let frame = frame.map_err(|e| {
                UploadError::SessionFailed(format!("reading chunk {} failed: {}", n, e))
            })?;
            seen += frame.len() as u64;
            if seen > size {
                return Err(UploadError::SessionFailed(format!(
                    "chunk {} is longer than its declared {} bytes",
                    n, size
                )));
            }
            let sent = match &self.body {
                Some(body) => body.send(Ok(frame)).await.is_ok(),
                None => false,
            };
            if !sent {
                // The write ended early; its result says why
                return Err(self.finish_write().await.err().unwrap_or_else(|| {
                    UploadError::SessionFailed("backend write ended early".to_string())
                }));
            }
        }
        if seen != size {
            return Err(UploadError::SessionFailed(format!(
                "chunk {} carried {} bytes, declared {}",
                n, seen, size
            )));
        }
        Ok(())
    }

    async fn finish_write(&mut self) -> Result<(), UploadError> {
        let Some(write) = self.write.take() else {
            return Err(UploadError::SessionFailed(
                "backend write already finished".to_string(),
            ));
        };
        match write.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(StorageError::Timeout(msg))) => Err(UploadError::Timeout(msg)),
            Ok(Err(e)) => Err(UploadError::FinalizationFailed(e.to_string())),
            Err(join) => Err(UploadError::SessionFailed(format!(
                "backend write task failed: {}",
                join
            ))),
        }
    }

    /// Record the failure, abort the write and fail every queued chunk.
    fn fail(&mut self, err: UploadError) -> UploadError {
        let err = self.progress.fail(err);
        warn!("Streamed upload to {} failed: {}", self.destination, err);
        if let Some(write) = self.write.take() {
            write.abort();
        }
        // Poison the body so a write that is still running cannot finish
        if let Some(body) = self.body.take() {
            let _ = body.try_send(Err(io::Error::other("upload aborted")));
        }
        for (_, entry) in self.buffer.close() {
            let _ = entry.done.send(Err(err.clone()));
        }
        err
    }
}
