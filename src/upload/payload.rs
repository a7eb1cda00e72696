//! Chunk payload readers.
//!
//! A payload is a one-shot byte stream. HTTP handlers feed it through a
//! bounded channel while the request body is still arriving, so a chunk's
//! bytes flow to the backend without being buffered whole.

use bytes::Bytes;
use futures::stream::{BoxStream, Stream, StreamExt};
use std::io;
use tokio::sync::mpsc;

/// Frames buffered between the request body and the consumer.
const CHANNEL_FRAMES: usize = 8;

pub struct ChunkPayload {
    stream: BoxStream<'static, Result<Bytes, io::Error>>,
}

impl ChunkPayload {
    pub fn from_bytes(data: impl Into<Bytes>) -> Self {
        let data = data.into();
        Self::from_stream(futures::stream::once(async move { Ok(data) }))
    }

    pub fn from_stream<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<Bytes, io::Error>> + Send + 'static,
    {
        Self {
            stream: stream.boxed(),
        }
    }

    /// A payload fed by the returned sender. The stream ends when the sender
    /// is dropped.
    pub fn channel() -> (Self, PayloadSender) {
        let (tx, rx) = mpsc::channel(CHANNEL_FRAMES);
        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        (Self::from_stream(stream), PayloadSender { tx })
    }

    pub fn into_stream(self) -> BoxStream<'static, Result<Bytes, io::Error>> {
        self.stream
    }
}

impl std::fmt::Debug for ChunkPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkPayload").finish_non_exhaustive()
    }
}

/// Write side of [`ChunkPayload::channel`].
pub struct PayloadSender {
    tx: mpsc::Sender<Result<Bytes, io::Error>>,
}

impl PayloadSender {
    /// Forward one frame. Fails once the reader is gone (the chunk was
    /// rejected, already complete, or the session ended).
    pub async fn send(&self, data: Bytes) -> Result<(), PayloadClosed> {
        self.tx.send(Ok(data)).await.map_err(|_| PayloadClosed)
    }

    /// Surface a read error from the client body to the consumer.
    pub async fn fail(&self, err: io::Error) {
        let _ = self.tx.send(Err(err)).await;
    }
}

#[derive(Debug, thiserror::Error)]
#[error("payload reader closed")]
pub struct PayloadClosed;
