//! Storage backend trait definitions

use crate::types::{ObjectPath, SegmentPrefix};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use thiserror::Error;

/// Body of an outbound object write. Consumed exactly once.
pub type ByteStream = BoxStream<'static, Result<Bytes, std::io::Error>>;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Object not found: {0}")]
    NotFound(String),

    /// Transient; the caller may retry the same request.
    #[error("Backend timed out: {0}")]
    Timeout(String),

    #[error("Backend rejected {context} with status {status}")]
    Rejected { status: u16, context: String },

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage error: {0}")]
    Other(String),
}

/// Headers attached to an object write.
#[derive(Debug, Clone, Default)]
pub struct PutOptions {
    pub content_length: Option<u64>,
    pub content_type: Option<String>,
}

/// The subset of an object store's API the upload proxy depends on.
///
/// This trait is object-safe and can be used with `Arc<dyn ObjectStore>`.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Whether an object (or a manifest) exists at `path`.
    async fn head_object(&self, path: &ObjectPath) -> Result<bool, StorageError>;

    /// Names of all objects under a segment namespace, as full object names
    /// within the segment container.
    async fn list_segments(&self, prefix: &SegmentPrefix) -> Result<Vec<String>, StorageError>;

    /// Write an object from a byte stream.
    async fn put_object(
        &self,
        path: &ObjectPath,
        body: ByteStream,
        opts: PutOptions,
    ) -> Result<(), StorageError>;

    /// Write a manifest at `path` that presents every segment under
    /// `segments` as one logical object.
    async fn put_manifest(
        &self,
        path: &ObjectPath,
        segments: &SegmentPrefix,
        content_type: Option<String>,
    ) -> Result<(), StorageError>;

    /// Short backend name for logs.
    fn kind(&self) -> &'static str;
}
