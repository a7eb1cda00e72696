//! Core types for resumable chunked uploads
//!
//! Everything a client declares about an upload arrives on every request as
//! `resumable*` query parameters. The first request for an identity fixes
//! those values for the lifetime of the session.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Uploads at or above this size are written as segments plus a manifest;
/// anything smaller is streamed into a single backend write. (5 GiB)
pub const SEGMENTATION_THRESHOLD: u64 = 5_368_709_120;

/// Suffix appended to a container name to form its segment container.
pub const SEGMENTS_SUFFIX: &str = "_segments";

/// Width of the zero-padded chunk index in segment names. Keeps lexical
/// order of segment names equal to numeric chunk order.
pub const SEGMENT_INDEX_WIDTH: usize = 8;

/// Content type Swift expects on individual large-object segments.
pub const SEGMENT_CONTENT_TYPE: &str = "application/swiftclient-segment";

/// Upload metadata declared by the client, immutable per session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumableParams {
    #[serde(rename = "resumableChunkSize")]
    pub chunk_size: u64,
    #[serde(rename = "resumableTotalSize")]
    pub total_size: u64,
    #[serde(rename = "resumableTotalChunks")]
    pub total_chunks: u32,
    #[serde(rename = "resumableType", default)]
    pub content_type: String,
    #[serde(rename = "resumableIdentifier")]
    pub identifier: String,
    #[serde(rename = "resumableFilename")]
    pub filename: String,
    #[serde(rename = "resumableRelativePath")]
    pub relative_path: String,
}

impl ResumableParams {
    /// Whether this upload is written as segments + manifest.
    pub fn is_segmented(&self) -> bool {
        self.total_size >= SEGMENTATION_THRESHOLD
    }

    /// Declared byte size of chunk `n`. Every chunk is `chunk_size` bytes
    /// except the last, which carries whatever remains.
    pub fn expected_chunk_size(&self, n: u32) -> Option<u64> {
        if n >= self.total_chunks {
            return None;
        }
        if n + 1 < self.total_chunks {
            return Some(self.chunk_size);
        }
        let before = self.chunk_size.checked_mul(u64::from(self.total_chunks - 1))?;
        self.total_size.checked_sub(before)
    }

    /// Basic sanity of the declared numbers.
    pub fn validate(&self) -> Result<(), String> {
        if self.total_chunks == 0 {
            return Err("resumableTotalChunks must be at least 1".to_string());
        }
        if self.chunk_size == 0 {
            return Err("resumableChunkSize must be positive".to_string());
        }
        if self.relative_path.is_empty() {
            return Err("resumableRelativePath must not be empty".to_string());
        }
        if self.expected_chunk_size(self.total_chunks - 1).is_none() {
            return Err(format!(
                "resumableTotalSize {} is smaller than {} chunks of {} bytes",
                self.total_size,
                self.total_chunks - 1,
                self.chunk_size
            ));
        }
        Ok(())
    }

    /// Whether another request describes the same upload.
    pub fn same_upload(&self, other: &ResumableParams) -> bool {
        self.chunk_size == other.chunk_size
            && self.total_size == other.total_size
            && self.total_chunks == other.total_chunks
            && self.relative_path == other.relative_path
    }
}

/// Per-request chunk coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkParams {
    #[serde(rename = "resumableChunkNumber")]
    pub number: u32,
    #[serde(rename = "resumableCurrentChunkSize", default)]
    pub current_size: Option<u64>,
}

/// Location of one backend object.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectPath {
    pub account: String,
    pub container: String,
    pub name: String,
}

impl ObjectPath {
    pub fn new(
        account: impl Into<String>,
        container: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            account: account.into(),
            container: container.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.account, self.container, self.name)
    }
}

/// Namespace holding the segments of one segmented upload:
/// `{container}_segments/{relative_path}/`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SegmentPrefix {
    pub account: String,
    pub container: String,
    pub prefix: String,
}

impl SegmentPrefix {
    /// Segment namespace for a destination object.
    pub fn for_object(dest: &ObjectPath) -> Self {
        Self {
            account: dest.account.clone(),
            container: format!("{}{}", dest.container, SEGMENTS_SUFFIX),
            prefix: format!("{}/", dest.name),
        }
    }

    /// Path of the segment holding chunk `n`.
    pub fn segment(&self, n: u32) -> ObjectPath {
        ObjectPath {
            account: self.account.clone(),
            container: self.container.clone(),
            name: format!(
                "{}{:0width$}",
                self.prefix,
                n,
                width = SEGMENT_INDEX_WIDTH
            ),
        }
    }

    /// Value of the `X-Object-Manifest` header pointing at this namespace.
    pub fn manifest_value(&self) -> String {
        format!("{}/{}", self.container, self.prefix)
    }

    /// Extract the chunk index from a listed segment name. Only names inside
    /// this prefix whose trailing token is numeric qualify.
    pub fn parse_chunk_index(&self, listed_name: &str) -> Option<u32> {
        let rest = listed_name.strip_prefix(&self.prefix)?;
        if rest.is_empty() || rest.contains('/') {
            return None;
        }
        rest.parse().ok()
    }
}

/// Session identity: client identifier plus destination.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UploadKey {
    pub identifier: String,
    pub destination: ObjectPath,
}

impl fmt::Display for UploadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.identifier, self.destination)
    }
}

/// Result of a successful chunk request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// Chunk (or the whole object) was already stored; nothing transferred.
    AlreadyPresent,
    /// Chunk bytes were accepted and are durably accounted for.
    Stored,
}

/// Which ingestion path a session uses. Fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadMode {
    Monolithic,
    Segmented,
}

impl UploadMode {
    pub fn label(&self) -> &'static str {
        match self {
            UploadMode::Monolithic => "monolithic",
            UploadMode::Segmented => "segmented",
        }
    }
}
