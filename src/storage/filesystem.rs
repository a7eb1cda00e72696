//! Filesystem-based storage backend
//!
//! Mirrors the Swift layout on a local directory so the proxy can run
//! without an object store:
//! ```text
//! {root}/{account}/{container}/{name}                       # objects
//! {root}/{account}/{container}_segments/{name}/{00000000}    # segments
//! ```
//! A manifest write assembles the segments, in name order, into the object
//! file. That is what a Swift GET of the manifest would return.

use super::traits::{ByteStream, ObjectStore, PutOptions, StorageError};
use crate::types::{ObjectPath, SegmentPrefix};
use async_trait::async_trait;
use futures::StreamExt;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use tempfile::NamedTempFile;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument};

/// ENOSPC raw error code on Linux and macOS.
const ENOSPC: i32 = 28;

/// Convert an io::Error into StorageError, naming disk-full explicitly.
fn io_to_storage_error(e: std::io::Error) -> StorageError {
    if e.raw_os_error() == Some(ENOSPC) {
        StorageError::Other("Insufficient storage space: disk is full".to_string())
    } else {
        StorageError::Io(e)
    }
}

/// Filesystem storage backend
pub struct FilesystemBackend {
    /// Root directory for all data
    root: PathBuf,
}

impl FilesystemBackend {
    /// Create a new filesystem backend with the given root directory.
    pub async fn new(root: PathBuf) -> Result<Self, StorageError> {
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    /// Join untrusted path components under the root, refusing traversal.
    fn resolve(&self, parts: &[&str]) -> Result<PathBuf, StorageError> {
        let mut path = self.root.clone();
        for part in parts {
            for component in Path::new(part).components() {
                match component {
                    Component::Normal(c) => path.push(c),
                    Component::CurDir => {}
                    _ => {
                        return Err(StorageError::Other(format!(
                            "Refusing path component in {:?}",
                            part
                        )))
                    }
                }
            }
        }
        Ok(path)
    }

    fn object_file(&self, path: &ObjectPath) -> Result<PathBuf, StorageError> {
        self.resolve(&[&path.account, &path.container, &path.name])
    }

    /// Stream a body into a temp file next to `target`, then rename it into
    /// place so readers never observe a partial object. A body whose length
    /// differs from `expected_len` never replaces the target.
    async fn write_atomic(
        &self,
        target: &Path,
        mut body: ByteStream,
        expected_len: Option<u64>,
    ) -> Result<u64, StorageError> {
        let parent = target
            .parent()
            .ok_or_else(|| StorageError::Other("Cannot write to a path with no parent".into()))?
            .to_path_buf();
        fs::create_dir_all(&parent).await.map_err(io_to_storage_error)?;

        let tmp = tokio::task::spawn_blocking(move || NamedTempFile::new_in(&parent))
            .await
            .map_err(|e| StorageError::Other(format!("spawn_blocking join failed: {}", e)))?
            .map_err(io_to_storage_error)?;
        let (std_file, tmp_path) = tmp.into_parts();
        let mut file = fs::File::from_std(std_file);

        let mut written = 0u64;
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await.map_err(io_to_storage_error)?;
            written += chunk.len() as u64;
        }
        if let Some(expected) = expected_len {
            if written != expected {
                return Err(StorageError::Other(format!(
                    "Body length {} does not match Content-Length {}",
                    written, expected
                )));
            }
        }
        file.sync_all().await.map_err(io_to_storage_error)?;
        drop(file);

        let target = target.to_path_buf();
        tokio::task::spawn_blocking(move || tmp_path.persist(&target))
            .await
            .map_err(|e| StorageError::Other(format!("spawn_blocking join failed: {}", e)))?
            .map_err(|e| io_to_storage_error(e.error))?;
        Ok(written)
    }
}

#[async_trait]
impl ObjectStore for FilesystemBackend {
    async fn head_object(&self, path: &ObjectPath) -> Result<bool, StorageError> {
        let file = self.object_file(path)?;
        match fs::metadata(&file).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_to_storage_error(e)),
        }
    }

    async fn list_segments(&self, prefix: &SegmentPrefix) -> Result<Vec<String>, StorageError> {
        let dir = self.resolve(&[&prefix.account, &prefix.container, &prefix.prefix])?;
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_to_storage_error(e)),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                // Skip in-progress temp files
                if name.starts_with(".tmp") {
                    continue;
                }
                names.push(format!("{}{}", prefix.prefix, name));
            }
        }
        names.sort();
        Ok(names)
    }

    #[instrument(skip(self, body), fields(path = %path))]
    async fn put_object(
        &self,
        path: &ObjectPath,
        body: ByteStream,
        opts: PutOptions,
    ) -> Result<(), StorageError> {
        let file = self.object_file(path)?;
        let written = self.write_atomic(&file, body, opts.content_length).await?;
        debug!("Stored {} bytes at {:?}", written, file);
        Ok(())
    }

    #[instrument(skip(self, _content_type), fields(path = %path))]
    async fn put_manifest(
        &self,
        path: &ObjectPath,
        segments: &SegmentPrefix,
        _content_type: Option<String>,
    ) -> Result<(), StorageError> {
        let names = self.list_segments(segments).await?;
        let dir = self.resolve(&[&segments.account, &segments.container])?;

        // Concatenate segments into one temp file, then rename into place
        let parent = self
            .object_file(path)?
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| StorageError::Other("Cannot write to a path with no parent".into()))?;
        fs::create_dir_all(&parent).await.map_err(io_to_storage_error)?;
        let target = self.object_file(path)?;

        tokio::task::spawn_blocking(move || -> Result<(), StorageError> {
            let mut tmp = NamedTempFile::new_in(&parent).map_err(io_to_storage_error)?;
            for name in &names {
                let mut segment = std::fs::File::open(dir.join(name)).map_err(io_to_storage_error)?;
                std::io::copy(&mut segment, &mut tmp).map_err(io_to_storage_error)?;
            }
            tmp.flush().map_err(io_to_storage_error)?;
            tmp.as_file().sync_all().map_err(io_to_storage_error)?;
            tmp.persist(&target)
                .map_err(|e| io_to_storage_error(e.error))?;
            Ok(())
        })
        .await
        .map_err(|e| StorageError::Other(format!("spawn_blocking join failed: {}", e)))??;

        debug!("Assembled manifest {} from {}", path, segments.manifest_value());
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "filesystem"
    }
}
