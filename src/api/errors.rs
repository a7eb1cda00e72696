//! Upload error types and their HTTP responses

use crate::storage::StorageError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

/// Errors surfaced to upload clients. Each maps to exactly one status.
#[derive(Debug, Clone, Error)]
pub enum UploadError {
    /// Chunk not stored yet; the client should send it.
    #[error("Chunk not yet uploaded")]
    NotFound,

    /// Backend did not answer in time. Retryable; session state is intact.
    #[error("Backend timed out: {0}")]
    Timeout(String),

    /// The manifest / final write was rejected. The object is incomplete.
    #[error("Finalization failed: {0}")]
    FinalizationFailed(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Invalid chunk: {0}")]
    InvalidChunk(String),

    /// The same chunk number is already being transferred by another request.
    #[error("Chunk {0} is already in flight")]
    ChunkInFlight(u32),

    #[error("Upload metadata does not match the existing session: {0}")]
    MetadataMismatch(String),

    /// The streamed write broke; the upload must restart from scratch.
    #[error("Upload session failed: {0}")]
    SessionFailed(String),
}

impl UploadError {
    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            UploadError::NotFound => "NotFound",
            UploadError::Timeout(_) => "Timeout",
            UploadError::FinalizationFailed(_) => "FinalizationFailed",
            UploadError::Backend(_) => "BackendError",
            UploadError::InvalidChunk(_) => "InvalidChunk",
            UploadError::ChunkInFlight(_) => "ChunkInFlight",
            UploadError::MetadataMismatch(_) => "MetadataMismatch",
            UploadError::SessionFailed(_) => "SessionFailed",
        }
    }

    /// Get the HTTP status code
    pub fn status_code(&self) -> StatusCode {
        match self {
            UploadError::NotFound => StatusCode::NOT_FOUND,
            UploadError::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
            UploadError::FinalizationFailed(_) => StatusCode::BAD_REQUEST,
            UploadError::Backend(_) => StatusCode::BAD_GATEWAY,
            UploadError::InvalidChunk(_) => StatusCode::BAD_REQUEST,
            UploadError::ChunkInFlight(_) => StatusCode::CONFLICT,
            UploadError::MetadataMismatch(_) => StatusCode::BAD_REQUEST,
            UploadError::SessionFailed(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for UploadError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = serde_json::json!({
            "code": self.code(),
            "message": self.to_string(),
        });

        (status, Json(body)).into_response()
    }
}

impl From<StorageError> for UploadError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Timeout(msg) => UploadError::Timeout(msg),
            other => UploadError::Backend(other.to_string()),
        }
    }
}
