//! HTTP request handlers
//!
//! - `upload` — probe and chunk upload for the resumable protocol
//! - `status` — health check

mod status;
mod upload;

use crate::metrics::Metrics;
use crate::types::{ResumableParams, UploadKey};
use crate::upload::{destination_for, SessionRegistry, UploadSession};
use std::sync::Arc;

use super::errors::UploadError;

pub use status::{health_check, HealthResponse};
pub use upload::{probe_chunk, upload_chunk, ChunkResponse};

/// Application state shared across handlers
pub struct AppState {
    pub sessions: Arc<SessionRegistry>,
    pub metrics: Metrics,
    /// Backend kind, reported by /health
    pub backend: &'static str,
}

impl AppState {
    /// Session for the upload a request belongs to.
    async fn session_for(
        &self,
        project: &str,
        container: &str,
        params: ResumableParams,
    ) -> Result<Arc<UploadSession>, UploadError> {
        let key = UploadKey {
            identifier: params.identifier.clone(),
            destination: destination_for(project, container, &params),
        };
        self.sessions.get_or_create(key, params).await
    }
}
