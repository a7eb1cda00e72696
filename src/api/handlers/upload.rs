//! Resumable chunk protocol: probe (GET) and upload (POST).

use super::{AppState, UploadError};
use crate::metrics::outcome_label;
use crate::types::{ChunkOutcome, ChunkParams, ResumableParams};
use crate::upload::{ChunkPayload, PayloadSender};
use axum::extract::multipart::Field;
use axum::extract::{Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;
use std::io;
use std::sync::Arc;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

/// Body of a successful chunk upload.
#[derive(Debug, Serialize)]
pub struct ChunkResponse {
    pub chunk: u32,
    pub uploaded_bytes: u64,
    pub total_bytes: u64,
    pub complete: bool,
}

/// GET /upload/{project}/{container}?resumable...
///
/// 200 when the chunk (or the whole object) is already stored, 404 when the
/// client must send it.
#[instrument(
    skip_all,
    fields(request_id = %Uuid::new_v4(), project = %project, container = %container, chunk = chunk.number)
)]
pub async fn probe_chunk(
    State(state): State<Arc<AppState>>,
    Path((project, container)): Path<(String, String)>,
    Query(params): Query<ResumableParams>,
    Query(chunk): Query<ChunkParams>,
) -> Result<StatusCode, UploadError> {
    let session = state.session_for(&project, &container, params).await?;
    session.check_chunk(chunk.number).await?;
    Ok(StatusCode::OK)
}

/// POST /upload/{project}/{container}?resumable...
///
/// The chunk bytes are the file part of a multipart/form-data body. They are
/// forwarded as they arrive; the response is sent once the chunk is durably
/// accounted for.
#[instrument(
    skip_all,
    fields(request_id = %Uuid::new_v4(), project = %project, container = %container, chunk = chunk.number)
)]
pub async fn upload_chunk(
    State(state): State<Arc<AppState>>,
    Path((project, container)): Path<(String, String)>,
    Query(params): Query<ResumableParams>,
    Query(chunk): Query<ChunkParams>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<ChunkResponse>), UploadError> {
    let session = state.session_for(&project, &container, params).await?;

    let mut ingested = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| UploadError::InvalidChunk(format!("malformed multipart body: {}", e)))?
    {
        if !is_file_part(&field) {
            continue;
        }
        let (payload, sender) = ChunkPayload::channel();
        let (result, ()) = tokio::join!(
            session.ingest_chunk(chunk.number, chunk.current_size, payload),
            pump_field(field, sender)
        );
        ingested = Some(result);
        break;
    }
    let result = ingested.ok_or_else(|| {
        UploadError::InvalidChunk("multipart body has no file part".to_string())
    })?;

    let bytes = match result {
        Ok(ChunkOutcome::Stored) => session.params().expected_chunk_size(chunk.number),
        _ => None,
    };
    state
        .metrics
        .record_chunk(session.mode(), outcome_label(&result), bytes);

    let outcome = result.map_err(|e| {
        warn!("Chunk {} of {} rejected: {}", chunk.number, session.key(), e);
        e
    })?;
    let progress = session.progress();
    let status = match outcome {
        ChunkOutcome::AlreadyPresent => StatusCode::OK,
        ChunkOutcome::Stored => StatusCode::CREATED,
    };
    debug!(
        "Chunk {} -> {} ({}/{} bytes)",
        chunk.number, status, progress.total_uploaded, session.params().total_size
    );

    Ok((
        status,
        Json(ChunkResponse {
            chunk: chunk.number,
            uploaded_bytes: progress.total_uploaded,
            total_bytes: session.params().total_size,
            complete: session.is_complete(),
        }),
    ))
}

/// The part carrying the chunk: a file upload, or a part named `file`.
fn is_file_part(field: &Field<'_>) -> bool {
    field.file_name().is_some() || field.name() == Some("file")
}

/// Forward a form part into a chunk payload until the part ends or the
/// payload reader goes away.
async fn pump_field(mut field: Field<'_>, sender: PayloadSender) {
    loop {
        match field.chunk().await {
            Ok(Some(bytes)) => {
                if sender.send(bytes).await.is_err() {
                    return;
                }
            }
            Ok(None) => return,
            Err(e) => {
                sender
                    .fail(io::Error::new(io::ErrorKind::UnexpectedEof, e.to_string()))
                    .await;
                return;
            }
        }
    }
}
