//! Upload session behaviour against an in-memory backend
//!
//! Covers both ingestion modes: ordering of the single streamed write,
//! probe semantics, idempotent resends, segment timeouts, manifest
//! exactly-once, resume discovery, and the duplicate in-flight policy.

mod common;

use bytes::Bytes;
use common::{
    destination, generate_binary, open_session, open_session_with_metrics, segment_path,
    upload_params, MemoryStore, GIB, MIB,
};
use std::sync::Arc;
use std::time::Duration;
use swift_upload_proxy::api::UploadError;
use swift_upload_proxy::metrics::Metrics;
use swift_upload_proxy::types::{ChunkOutcome, UploadMode};
use swift_upload_proxy::upload::{ChunkPayload, SessionStatus};

/// Five declared 1 GiB chunks: exactly at the segmentation threshold.
fn segmented_params() -> swift_upload_proxy::types::ResumableParams {
    upload_params(5 * GIB, GIB, 5)
}

fn segment_bytes(n: u32) -> Bytes {
    Bytes::from(format!("segment-{}", n))
}

// ─── Monolithic mode ───

#[tokio::test]
async fn test_reverse_order_chunks_produce_one_ordered_write() {
    let store = MemoryStore::new();
    let session = open_session(&store, upload_params(10 * MIB, MIB, 10), 1).await;
    assert_eq!(session.mode(), UploadMode::Monolithic);

    let data = generate_binary((10 * MIB) as usize, 7);
    let chunks: Vec<Bytes> = data
        .chunks(MIB as usize)
        .map(Bytes::copy_from_slice)
        .collect();

    let mut handles = Vec::new();
    for n in (0..10u32).rev() {
        let session = Arc::clone(&session);
        let chunk = chunks[n as usize].clone();
        handles.push(tokio::spawn(async move {
            session
                .ingest_chunk(n, Some(MIB), ChunkPayload::from_bytes(chunk))
                .await
        }));
        // Let each request reach the buffer before the next one starts
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap(), ChunkOutcome::Stored);
    }

    assert_eq!(store.put_count(&destination()), 1);
    assert_eq!(store.total_puts(), 1);
    assert_eq!(store.object_body(&destination()).unwrap(), data);
    assert!(session.is_complete());
    assert_eq!(session.progress().total_uploaded, 10 * MIB);
}

#[tokio::test]
async fn test_probe_before_upload_is_not_found() {
    let store = MemoryStore::new();
    let session = open_session(&store, upload_params(10 * MIB, MIB, 10), 1).await;

    let err = session.check_chunk(0).await.unwrap_err();
    assert!(matches!(err, UploadError::NotFound));
    assert_eq!(err.status_code().as_u16(), 404);
}

#[tokio::test]
async fn test_resend_after_completion_is_noop() {
    let store = MemoryStore::new();
    let session = open_session(&store, upload_params(8, 4, 2), 1).await;

    let first = session
        .ingest_chunk(0, Some(4), ChunkPayload::from_bytes(&b"abcd"[..]))
        .await
        .unwrap();
    let second = session
        .ingest_chunk(1, Some(4), ChunkPayload::from_bytes(&b"efgh"[..]))
        .await
        .unwrap();
    assert_eq!((first, second), (ChunkOutcome::Stored, ChunkOutcome::Stored));
    let before = session.progress().total_uploaded;

    let again = session
        .ingest_chunk(0, Some(4), ChunkPayload::from_bytes(&b"abcd"[..]))
        .await
        .unwrap();
    assert_eq!(again, ChunkOutcome::AlreadyPresent);
    assert_eq!(session.progress().total_uploaded, before);
    assert_eq!(store.put_count(&destination()), 1);
    assert_eq!(store.object_body(&destination()).unwrap(), b"abcdefgh");
}

#[tokio::test]
async fn test_wrong_declared_size_rejected() {
    let store = MemoryStore::new();
    let session = open_session(&store, upload_params(10, 4, 3), 1).await;

    let err = session
        .ingest_chunk(2, Some(4), ChunkPayload::from_bytes(&b"ij"[..]))
        .await
        .unwrap_err();
    assert!(matches!(err, UploadError::InvalidChunk(_)));

    let err = session
        .ingest_chunk(3, None, ChunkPayload::from_bytes(&b"x"[..]))
        .await
        .unwrap_err();
    assert!(matches!(err, UploadError::InvalidChunk(_)));
    assert_eq!(store.total_puts(), 0);
}

#[tokio::test]
async fn test_short_payload_fails_streamed_session() {
    let store = MemoryStore::new();
    let session = open_session(&store, upload_params(8, 4, 2), 1).await;

    let err = session
        .ingest_chunk(0, None, ChunkPayload::from_bytes(&b"ab"[..]))
        .await
        .unwrap_err();
    assert!(matches!(err, UploadError::SessionFailed(_)));
    assert!(session.is_failed());
    assert!(store.object_body(&destination()).is_none());

    // Nothing more is accepted on a failed session
    let err = session
        .ingest_chunk(1, None, ChunkPayload::from_bytes(&b"efgh"[..]))
        .await
        .unwrap_err();
    assert!(matches!(err, UploadError::SessionFailed(_)));
}

#[tokio::test]
async fn test_streamed_write_timeout_fails_waiting_chunks() {
    let store = MemoryStore::new();
    store.time_out_next_put(&destination());
    let session = open_session(&store, upload_params(8, 4, 2), 2).await;

    // Chunk 1 starts the write, which times out at once, then waits for chunk 0
    let waiting = {
        let session = Arc::clone(&session);
        tokio::spawn(async move {
            session
                .ingest_chunk(1, None, ChunkPayload::from_bytes(&b"efgh"[..]))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let (payload, sender) = ChunkPayload::channel();
    let first = {
        let session = Arc::clone(&session);
        tokio::spawn(async move { session.ingest_chunk(0, None, payload).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    let _ = sender.send(Bytes::from_static(b"abcd")).await;
    drop(sender);

    let first = first.await.unwrap().unwrap_err();
    let waiting = waiting.await.unwrap().unwrap_err();
    assert_eq!(first.status_code().as_u16(), 408);
    assert_eq!(waiting.status_code().as_u16(), 408);
    assert!(matches!(session.progress().status, SessionStatus::Failed(_)));
    assert!(store.object_body(&destination()).is_none());
}

#[tokio::test]
async fn test_duplicate_streamed_chunk_conflicts() {
    let store = MemoryStore::new();
    let session = open_session(&store, upload_params(8, 4, 2), 2).await;

    // Chunk 1 waits in the buffer until chunk 0 arrives
    let waiting = {
        let session = Arc::clone(&session);
        tokio::spawn(async move {
            session
                .ingest_chunk(1, None, ChunkPayload::from_bytes(&b"efgh"[..]))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let err = session
        .ingest_chunk(1, None, ChunkPayload::from_bytes(&b"EFGH"[..]))
        .await
        .unwrap_err();
    assert!(matches!(err, UploadError::ChunkInFlight(1)));
    assert_eq!(err.status_code().as_u16(), 409);

    session
        .ingest_chunk(0, None, ChunkPayload::from_bytes(&b"abcd"[..]))
        .await
        .unwrap();
    assert_eq!(waiting.await.unwrap().unwrap(), ChunkOutcome::Stored);
    assert_eq!(store.object_body(&destination()).unwrap(), b"abcdefgh");
}

#[tokio::test]
async fn test_abandon_mid_stream_leaves_no_object() {
    let store = MemoryStore::new();
    let session = open_session(&store, upload_params(8, 4, 2), 1).await;

    let stored = session
        .ingest_chunk(0, None, ChunkPayload::from_bytes(&b"abcd"[..]))
        .await
        .unwrap();
    assert_eq!(stored, ChunkOutcome::Stored);

    session.abandon();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(session.is_failed());
    assert!(store.object_body(&destination()).is_none());
}

#[tokio::test]
async fn test_dropped_session_leaves_no_object() {
    let store = MemoryStore::new();
    let session = open_session(&store, upload_params(8, 4, 2), 1).await;

    session
        .ingest_chunk(0, None, ChunkPayload::from_bytes(&b"abcd"[..]))
        .await
        .unwrap();

    drop(session);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(store.put_count(&destination()), 1);
    assert!(store.object_body(&destination()).is_none());
}

// ─── Mode selection ───

#[tokio::test]
async fn test_mode_boundary() {
    let store = MemoryStore::new();
    let below = open_session(&store, upload_params(5 * GIB - 1, GIB, 5), 1).await;
    assert_eq!(below.mode(), UploadMode::Monolithic);

    let store = MemoryStore::new();
    let at = open_session(&store, upload_params(5 * GIB, GIB, 5), 1).await;
    assert_eq!(at.mode(), UploadMode::Segmented);
}

// ─── Segmented mode ───

#[tokio::test]
async fn test_segment_timeout_then_resend_writes_manifest_once() {
    let store = MemoryStore::new();
    store.time_out_next_put(&segment_path(3));
    let session = open_session(&store, segmented_params(), 1).await;

    for n in 0..3 {
        let outcome = session
            .ingest_chunk(n, Some(GIB), ChunkPayload::from_bytes(segment_bytes(n)))
            .await
            .unwrap();
        assert_eq!(outcome, ChunkOutcome::Stored);
    }

    let err = session
        .ingest_chunk(3, Some(GIB), ChunkPayload::from_bytes(segment_bytes(3)))
        .await
        .unwrap_err();
    assert!(matches!(err, UploadError::Timeout(_)));
    assert_eq!(err.status_code().as_u16(), 408);
    assert!(!session.is_failed());
    assert_eq!(session.progress().total_uploaded, 3 * GIB);

    let outcome = session
        .ingest_chunk(3, Some(GIB), ChunkPayload::from_bytes(segment_bytes(3)))
        .await
        .unwrap();
    assert_eq!(outcome, ChunkOutcome::Stored);
    assert_eq!(store.manifest_writes(), 0);

    let outcome = session
        .ingest_chunk(4, Some(GIB), ChunkPayload::from_bytes(segment_bytes(4)))
        .await
        .unwrap();
    assert_eq!(outcome, ChunkOutcome::Stored);
    assert_eq!(store.manifest_writes(), 1);
    assert_eq!(
        store.manifest_of(&destination()).unwrap(),
        "container_segments/incoming/upload.bin/"
    );

    // Probe answered by the completed object, for every chunk
    assert_eq!(session.check_chunk(3).await.unwrap(), ChunkOutcome::AlreadyPresent);
    assert_eq!(session.check_chunk(4).await.unwrap(), ChunkOutcome::AlreadyPresent);

    let body = store.object_body(&destination()).unwrap();
    let expected: Vec<u8> = (0..5).flat_map(|n| segment_bytes(n).to_vec()).collect();
    assert_eq!(body, expected);
}

#[tokio::test]
async fn test_failed_backend_calls_are_timed() {
    let store = MemoryStore::new();
    store.time_out_next_put(&segment_path(0));
    store.reject_manifests(1);
    let metrics = Metrics::new();
    let session = open_session_with_metrics(&store, segmented_params(), 1, metrics.clone()).await;
    let samples = |op: &str| {
        metrics
            .backend_duration_seconds
            .with_label_values(&[op])
            .get_sample_count()
    };
    assert_eq!(samples("list_segments"), 1);

    let err = session
        .ingest_chunk(0, Some(GIB), ChunkPayload::from_bytes(segment_bytes(0)))
        .await
        .unwrap_err();
    assert!(matches!(err, UploadError::Timeout(_)));
    assert_eq!(samples("put_segment"), 1);

    for n in 0..4 {
        session
            .ingest_chunk(n, Some(GIB), ChunkPayload::from_bytes(segment_bytes(n)))
            .await
            .unwrap();
    }
    let err = session
        .ingest_chunk(4, Some(GIB), ChunkPayload::from_bytes(segment_bytes(4)))
        .await
        .unwrap_err();
    assert!(matches!(err, UploadError::FinalizationFailed(_)));
    assert_eq!(samples("put_segment"), 6);
    assert_eq!(samples("put_manifest"), 1);
}

#[tokio::test]
async fn test_concurrent_final_chunks_write_manifest_once() {
    let store = MemoryStore::new();
    let session = open_session(&store, segmented_params(), 1).await;

    let mut handles = Vec::new();
    for n in (0..5u32).rev() {
        let session = Arc::clone(&session);
        handles.push(tokio::spawn(async move {
            session
                .ingest_chunk(n, Some(GIB), ChunkPayload::from_bytes(segment_bytes(n)))
                .await
        }));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap(), ChunkOutcome::Stored);
    }

    assert_eq!(store.manifest_writes(), 1);
    assert!(session.is_complete());
    assert_eq!(session.progress().total_uploaded, 5 * GIB);
}

#[tokio::test]
async fn test_resend_of_stored_segment_is_noop() {
    let store = MemoryStore::new();
    let session = open_session(&store, segmented_params(), 1).await;

    session
        .ingest_chunk(1, Some(GIB), ChunkPayload::from_bytes(segment_bytes(1)))
        .await
        .unwrap();
    let outcome = session
        .ingest_chunk(1, Some(GIB), ChunkPayload::from_bytes(segment_bytes(1)))
        .await
        .unwrap();
    assert_eq!(outcome, ChunkOutcome::AlreadyPresent);
    assert_eq!(store.put_count(&segment_path(1)), 1);
    assert_eq!(session.progress().total_uploaded, GIB);
    assert_eq!(session.check_chunk(1).await.unwrap(), ChunkOutcome::AlreadyPresent);
    assert!(matches!(
        session.check_chunk(2).await,
        Err(UploadError::NotFound)
    ));
}

#[tokio::test]
async fn test_manifest_failure_keeps_accounting_and_retries_on_resend() {
    let store = MemoryStore::new();
    store.reject_manifests(1);
    let session = open_session(&store, segmented_params(), 1).await;

    for n in 0..4 {
        session
            .ingest_chunk(n, Some(GIB), ChunkPayload::from_bytes(segment_bytes(n)))
            .await
            .unwrap();
    }

    let err = session
        .ingest_chunk(4, Some(GIB), ChunkPayload::from_bytes(segment_bytes(4)))
        .await
        .unwrap_err();
    assert!(matches!(err, UploadError::FinalizationFailed(_)));
    assert_eq!(err.status_code().as_u16(), 400);
    assert_eq!(session.progress().total_uploaded, 4 * GIB);
    assert!(!session.is_completed(4));
    assert!(!session.is_complete());

    let outcome = session
        .ingest_chunk(4, Some(GIB), ChunkPayload::from_bytes(segment_bytes(4)))
        .await
        .unwrap();
    assert_eq!(outcome, ChunkOutcome::Stored);
    assert_eq!(store.manifest_writes(), 1);
    assert!(session.is_complete());
}

#[tokio::test]
async fn test_duplicate_segment_in_flight_conflicts() {
    let store = MemoryStore::new();
    let session = open_session(&store, segmented_params(), 1).await;

    // A payload that stays open until the sender is dropped
    let (payload, sender) = ChunkPayload::channel();
    let first = {
        let session = Arc::clone(&session);
        tokio::spawn(async move { session.ingest_chunk(2, Some(GIB), payload).await })
    };
    sender.send(Bytes::from_static(b"part")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let err = session
        .ingest_chunk(2, Some(GIB), ChunkPayload::from_bytes(segment_bytes(2)))
        .await
        .unwrap_err();
    assert!(matches!(err, UploadError::ChunkInFlight(2)));

    drop(sender);
    assert_eq!(first.await.unwrap().unwrap(), ChunkOutcome::Stored);
    assert_eq!(store.put_count(&segment_path(2)), 1);
}

// ─── Resume discovery ───

#[tokio::test]
async fn test_resume_discovers_stored_segments() {
    let store = MemoryStore::new();
    for n in 0..3 {
        store.insert(&segment_path(n), segment_bytes(n));
    }

    let session = open_session(&store, segmented_params(), 1).await;
    assert_eq!(session.progress().completed, 3);
    assert_eq!(session.progress().total_uploaded, 3 * GIB);

    // Recovered chunks probe as present and are not transferred again
    assert_eq!(session.check_chunk(0).await.unwrap(), ChunkOutcome::AlreadyPresent);
    let outcome = session
        .ingest_chunk(1, Some(GIB), ChunkPayload::from_bytes(segment_bytes(1)))
        .await
        .unwrap();
    assert_eq!(outcome, ChunkOutcome::AlreadyPresent);

    for n in 3..5 {
        session
            .ingest_chunk(n, Some(GIB), ChunkPayload::from_bytes(segment_bytes(n)))
            .await
            .unwrap();
    }
    assert_eq!(store.total_puts(), 2);
    assert_eq!(store.manifest_writes(), 1);
    assert!(session.is_complete());
}

#[tokio::test]
async fn test_resume_with_every_segment_writes_missing_manifest() {
    let store = MemoryStore::new();
    for n in 0..5 {
        store.insert(&segment_path(n), segment_bytes(n));
    }

    let session = open_session(&store, segmented_params(), 1).await;
    assert!(session.is_complete());
    assert_eq!(store.manifest_writes(), 1);
    assert_eq!(session.check_chunk(2).await.unwrap(), ChunkOutcome::AlreadyPresent);
    assert_eq!(store.total_puts(), 0);
}

#[tokio::test]
async fn test_resume_ignores_foreign_segment_names() {
    let store = MemoryStore::new();
    store.insert(&segment_path(0), segment_bytes(0));
    let mut stray = segment_path(1);
    stray.name = "incoming/upload.bin/notes.txt".to_string();
    store.insert(&stray, "x");

    let session = open_session(&store, segmented_params(), 1).await;
    assert_eq!(session.progress().completed, 1);
}

#[tokio::test]
async fn test_streamed_sessions_skip_discovery() {
    let store = MemoryStore::new();
    store.insert(&segment_path(0), segment_bytes(0));

    let session = open_session(&store, upload_params(8, 4, 2), 1).await;
    assert_eq!(session.progress().completed, 0);
}
