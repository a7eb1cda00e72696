//! Resumable upload engine
//!
//! - `session` — per-upload state machine (mode decision, resume, probe, ingest)
//! - `registry` — sessions by identity, with idle eviction
//! - `reorder` / `producer` — ordered single-write path for smaller uploads
//! - `progress` — completed-chunk and byte accounting

mod payload;
mod producer;
mod progress;
mod registry;
mod reorder;
mod session;

pub use payload::{ChunkPayload, PayloadClosed, PayloadSender};
pub use progress::{ProgressSnapshot, SessionStatus};
pub use registry::SessionRegistry;
pub use reorder::{PushError, ReorderBuffer};
pub use session::{destination_for, UploadSession};
