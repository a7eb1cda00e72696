//! Mutable per-session accounting, behind one lock.

use crate::api::UploadError;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub enum SessionStatus {
    Active,
    /// The destination object exists.
    Complete,
    /// The streamed write broke; nothing of this session is usable.
    Failed(UploadError),
}

#[derive(Debug)]
struct State {
    completed: BTreeSet<u32>,
    total_uploaded: u64,
    in_flight: HashSet<u32>,
    finalizing: bool,
    status: SessionStatus,
}

/// Point-in-time view of a session's accounting.
#[derive(Debug, Clone)]
pub struct ProgressSnapshot {
    pub completed: usize,
    pub total_uploaded: u64,
    pub status: SessionStatus,
}

pub struct Progress {
    total_size: u64,
    state: Mutex<State>,
}

/// What a chunk request should do after claiming its chunk number.
pub enum Claim {
    AlreadyComplete,
    Claimed(InFlight),
}

impl Progress {
    pub fn new(total_size: u64) -> Arc<Self> {
        Arc::new(Self {
            total_size,
            state: Mutex::new(State {
                completed: BTreeSet::new(),
                total_uploaded: 0,
                in_flight: HashSet::new(),
                finalizing: false,
                status: SessionStatus::Active,
            }),
        })
    }

    /// Record chunks found already stored at the backend.
    pub fn seed(&self, recovered: impl IntoIterator<Item = (u32, u64)>) {
        let mut state = self.state.lock();
        for (n, size) in recovered {
            if state.completed.insert(n) {
                state.total_uploaded += size;
            }
        }
    }

    /// Reserve chunk `n` for the calling request. The reservation is released
    /// when the returned guard drops.
    pub fn claim(self: &Arc<Self>, n: u32) -> Result<Claim, UploadError> {
        let mut state = self.state.lock();
        match &state.status {
            SessionStatus::Complete => return Ok(Claim::AlreadyComplete),
            SessionStatus::Failed(e) => return Err(e.clone()),
            SessionStatus::Active => {}
        }
        if state.completed.contains(&n) {
            return Ok(Claim::AlreadyComplete);
        }
        if !state.in_flight.insert(n) {
            return Err(UploadError::ChunkInFlight(n));
        }
        Ok(Claim::Claimed(InFlight {
            progress: Arc::clone(self),
            chunk: n,
        }))
    }

    /// Account a stored chunk, unless it is the one that completes the
    /// object. Returns `true` when the caller must finalize; in that case
    /// nothing is committed yet and no other caller can get `true` until
    /// [`end_finalize`](Self::end_finalize).
    pub fn commit_or_finalize(&self, n: u32, size: u64) -> bool {
        let mut state = self.state.lock();
        if state.completed.contains(&n) {
            return false;
        }
        if !state.finalizing && state.total_uploaded + size == self.total_size {
            state.finalizing = true;
            return true;
        }
        state.completed.insert(n);
        state.total_uploaded += size;
        false
    }

    /// Finish a finalization started by `commit_or_finalize`. On success the
    /// triggering chunk is committed and the session completes; on failure
    /// accounting is left untouched so a resend can retry.
    pub fn end_finalize(&self, n: u32, size: u64, succeeded: bool) {
        let mut state = self.state.lock();
        state.finalizing = false;
        if succeeded {
            if state.completed.insert(n) {
                state.total_uploaded += size;
            }
            state.status = SessionStatus::Complete;
        }
    }

    /// Begin finalization without a triggering chunk (every chunk was
    /// recovered from the backend). Returns `false` if one is already running
    /// or the byte total is not reached.
    pub fn begin_recovered_finalize(&self) -> bool {
        let mut state = self.state.lock();
        if state.finalizing || state.total_uploaded != self.total_size {
            return false;
        }
        state.finalizing = true;
        true
    }

    pub fn end_recovered_finalize(&self, succeeded: bool) {
        let mut state = self.state.lock();
        state.finalizing = false;
        if succeeded {
            state.status = SessionStatus::Complete;
        }
    }

    /// Unconditional commit. Used by the stream consumer, the only writer in
    /// streamed mode.
    pub fn commit(&self, n: u32, size: u64) {
        let mut state = self.state.lock();
        if state.completed.insert(n) {
            state.total_uploaded += size;
        }
    }

    pub fn complete(&self) {
        self.state.lock().status = SessionStatus::Complete;
    }

    /// Mark the session failed. The first failure wins.
    pub fn fail(&self, err: UploadError) -> UploadError {
        let mut state = self.state.lock();
        match &state.status {
            SessionStatus::Failed(first) => first.clone(),
            _ => {
                state.status = SessionStatus::Failed(err.clone());
                err
            }
        }
    }

    pub fn is_completed(&self, n: u32) -> bool {
        self.state.lock().completed.contains(&n)
    }

    pub fn status(&self) -> SessionStatus {
        self.state.lock().status.clone()
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let state = self.state.lock();
        ProgressSnapshot {
            completed: state.completed.len(),
            total_uploaded: state.total_uploaded,
            status: state.status.clone(),
        }
    }

    fn release(&self, n: u32) {
        self.state.lock().in_flight.remove(&n);
    }
}

/// Reservation of one chunk number by one request.
pub struct InFlight {
    progress: Arc<Progress>,
    chunk: u32,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.progress.release(self.chunk);
    }
}
