//! Bounded chunk reorder buffer.
//!
//! Producers (chunk requests) push entries keyed by chunk number in any
//! order; the single consumer takes them strictly in ascending order. The
//! bound is a window over the consumption cursor: chunk `n` is admitted only
//! while `cursor <= n < cursor + capacity`, so the chunk the consumer needs
//! next can always get in.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use thiserror::Error;
use tokio::sync::Notify;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PushError {
    /// An entry with this chunk number is already pending or being consumed.
    #[error("chunk {0} is already queued")]
    Duplicate(u32),

    /// The consumer is already past this chunk.
    #[error("chunk {0} was already consumed")]
    Stale(u32),

    #[error("reorder buffer is closed")]
    Closed,
}

struct Inner<T> {
    pending: BTreeMap<u32, T>,
    /// Next chunk number the consumer will take.
    cursor: u32,
    /// Chunk currently held by the consumer, if any.
    consuming: Option<u32>,
    closed: bool,
}

pub struct ReorderBuffer<T> {
    inner: Mutex<Inner<T>>,
    capacity: u32,
    /// Cursor moved or buffer closed: admission waiters re-check.
    admitted: Notify,
    /// New entry pushed or buffer closed: the consumer re-checks.
    arrived: Notify,
}

impl<T> ReorderBuffer<T> {
    pub fn new(capacity: u32) -> Self {
        Self {
            inner: Mutex::new(Inner {
                pending: BTreeMap::new(),
                cursor: 0,
                consuming: None,
                closed: false,
            }),
            capacity: capacity.max(1),
            admitted: Notify::new(),
            arrived: Notify::new(),
        }
    }

    /// Insert an entry, waiting while `n` is beyond the admission window.
    ///
    /// On error the entry is dropped.
    pub async fn push(&self, n: u32, item: T) -> Result<(), PushError> {
        let mut item = Some(item);
        loop {
            let notified = self.admitted.notified();
            tokio::pin!(notified);
            // Register before checking so a cursor move in between is not lost
            notified.as_mut().enable();

            {
                let mut inner = self.inner.lock();
                if inner.closed {
                    return Err(PushError::Closed);
                }
                if n < inner.cursor {
                    return Err(PushError::Stale(n));
                }
                if inner.pending.contains_key(&n) || inner.consuming == Some(n) {
                    return Err(PushError::Duplicate(n));
                }
                if u64::from(n) < u64::from(inner.cursor) + u64::from(self.capacity) {
                    if let Some(item) = item.take() {
                        inner.pending.insert(n, item);
                    }
                    drop(inner);
                    self.arrived.notify_one();
                    return Ok(());
                }
            }

            notified.await;
        }
    }

    /// Take the entry at the cursor, waiting until it arrives. Returns `None`
    /// once the buffer is closed.
    ///
    /// The cursor does not move until [`advance`](Self::advance) is called,
    /// so producers further ahead stay blocked while the entry is consumed.
    pub async fn pop_next(&self) -> Option<(u32, T)> {
        loop {
            let notified = self.arrived.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.inner.lock();
                if inner.closed {
                    return None;
                }
                let cursor = inner.cursor;
                if inner.consuming.is_none() {
                    if let Some(item) = inner.pending.remove(&cursor) {
                        inner.consuming = Some(cursor);
                        return Some((cursor, item));
                    }
                }
            }

            notified.await;
        }
    }

    /// Mark the entry returned by `pop_next` as fully consumed and admit the
    /// next window position.
    pub fn advance(&self) -> u32 {
        let cursor = {
            let mut inner = self.inner.lock();
            inner.consuming = None;
            inner.cursor += 1;
            inner.cursor
        };
        self.admitted.notify_waiters();
        cursor
    }

    /// Reject all further pushes and drop every pending entry.
    pub fn close(&self) -> Vec<(u32, T)> {
        let drained = {
            let mut inner = self.inner.lock();
            inner.closed = true;
            std::mem::take(&mut inner.pending).into_iter().collect()
        };
        self.admitted.notify_waiters();
        self.arrived.notify_waiters();
        drained
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.inner.lock().pending.len()
    }

    #[cfg(test)]
    fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}
