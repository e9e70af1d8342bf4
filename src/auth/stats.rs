//! Coalescing buffer for per-user usage counters.
//!
//! Request handlers call [`StatsQueue::enqueue`], which only touches memory.
//! A background loop drains the buffer every flush interval and writes one row
//! per user. Within an interval the last snapshot wins; earlier ones are
//! discarded, not summed.

use super::error::Result;
use super::store::IdentityStore;
use super::types::{Stats, User};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::mem;

/// Default flush period (seconds).
pub const DEFAULT_STATS_FLUSH_INTERVAL_SECS: u64 = 33;

#[derive(Debug, Default)]
pub struct StatsQueue {
    pending: Mutex<HashMap<String, Stats>>,
    /// Held across drain and write so batches reach the store in drain order.
    writer: Mutex<()>,
}

impl StatsQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the user's current counters, replacing any pending snapshot.
    pub fn enqueue(&self, user: &User) {
        self.pending.lock().insert(user.name.clone(), user.stats);
    }

    /// Number of users with a pending snapshot.
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    /// Take every pending snapshot, leaving the buffer empty. Anything
    /// enqueued after this returns belongs to the next flush.
    pub fn drain(&self) -> HashMap<String, Stats> {
        mem::take(&mut *self.pending.lock())
    }

    /// Drain the buffer and persist it. The buffer lock is released before
    /// the store is touched; concurrent flushes run one after the other.
    pub fn flush(&self, store: &IdentityStore) -> Result<usize> {
        let _writer = self.writer.lock();
        let batch = self.drain();
        if batch.is_empty() {
            return Ok(0);
        }
        let written = store.write_stats(&batch)?;
        tracing::debug!(queued = batch.len(), written, "Flushed user stats");
        Ok(written)
    }
}
