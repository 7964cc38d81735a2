//! Journal statistics.

use serde::Serialize;
use std::sync::atomic::AtomicU64;

pub use crate::queue::QueueStats;

/// Shared atomic counters for the submit and upload sides of a journal.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub enqueued: AtomicU64,
    pub uploaded: AtomicU64,
}

/// Snapshot of journal progress. The `enqueued`/`uploaded` gap is the
/// user-visible backlog signal.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct JournalStats {
    pub enqueued: u64,
    pub uploaded: u64,
    pub queue: QueueStats,
}

impl JournalStats {
    /// Sum counters and merge queue stats, used for sharded journals.
    pub fn merge(self, other: JournalStats) -> JournalStats {
        JournalStats {
            enqueued: self.enqueued + other.enqueued,
            uploaded: self.uploaded + other.uploaded,
            queue: self.queue.merge(other.queue),
        }
    }
}
