//! Internal events for metrics emission.
//!
//! Each event struct represents a measurable occurrence in the journal
//! pipeline. Events implement the `InternalEvent` trait which records the
//! corresponding metric.

use metrics::{counter, gauge, histogram};
use tracing::trace;

/// Trait for internal events that can be emitted as metrics.
pub trait InternalEvent {
    /// Emit this event as a metric.
    fn emit(self);
}

/// Event emitted when entries are accepted by `submit`.
pub struct EntriesSubmitted {
    pub count: u64,
}

impl InternalEvent for EntriesSubmitted {
    fn emit(self) {
        trace!(count = self.count, "Entries submitted");
        counter!("drift_entries_submitted_total").increment(self.count);
    }
}

/// Event emitted when a batch is flushed into a chunk.
pub struct BatchFlushed {
    pub entries: u64,
    pub bytes: u64,
}

impl InternalEvent for BatchFlushed {
    fn emit(self) {
        trace!(entries = self.entries, bytes = self.bytes, "Batch flushed");
        counter!("drift_batches_flushed_total").increment(1);
        histogram!("drift_chunk_bytes").record(self.bytes as f64);
    }
}

/// Event emitted when a multipart upload is initialized.
pub struct MultipartStarted;

impl InternalEvent for MultipartStarted {
    fn emit(self) {
        trace!("Multipart upload started");
        counter!("drift_multipart_started_total").increment(1);
    }
}

/// Event emitted when a part is uploaded.
pub struct PartUploaded {
    pub bytes: u64,
    pub entries: u64,
}

impl InternalEvent for PartUploaded {
    fn emit(self) {
        trace!(bytes = self.bytes, entries = self.entries, "Part uploaded");
        counter!("drift_parts_uploaded_total").increment(1);
        counter!("drift_entries_uploaded_total").increment(self.entries);
        histogram!("drift_part_bytes").record(self.bytes as f64);
    }
}

/// Event emitted when a multipart upload completes.
pub struct MultipartCompleted {
    pub parts: u64,
}

impl InternalEvent for MultipartCompleted {
    fn emit(self) {
        trace!(parts = self.parts, "Multipart upload completed");
        counter!("drift_multipart_completed_total").increment(1);
    }
}

/// Event emitted when an empty multipart upload is aborted.
pub struct MultipartAborted;

impl InternalEvent for MultipartAborted {
    fn emit(self) {
        trace!("Multipart upload aborted");
        counter!("drift_multipart_aborted_total").increment(1);
    }
}

/// Event emitted when an action is retried after a store failure.
pub struct ActionRetried {
    pub kind: &'static str,
}

impl InternalEvent for ActionRetried {
    fn emit(self) {
        trace!(kind = self.kind, "Action retried");
        counter!("drift_action_retries_total", "kind" => self.kind).increment(1);
    }
}

/// Event emitted when a corrupt durable task is dropped.
pub struct CorruptTaskDropped;

impl InternalEvent for CorruptTaskDropped {
    fn emit(self) {
        trace!("Corrupt task dropped");
        counter!("drift_corrupt_tasks_dropped_total").increment(1);
    }
}

/// Event emitted when the durable queue depth changes.
pub struct QueueDepth {
    pub count: usize,
}

impl InternalEvent for QueueDepth {
    fn emit(self) {
        trace!(count = self.count, "Queue depth");
        gauge!("drift_queue_depth").set(self.count as f64);
    }
}

/// Event emitted to track the enqueued-minus-uploaded entry backlog.
pub struct UploadBacklog {
    pub entries: u64,
}

impl InternalEvent for UploadBacklog {
    fn emit(self) {
        trace!(entries = self.entries, "Upload backlog");
        gauge!("drift_upload_backlog_entries").set(self.entries as f64);
    }
}
