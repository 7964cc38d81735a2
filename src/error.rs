//! Error types for drift using snafu.
//!
//! Each subsystem owns its error enum; `JournalError` aggregates the
//! conditions that can surface to callers of the public API.

use snafu::prelude::*;
use std::path::PathBuf;

// ============ Storage Errors ============

/// Errors surfaced by object-store operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum StorageError {
    /// The target of the operation no longer exists (404 family).
    #[snafu(display("{operation} returned not-found for {target}"))]
    NotFound {
        operation: &'static str,
        target: String,
    },

    /// The store rejected or failed the request.
    #[snafu(display("{operation} failed for {target}: {message}"))]
    Request {
        operation: &'static str,
        target: String,
        message: String,
    },

    /// The store accepted the multipart init but returned no upload id.
    #[snafu(display("multipart init returned no upload id for {target}"))]
    MissingUploadId { target: String },

    /// A part upload succeeded but the response carried no etag.
    #[snafu(display("part upload returned no etag for {target}"))]
    MissingEtag { target: String },
}

impl StorageError {
    /// Check if this error represents a "not found" condition (404,
    /// NoSuchUpload, NoSuchKey, ...).
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }
}

// ============ Queue Errors ============

/// Errors from the durable action queue.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum QueueError {
    /// Failed to create or open the queue directory.
    #[snafu(display("failed to open queue directory {path:?}"))]
    OpenDir {
        path: PathBuf,
        source: std::io::Error,
    },

    /// IO error on a slab or ack file.
    #[snafu(display("queue io error on {path:?}"))]
    SlabIo {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to serialize an action for the slab.
    #[snafu(display("failed to encode queue record: {message}"))]
    Encode { message: String },

    /// A slab record is present but its payload cannot be decoded.
    #[snafu(display("corrupt queue record (id {id}): {message}"))]
    CorruptRecord { id: u64, message: String },
}

// ============ Config Errors ============

/// Errors from configuration parsing and validation.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ConfigError {
    #[snafu(display("bucket cannot be empty"))]
    EmptyBucket,

    #[snafu(display("local directory cannot be empty"))]
    EmptyLocalDirectory,

    #[snafu(display("journal id cannot be empty"))]
    EmptyId,

    #[snafu(display("directory format cannot be empty"))]
    EmptyDirectoryFormat,

    /// Neither a size bound nor a latency bound was configured.
    #[snafu(display("at least one of max_batch_size / max_batch_latency_ms is required"))]
    MissingBatchBound,

    #[snafu(display("shards must be in 1..=36, got {shards}"))]
    ShardsOutOfRange { shards: u32 },

    #[snafu(display("sharding requires the shards field to be set"))]
    ShardsNotConfigured,

    #[snafu(display("failed to read configuration file"))]
    ReadFile { source: std::io::Error },

    #[snafu(display("failed to parse YAML configuration"))]
    YamlParse { source: serde_yaml::Error },
}

// ============ Journal Error (top-level) ============

/// Errors visible to producers through the public journal API.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum JournalError {
    /// The journal has been closed; no further entries are accepted.
    #[snafu(display("journal is closed"))]
    Closed,

    /// Configuration error.
    #[snafu(display("configuration error"))]
    Config { source: ConfigError },

    /// The durable queue could not be opened or written during startup.
    #[snafu(display("durable queue error"))]
    Queue { source: QueueError },

    /// The object store failed during startup position recovery.
    #[snafu(display("storage error"))]
    Storage { source: StorageError },

    /// A background task failed to join on close.
    #[snafu(display("task join error"))]
    TaskJoin { source: tokio::task::JoinError },
}
