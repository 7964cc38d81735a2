//! drift: crash-durable journaling of ordered entry streams to
//! S3-compatible object storage.
//!
//! Producers hand opaque entries to a [`Journal`]; the journal batches,
//! encodes, compresses, stages planned work to a local durable queue, and
//! asynchronously uploads contiguous byte runs as multipart objects in
//! time-partitioned directories. Producer throughput is decoupled from
//! object-store latency, and the pipeline tolerates process death, network
//! failures and intermittent service outages with at-least-once delivery
//! and idempotent parts.
//!
//! # Example
//!
//! ```ignore
//! use drift::{Journal, JournalConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), drift::error::JournalError> {
//!     let mut config = JournalConfig::new("events-bucket", "/var/lib/drift");
//!     config.max_batch_size = Some(100_000);
//!
//!     let mut journal = Journal::<Vec<u8>>::builder(config).open().await?;
//!     journal.submit(b"hello".to_vec()).await?;
//!     journal.close().await?;
//!     Ok(())
//! }
//! ```

pub mod batcher;
pub mod codec;
pub mod config;
mod coordinator;
pub mod error;
pub mod journal;
pub mod metrics;
pub mod position;
pub mod queue;
pub mod shard;
pub mod stats;
pub mod store;

// Re-export main types
pub use codec::Compression;
pub use config::{JournalConfig, Tuning};
pub use journal::{Clock, Journal, JournalBuilder};
pub use shard::ShardedJournal;
pub use stats::JournalStats;
pub use store::{MemoryStore, ObjectStorage, S3Store};
