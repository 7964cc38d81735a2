//! Producer-side fan-out across independent journals.
//!
//! Each shard is a complete journal pipeline with its own durable queue
//! directory and a directory format prefixed by the shard symbol, so shards
//! never contend on files or ordering. `submit` round-robins entries by an
//! atomic cursor; ordering is only guaranteed within a shard.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use snafu::prelude::*;

use crate::config::JournalConfig;
use crate::error::{ConfigSnafu, JournalError, ShardsNotConfiguredSnafu};
use crate::journal::{Journal, JournalBuilder};
use crate::stats::{JournalStats, QueueStats};
use crate::store::{ObjectStorage, S3Store};

/// Symbol for a shard index: digits 0-9 then a-z.
pub fn shard_symbol(index: u32) -> char {
    char::from_digit(index, 36).expect("shard index within 0..36")
}

/// Derive the per-shard configuration: the directory format gains the shard
/// symbol as a prefix and the queue directory gains it as a suffix.
pub(crate) fn shard_config(config: &JournalConfig, index: u32) -> JournalConfig {
    let symbol = shard_symbol(index);
    let mut shard = config.clone();
    shard.shards = None;
    shard.directory_format = format!("{symbol}/{}", config.directory_format);

    let mut dir = config.local_directory.clone().into_os_string();
    dir.push(symbol.to_string());
    shard.local_directory = dir.into();
    shard
}

impl<E: Send + 'static> JournalBuilder<E> {
    /// Open one journal per configured shard (`shards` must be in 1..=36).
    pub async fn open_sharded(self) -> Result<ShardedJournal<E>, JournalError> {
        self.config.validate().context(ConfigSnafu)?;
        let count = match self.config.shards {
            Some(count) => count,
            None => return ShardsNotConfiguredSnafu.fail().context(ConfigSnafu),
        };

        // shards share one store client
        let storage: Arc<dyn ObjectStorage> = match &self.storage {
            Some(storage) => storage.clone(),
            None => Arc::new(S3Store::from_config(&self.config).await),
        };

        let mut shards = Vec::with_capacity(count as usize);
        for index in 0..count {
            let builder = JournalBuilder {
                config: shard_config(&self.config, index),
                encoder: self.encoder.clone(),
                compressor: self.compressor.clone(),
                storage: Some(storage.clone()),
                clock: self.clock.clone(),
                tuning: self.tuning.clone(),
            };
            shards.push(builder.open_single().await?);
        }

        Ok(ShardedJournal {
            shards,
            cursor: AtomicU64::new(0),
        })
    }
}

/// Round-robin fan-out over independent journals.
pub struct ShardedJournal<E> {
    shards: Vec<Journal<E>>,
    cursor: AtomicU64,
}

impl<E: Send + 'static> ShardedJournal<E> {
    /// Hand one entry to the next shard in round-robin order.
    pub async fn submit(&self, entry: E) -> Result<(), JournalError> {
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) as usize % self.shards.len();
        self.shards[index].submit(entry).await
    }

    /// Summed counters and merged queue stats across all shards.
    pub async fn stats(&self) -> JournalStats {
        let mut merged = JournalStats {
            enqueued: 0,
            uploaded: 0,
            queue: QueueStats::default(),
        };
        for shard in &self.shards {
            merged = merged.merge(shard.stats().await);
        }
        merged
    }

    /// Close every shard, draining each pipeline.
    pub async fn close(&mut self) -> Result<(), JournalError> {
        for shard in &mut self.shards {
            shard.close().await?;
        }
        Ok(())
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }
}
