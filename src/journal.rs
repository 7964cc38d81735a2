//! Journal façade.
//!
//! A [`Journal`] accepts entries, batches them, stages planned upload work
//! in the durable action queue, and drives multipart uploads through the
//! upload coordinator. Producers only ever see `submit`, `stats` and
//! `close`; everything else happens on background tasks owned by the
//! journal.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use snafu::prelude::*;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::batcher::Batcher;
use crate::codec::{CompressFn, Compressor, EncoderFn, build_chunk};
use crate::config::{JournalConfig, Tuning};
use crate::coordinator::UploadCoordinator;
use crate::emit;
use crate::error::{
    ClosedSnafu, ConfigSnafu, JournalError, QueueSnafu, StorageSnafu, TaskJoinSnafu,
};
use crate::metrics::events::{BatchFlushed, EntriesSubmitted};
use crate::position::{Action, Position, advance, format_directory, listing_prefix};
use crate::queue::DurableQueue;
use crate::stats::{Counters, JournalStats};
use crate::store::{ObjectStorage, S3Store};

/// Injectable wall clock; defaults to `Utc::now`.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Builder for a [`Journal`], carrying the knobs that cannot live in the
/// serializable [`JournalConfig`]: the entry encoder, a custom compressor,
/// a storage override, the clock, and the store tuning.
pub struct JournalBuilder<E> {
    pub(crate) config: JournalConfig,
    pub(crate) encoder: EncoderFn<E>,
    pub(crate) compressor: Option<Compressor>,
    pub(crate) storage: Option<Arc<dyn ObjectStorage>>,
    pub(crate) clock: Clock,
    pub(crate) tuning: Tuning,
}

impl<E: Send + 'static> JournalBuilder<E> {
    /// Builder with an explicit entry encoder.
    pub fn with_encoder(
        config: JournalConfig,
        encoder: impl Fn(&E) -> Vec<u8> + Send + Sync + 'static,
    ) -> Self {
        Self {
            config,
            encoder: Arc::new(encoder),
            compressor: None,
            storage: None,
            clock: Arc::new(Utc::now),
            tuning: Tuning::default(),
        }
    }

    /// Replace the configured compression with a custom closure.
    pub fn compressor(mut self, f: impl Fn(&[u8]) -> Vec<u8> + Send + Sync + 'static) -> Self {
        let f: CompressFn = Arc::new(f);
        self.compressor = Some(Compressor::Custom(f));
        self
    }

    /// Use the given store instead of building an S3 client from config.
    pub fn storage(mut self, storage: Arc<dyn ObjectStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Inject a wall clock (used by directory rollover tests).
    pub fn clock(mut self, clock: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Override store limits and pacing.
    pub fn tuning(mut self, tuning: Tuning) -> Self {
        self.tuning = tuning;
        self
    }

    /// Validate the configuration and open a single-shard journal.
    pub async fn open(self) -> Result<Journal<E>, JournalError> {
        self.config.validate().context(ConfigSnafu)?;
        self.open_single().await
    }

    pub(crate) async fn open_single(self) -> Result<Journal<E>, JournalError> {
        let JournalBuilder {
            config,
            encoder,
            compressor,
            storage,
            clock,
            tuning,
        } = self;

        let compressor = compressor.unwrap_or(Compressor::Builtin(config.compression));
        let storage: Arc<dyn ObjectStorage> = match storage {
            Some(storage) => storage,
            None => Arc::new(S3Store::from_config(&config).await),
        };

        let queue = Arc::new(
            DurableQueue::open(&config.local_directory, "journal", config.fsync)
                .await
                .context(QueueSnafu)?,
        );

        let position = initial_position(&config, &tuning, &queue, storage.as_ref(), &clock).await?;
        info!(
            "Journal {} starting at part {} in {}",
            config.id, position.part_index, position.directory
        );
        queue
            .put(&Action::Start(position.clone()))
            .await
            .context(QueueSnafu)?;

        let counters = Arc::new(Counters::default());
        let drain = CancellationToken::new();
        let kill = CancellationToken::new();

        let coordinator = UploadCoordinator::new(
            queue.clone(),
            storage,
            config.bucket.clone(),
            config.id.clone(),
            listing_prefix(&config.directory_format),
            tuning.clone(),
            counters.clone(),
            drain.clone(),
            kill.clone(),
        )
        .spawn();

        // flush path: encode the batch into one chunk, advance the position
        // under the lock, then persist starts first, the chunk, and finally
        // the remaining upload/end actions
        let position = Arc::new(StdMutex::new(position));
        let flush_queue = queue.clone();
        let delimiter = config.delimiter.clone();
        let directory_format = config.directory_format.clone();
        let flush_tuning = tuning.clone();
        let on_flush = move |batch: Vec<E>| {
            let queue = flush_queue.clone();
            let encoder = encoder.clone();
            let compressor = compressor.clone();
            let delimiter = delimiter.clone();
            let directory_format = directory_format.clone();
            let tuning = flush_tuning.clone();
            let clock = clock.clone();
            let position = position.clone();
            async move {
                let chunk = match build_chunk(&batch, &encoder, &delimiter, &compressor) {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        error!("Failed to encode batch of {} entries: {}", batch.len(), e);
                        return;
                    }
                };
                let entry_count = chunk.entries;
                let chunk_size = chunk.bytes.len() as u64;
                emit!(BatchFlushed {
                    entries: entry_count,
                    bytes: chunk_size,
                });

                let now = (clock)();
                let (next, actions) = {
                    let mut position = position.lock().expect("position lock");
                    let (next, actions) =
                        advance(&tuning, &position, &directory_format, chunk_size, now);
                    *position = next.clone();
                    (next, actions)
                };

                let conj = Action::Conj {
                    position: next,
                    entry_count,
                    bytes: chunk.bytes,
                };
                let (starts, rest): (Vec<Action>, Vec<Action>) = actions
                    .into_iter()
                    .partition(|action| matches!(action, Action::Start(_)));

                for action in starts.iter().chain(std::iter::once(&conj)).chain(rest.iter()) {
                    if let Err(e) = queue.put(action).await {
                        error!(
                            "Failed to persist {} action ({} entries at risk): {}",
                            action.kind(),
                            entry_count,
                            e
                        );
                    }
                }
            }
        };

        let batcher = Batcher::spawn(config.max_batch_size, config.max_batch_latency(), on_flush)
            .context(ConfigSnafu)?;

        Ok(Journal {
            id: config.id,
            batcher,
            queue,
            counters,
            drain,
            kill,
            coordinator: Some(coordinator),
            closed: AtomicBool::new(false),
        })
    }
}

/// Compute the startup position: resume after the highest file already
/// visible for today's directory, whether in the store (completed objects
/// and in-flight uploads) or still pending in the durable queue.
async fn initial_position(
    config: &JournalConfig,
    tuning: &Tuning,
    queue: &DurableQueue,
    storage: &dyn ObjectStorage,
    clock: &Clock,
) -> Result<Position, JournalError> {
    let now = (clock)();
    let directory = format_directory(&config.directory_format, now);

    let snapshot = queue.immediate_snapshot().await;
    let mut highest_pending: Option<u64> = None;
    for task in &snapshot {
        if let Ok(action) = task.action()
            && let Some(position) = action.position()
            && position.directory == directory
        {
            let part = position.part_index;
            highest_pending = Some(highest_pending.map_or(part, |highest| highest.max(part)));
        }
    }
    // hand the snapshot back so it is redelivered in its original order
    for task in &snapshot {
        queue.retry(task).await;
    }

    let prefix = format!("{directory}/{}", config.id);
    let complete = storage
        .list_complete(&config.bucket, &prefix)
        .await
        .context(StorageSnafu)?;
    let pending_uploads = storage
        .list_multipart(&config.bucket, &prefix)
        .await
        .context(StorageSnafu)?;

    let mut keys: std::collections::HashSet<String> = complete.into_iter().collect();
    keys.extend(pending_uploads.into_iter().map(|upload| upload.key));
    let listed_count = keys.len() as u64;

    let queued_count = match highest_pending {
        Some(part) => part.div_ceil(tuning.max_parts_per_file),
        None => 0,
    };

    let file_count = listed_count.max(queued_count);
    Ok(Position::new(
        0,
        tuning.max_parts_per_file * file_count,
        directory,
    ))
}

/// A single-shard journal. See the crate docs for the pipeline layout.
pub struct Journal<E> {
    id: String,
    batcher: Batcher<E>,
    queue: Arc<DurableQueue>,
    counters: Arc<Counters>,
    drain: CancellationToken,
    kill: CancellationToken,
    coordinator: Option<JoinHandle<()>>,
    closed: AtomicBool,
}

impl<E: AsRef<[u8]> + Send + 'static> Journal<E> {
    /// Builder with the default bytes-of-value encoder.
    pub fn builder(config: JournalConfig) -> JournalBuilder<E> {
        JournalBuilder::with_encoder(config, |entry: &E| entry.as_ref().to_vec())
    }
}

impl<E: Send + 'static> Journal<E> {
    /// Hand one entry to the journal. Blocks while the batcher is at
    /// capacity; fails once the journal is closed.
    pub async fn submit(&self, entry: E) -> Result<(), JournalError> {
        ensure!(!self.closed.load(Ordering::Acquire), ClosedSnafu);
        self.batcher
            .submit(entry)
            .await
            .map_err(|_| JournalError::Closed)?;
        self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
        emit!(EntriesSubmitted { count: 1 });
        Ok(())
    }

    /// Snapshot of journal progress.
    pub async fn stats(&self) -> JournalStats {
        JournalStats {
            enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            uploaded: self.counters.uploaded.load(Ordering::Relaxed),
            queue: self.queue.stats().await,
        }
    }

    /// Flush buffered entries, drain the upload pipeline, and release all
    /// background tasks. Blocks until outstanding work has been pushed to
    /// the store.
    pub async fn close(&mut self) -> Result<(), JournalError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.batcher.close().await;
        self.queue.put(&Action::Flush).await.context(QueueSnafu)?;
        self.drain.cancel();
        if let Some(handle) = self.coordinator.take() {
            handle.await.context(TaskJoinSnafu)?;
        }
        info!("Journal {} closed", self.id);
        Ok(())
    }
}

impl<E> Drop for Journal<E> {
    fn drop(&mut self) {
        // a journal dropped without close terminates its coordinator
        // immediately; unfinished work stays in the durable queue
        self.kill.cancel();
    }
}
