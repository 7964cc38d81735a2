//! Durable action queue.
//!
//! A named crash-safe FIFO: `put` appends a framed record to an append-only
//! slab file (optionally fsyncing), `take` hands out task handles, and
//! progress is acknowledged through `complete` / `retry`. Uncompleted
//! records survive process death and are redelivered in write order on the
//! next open. Fully-acknowledged slabs are deleted; a fully-drained queue
//! resets its slab and ack state to zero length.

mod slab;

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use snafu::prelude::*;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

use crate::emit;
use crate::error::{CorruptRecordSnafu, OpenDirSnafu, QueueError, SlabIoSnafu};
use crate::metrics::events::QueueDepth;
use crate::position::Action;

/// Rotate to a fresh slab once the active one grows past this size.
const SLAB_MAX_BYTES: u64 = 64 * 1024 * 1024;

/// Handle to one durable record. Dereference with [`QueueTask::action`];
/// decoding fails if the stored payload is corrupt.
#[derive(Debug, Clone)]
pub struct QueueTask {
    id: u64,
    payload: Arc<Vec<u8>>,
    crc_ok: bool,
}

impl QueueTask {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Decode the action carried by this task.
    pub fn action(&self) -> Result<Action, QueueError> {
        ensure!(
            self.crc_ok,
            CorruptRecordSnafu {
                id: self.id,
                message: "payload crc mismatch".to_string(),
            }
        );
        slab::decode_payload(self.id, &self.payload)
    }
}

/// Counters reported by [`DurableQueue::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub in_progress: u64,
    pub completed: u64,
    pub retried: u64,
    pub enqueued: u64,
    pub num_slabs: u64,
    pub num_active_slabs: u64,
}

impl QueueStats {
    /// Field-wise sum, used when merging per-shard snapshots.
    pub fn merge(self, other: QueueStats) -> QueueStats {
        QueueStats {
            in_progress: self.in_progress + other.in_progress,
            completed: self.completed + other.completed,
            retried: self.retried + other.retried,
            enqueued: self.enqueued + other.enqueued,
            num_slabs: self.num_slabs + other.num_slabs,
            num_active_slabs: self.num_active_slabs + other.num_active_slabs,
        }
    }
}

struct SlabWriter {
    file: BufWriter<File>,
    index: u64,
    len: u64,
    path: PathBuf,
}

struct State {
    pending: VecDeque<QueueTask>,
    in_progress: HashMap<u64, QueueTask>,
    /// Slab index -> unacked record count. Every slab file on disk has an
    /// entry; only the active slab may sit at zero.
    live: BTreeMap<u64, usize>,
    task_slab: HashMap<u64, u64>,
    writer: SlabWriter,
    ack: File,
    next_id: u64,
}

/// A named durable FIFO of [`Action`] records.
pub struct DurableQueue {
    dir: PathBuf,
    topic: String,
    fsync: bool,
    slab_max_bytes: u64,
    state: Mutex<State>,
    notify: Notify,
    enqueued: AtomicU64,
    completed: AtomicU64,
    retried: AtomicU64,
}

impl DurableQueue {
    /// Open (or create) the queue under `dir`, replaying uncompleted
    /// records from previous runs.
    pub async fn open(
        dir: impl Into<PathBuf>,
        topic: impl Into<String>,
        fsync: bool,
    ) -> Result<Self, QueueError> {
        Self::open_inner(dir.into(), topic.into(), fsync, SLAB_MAX_BYTES).await
    }

    async fn open_inner(
        dir: PathBuf,
        topic: String,
        fsync: bool,
        slab_max_bytes: u64,
    ) -> Result<Self, QueueError> {
        std::fs::create_dir_all(&dir).context(OpenDirSnafu { path: dir.clone() })?;

        let ack_path = dir.join(slab::ack_filename(&topic));
        let acked = slab::read_acks(&ack_path)?;

        let mut pending = VecDeque::new();
        let mut live = BTreeMap::new();
        let mut task_slab = HashMap::new();
        let mut next_id = 0u64;

        let slabs = slab::find_slabs(&dir, &topic);
        let writer_index = slabs.last().map(|(idx, _)| *idx).unwrap_or(0);

        for (idx, path) in &slabs {
            let scan = slab::scan_slab(path)?;
            let file_len = std::fs::metadata(path)
                .context(SlabIoSnafu { path: path.clone() })?
                .len();
            if scan.valid_len < file_len {
                warn!(
                    "Truncating torn slab tail {:?}: {} -> {} bytes",
                    path, file_len, scan.valid_len
                );
                let file = std::fs::OpenOptions::new()
                    .write(true)
                    .open(path)
                    .context(SlabIoSnafu { path: path.clone() })?;
                file.set_len(scan.valid_len)
                    .context(SlabIoSnafu { path: path.clone() })?;
            }

            let mut count = 0usize;
            for record in scan.records {
                next_id = next_id.max(record.id + 1);
                if acked.contains(&record.id) {
                    continue;
                }
                count += 1;
                task_slab.insert(record.id, *idx);
                pending.push_back(QueueTask {
                    id: record.id,
                    payload: Arc::new(record.payload),
                    crc_ok: record.crc_ok,
                });
            }

            if count == 0 && *idx != writer_index {
                if let Err(e) = std::fs::remove_file(path) {
                    warn!("Failed to remove fully acked slab {:?}: {}", path, e);
                }
                continue;
            }
            live.insert(*idx, count);
        }

        let writer_path = dir.join(slab::slab_filename(&topic, writer_index));
        let writer_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&writer_path)
            .await
            .context(SlabIoSnafu {
                path: writer_path.clone(),
            })?;
        let writer_len = writer_file
            .metadata()
            .await
            .context(SlabIoSnafu {
                path: writer_path.clone(),
            })?
            .len();
        live.entry(writer_index).or_insert(0);

        let ack = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&ack_path)
            .await
            .context(SlabIoSnafu {
                path: ack_path.clone(),
            })?;

        let recovered = pending.len() as u64;
        if recovered > 0 {
            info!(
                "Queue '{}' recovered {} uncompleted actions from {:?}",
                topic, recovered, dir
            );
        }

        Ok(Self {
            dir,
            topic,
            fsync,
            slab_max_bytes,
            state: Mutex::new(State {
                pending,
                in_progress: HashMap::new(),
                live,
                task_slab,
                writer: SlabWriter {
                    file: BufWriter::new(writer_file),
                    index: writer_index,
                    len: writer_len,
                    path: writer_path,
                },
                ack,
                next_id,
            }),
            notify: Notify::new(),
            enqueued: AtomicU64::new(recovered),
            completed: AtomicU64::new(0),
            retried: AtomicU64::new(0),
        })
    }

    /// Durably append an action and make it available to takers.
    pub async fn put(&self, action: &Action) -> Result<(), QueueError> {
        let payload = slab::encode_payload(action)?;

        let mut state = self.state.lock().await;
        let id = state.next_id;
        state.next_id += 1;
        let frame = slab::frame_record(id, &payload);

        if state.writer.len + frame.len() as u64 > self.slab_max_bytes && state.writer.len > 0 {
            self.rotate(&mut state).await?;
        }

        let path = state.writer.path.clone();
        state
            .writer
            .file
            .write_all(&frame)
            .await
            .context(SlabIoSnafu { path: path.clone() })?;
        state
            .writer
            .file
            .flush()
            .await
            .context(SlabIoSnafu { path: path.clone() })?;
        if self.fsync {
            state
                .writer
                .file
                .get_ref()
                .sync_data()
                .await
                .context(SlabIoSnafu { path })?;
        }
        state.writer.len += frame.len() as u64;

        let slab_index = state.writer.index;
        *state.live.entry(slab_index).or_default() += 1;
        state.task_slab.insert(id, slab_index);
        state.pending.push_back(QueueTask {
            id,
            payload: Arc::new(payload),
            crc_ok: true,
        });

        self.enqueued.fetch_add(1, Ordering::Relaxed);
        emit!(QueueDepth {
            count: state.pending.len() + state.in_progress.len(),
        });
        drop(state);

        self.notify.notify_one();
        Ok(())
    }

    /// Take the next task, waiting until one is available.
    pub async fn take(&self) -> QueueTask {
        loop {
            let notified = self.notify.notified();
            if let Some(task) = self.pop().await {
                return task;
            }
            notified.await;
        }
    }

    /// Take the next task, waiting at most `timeout`.
    pub async fn take_timeout(&self, timeout: Duration) -> Option<QueueTask> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            if let Some(task) = self.pop().await {
                return Some(task);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.pop().await;
            }
        }
    }

    async fn pop(&self) -> Option<QueueTask> {
        let mut state = self.state.lock().await;
        let task = state.pending.pop_front()?;
        state.in_progress.insert(task.id, task.clone());
        Some(task)
    }

    /// Acknowledge a task as done; it will never be redelivered.
    pub async fn complete(&self, task: &QueueTask) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        if state.in_progress.remove(&task.id).is_none() {
            debug!("Ignoring completion of unknown task {}", task.id);
            return Ok(());
        }

        let ack_path = self.dir.join(slab::ack_filename(&self.topic));
        let entry = slab::frame_ack(task.id);
        state.ack.write_all(&entry).await.context(SlabIoSnafu {
            path: ack_path.clone(),
        })?;
        if self.fsync {
            state
                .ack
                .sync_data()
                .await
                .context(SlabIoSnafu { path: ack_path })?;
        }
        self.completed.fetch_add(1, Ordering::Relaxed);

        if let Some(slab_index) = state.task_slab.remove(&task.id)
            && let Some(count) = state.live.get_mut(&slab_index)
        {
            *count = count.saturating_sub(1);
            if *count == 0 && slab_index != state.writer.index {
                state.live.remove(&slab_index);
                let path = self.dir.join(slab::slab_filename(&self.topic, slab_index));
                match std::fs::remove_file(&path) {
                    Ok(()) => debug!("Dropped fully acked slab {:?}", path),
                    Err(e) => warn!("Failed to remove slab {:?}: {}", path, e),
                }
            }
        }

        if state.pending.is_empty() && state.in_progress.is_empty() {
            self.reset(&mut state).await?;
        }

        emit!(QueueDepth {
            count: state.pending.len() + state.in_progress.len(),
        });
        Ok(())
    }

    /// Hand a task back for redelivery after the currently pending tasks.
    pub async fn retry(&self, task: &QueueTask) {
        let mut state = self.state.lock().await;
        match state.in_progress.remove(&task.id) {
            Some(task) => {
                state.pending.push_back(task);
                self.retried.fetch_add(1, Ordering::Relaxed);
            }
            None => {
                debug!("Ignoring retry of unknown task {}", task.id);
                return;
            }
        }
        drop(state);
        self.notify.notify_one();
    }

    /// Non-destructive peek used during recovery: every pending task moves
    /// to in-progress and is returned. Callers must `retry` (preserving
    /// order) or `complete` each returned task.
    pub async fn immediate_snapshot(&self) -> Vec<QueueTask> {
        let mut state = self.state.lock().await;
        let tasks: Vec<QueueTask> = state.pending.drain(..).collect();
        for task in &tasks {
            state.in_progress.insert(task.id, task.clone());
        }
        tasks
    }

    /// Counter snapshot.
    pub async fn stats(&self) -> QueueStats {
        let state = self.state.lock().await;
        QueueStats {
            in_progress: state.in_progress.len() as u64,
            completed: self.completed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            enqueued: self.enqueued.load(Ordering::Relaxed),
            num_slabs: state.live.len() as u64,
            num_active_slabs: state.live.values().filter(|count| **count > 0).count() as u64,
        }
    }

    async fn rotate(&self, state: &mut State) -> Result<(), QueueError> {
        let old_path = state.writer.path.clone();
        state
            .writer
            .file
            .flush()
            .await
            .context(SlabIoSnafu {
                path: old_path.clone(),
            })?;
        state
            .writer
            .file
            .get_ref()
            .sync_data()
            .await
            .context(SlabIoSnafu { path: old_path })?;

        let index = state.writer.index + 1;
        let path = self.dir.join(slab::slab_filename(&self.topic, index));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .context(SlabIoSnafu { path: path.clone() })?;

        debug!(
            "Queue '{}' rotated slab {} -> {}",
            self.topic, state.writer.index, index
        );
        state.writer = SlabWriter {
            file: BufWriter::new(file),
            index,
            len: 0,
            path,
        };
        state.live.insert(index, 0);
        Ok(())
    }

    /// Truncate slab and ack state once the queue is fully drained.
    async fn reset(&self, state: &mut State) -> Result<(), QueueError> {
        let writer_path = state.writer.path.clone();
        state
            .writer
            .file
            .flush()
            .await
            .context(SlabIoSnafu {
                path: writer_path.clone(),
            })?;
        state
            .writer
            .file
            .get_ref()
            .set_len(0)
            .await
            .context(SlabIoSnafu { path: writer_path })?;
        state.writer.len = 0;

        let writer_index = state.writer.index;
        for (&index, _) in state.live.clone().iter() {
            if index != writer_index {
                let path = self.dir.join(slab::slab_filename(&self.topic, index));
                if let Err(e) = std::fs::remove_file(&path) {
                    warn!("Failed to remove slab {:?}: {}", path, e);
                }
            }
        }
        state.live.clear();
        state.live.insert(writer_index, 0);
        state.task_slab.clear();

        let ack_path = self.dir.join(slab::ack_filename(&self.topic));
        state
            .ack
            .set_len(0)
            .await
            .context(SlabIoSnafu { path: ack_path })?;

        debug!("Queue '{}' drained; slab state reset", self.topic);
        Ok(())
    }
}
