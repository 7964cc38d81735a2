//! Upload coordinator.
//!
//! A single consumer task over the durable action queue. It exclusively
//! owns the in-memory upload state (multipart descriptors plus per-part
//! accumulation), executes `start`/`conj`/`upload`/`end`/`flush` actions,
//! reconciles prior in-flight uploads on startup, and commits progress by
//! completing queue tasks only after the corresponding bytes are stored.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::Ordering;

use bytes::Bytes;
use regex::Regex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Tuning;
use crate::emit;
use crate::error::StorageError;
use crate::metrics::events::{
    ActionRetried, CorruptTaskDropped, MultipartAborted, MultipartCompleted, MultipartStarted,
    PartUploaded, UploadBacklog,
};
use crate::position::{Action, FileId, Position, wire_part_number};
use crate::queue::{DurableQueue, QueueTask};
use crate::stats::Counters;
use crate::store::{MultipartDescriptor, ObjectStorage, PartRef};

/// A chunk waiting inside a part: the queue task that carried it plus the
/// decoded payload. The task is completed once the part is stored.
struct ConjTask {
    task: QueueTask,
    entries: u64,
    bytes: Bytes,
}

#[derive(Default)]
struct PartState {
    tasks: Vec<ConjTask>,
    etag: Option<String>,
    size: u64,
    uploaded: bool,
    last: bool,
}

impl PartState {
    fn accumulated_len(&self) -> u64 {
        self.tasks.iter().map(|conj| conj.bytes.len() as u64).sum()
    }
}

struct UploadRecord {
    descriptor: MultipartDescriptor,
    parts: BTreeMap<u64, PartState>,
}

/// What an `end` action should do after inspecting the part table.
enum EndStep {
    UploadRemaining { part_index: u64, last: bool },
    Finalize,
    RetryLater,
}

pub(crate) struct UploadCoordinator {
    queue: Arc<DurableQueue>,
    storage: Arc<dyn ObjectStorage>,
    bucket: String,
    journal_id: String,
    listing_prefix: String,
    key_pattern: Regex,
    tuning: Tuning,
    counters: Arc<Counters>,
    drain: CancellationToken,
    kill: CancellationToken,
    uploads: HashMap<FileId, UploadRecord>,
}

impl UploadCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        queue: Arc<DurableQueue>,
        storage: Arc<dyn ObjectStorage>,
        bucket: String,
        journal_id: String,
        listing_prefix: String,
        tuning: Tuning,
        counters: Arc<Counters>,
        drain: CancellationToken,
        kill: CancellationToken,
    ) -> Self {
        let key_pattern = Regex::new(&format!(
            r"^(?P<dir>.+)/{}-(?P<file>\d{{6}})\.journal$",
            regex::escape(&journal_id)
        ))
        .expect("journal key pattern");

        Self {
            queue,
            storage,
            bucket,
            journal_id,
            listing_prefix,
            key_pattern,
            tuning,
            counters,
            drain,
            kill,
            uploads: HashMap::new(),
        }
    }

    pub(crate) fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        // recovery must succeed before consuming: without the rebuilt part
        // table, redelivered tasks for in-flight files would be dropped
        loop {
            match self.recover().await {
                Ok(()) => break,
                Err(e) => {
                    info!("Upload state recovery failed, retrying: {}", e);
                    tokio::select! {
                        _ = self.kill.cancelled() => return,
                        _ = tokio::time::sleep(self.tuning.retry_delay) => {}
                    }
                }
            }
        }

        info!("Upload coordinator started ({})", self.journal_id);
        loop {
            let task = if self.drain.is_cancelled() {
                match self.queue.take_timeout(self.tuning.drain_take_timeout).await {
                    Some(task) => task,
                    None => break,
                }
            } else {
                tokio::select! {
                    biased;
                    _ = self.kill.cancelled() => {
                        debug!("Upload coordinator killed before drain");
                        return;
                    }
                    _ = self.drain.cancelled() => continue,
                    task = self.queue.take() => task,
                }
            };

            self.dispatch(task).await;
        }
        info!("Upload coordinator drained and stopped ({})", self.journal_id);
    }

    /// Rebuild upload state from the store's view of in-flight multipart
    /// uploads, then schedule an `end` to drive each to completion.
    async fn recover(&mut self) -> Result<(), StorageError> {
        let pending = self
            .storage
            .list_multipart(&self.bucket, &self.listing_prefix)
            .await?;

        for upload in pending {
            let Some(captures) = self.key_pattern.captures(&upload.key) else {
                continue;
            };
            let directory = captures["dir"].to_string();
            let Ok(file_number) = captures["file"].parse::<u64>() else {
                continue;
            };
            let part_base = file_number * self.tuning.max_parts_per_file;

            let descriptor = MultipartDescriptor {
                bucket: self.bucket.clone(),
                key: upload.key.clone(),
                upload_id: upload.upload_id.clone(),
            };
            let listed = match self.storage.list_parts(&descriptor).await {
                Ok(parts) => parts,
                // finalized between the two listings
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            };

            let mut parts = BTreeMap::new();
            for part in listed {
                let part_index = part_base + part.part_number as u64 - 1;
                parts.insert(
                    part_index,
                    PartState {
                        tasks: Vec::new(),
                        etag: Some(part.etag),
                        size: part.size,
                        uploaded: true,
                        last: false,
                    },
                );
            }

            info!(
                "Recovered in-flight upload {} ({} stored parts)",
                upload.key,
                parts.len()
            );
            let file = FileId {
                part_base,
                directory: directory.clone(),
            };
            self.uploads.insert(file, UploadRecord { descriptor, parts });

            let end = Action::End(Position::new(0, part_base, directory));
            if let Err(e) = self.queue.put(&end).await {
                warn!("Failed to enqueue end for recovered {}: {}", upload.key, e);
            }
        }
        Ok(())
    }

    async fn dispatch(&mut self, task: QueueTask) {
        let action = match task.action() {
            Ok(action) => action,
            Err(e) => {
                // the bytes referenced by this record are lost; accepted
                // tradeoff of staging whole parts through the queue
                warn!("Dropping corrupt queue task {}: {}", task.id(), e);
                emit!(CorruptTaskDropped);
                self.complete(&task).await;
                return;
            }
        };

        // anything but start/flush requires a live upload for its file
        if !matches!(action, Action::Start(_) | Action::Flush | Action::Skip)
            && let Some(position) = action.position()
            && !self.uploads.contains_key(&position.file_id(&self.tuning))
        {
            debug!(
                "Dropping {} aimed at finalized file (part {}, {})",
                action.kind(),
                position.part_index,
                position.directory
            );
            self.complete(&task).await;
            return;
        }

        match action {
            Action::Start(position) => self.handle_start(task, position).await,
            Action::Conj {
                position,
                entry_count,
                bytes,
            } => self.handle_conj(task, position, entry_count, bytes).await,
            Action::Upload(position) => self.handle_upload(task, position).await,
            Action::End(position) => self.handle_end(task, position).await,
            Action::Flush => self.handle_flush(task).await,
            Action::Skip => self.complete(&task).await,
        }
    }

    async fn handle_start(&mut self, task: QueueTask, position: Position) {
        let file = position.file_id(&self.tuning);
        if self.uploads.contains_key(&file) {
            self.complete(&task).await;
            return;
        }

        let key = file.key(&self.journal_id, &self.tuning);
        // order within the file depends on this descriptor existing, so
        // there is no alternative to retrying until the store accepts
        let descriptor = loop {
            match self.storage.init_multipart(&self.bucket, &key).await {
                Ok(descriptor) => break descriptor,
                Err(e) => {
                    info!("Multipart init failed for {}, retrying: {}", key, e);
                    emit!(ActionRetried { kind: "start" });
                    tokio::select! {
                        _ = self.kill.cancelled() => return,
                        _ = tokio::time::sleep(self.tuning.retry_delay) => {}
                    }
                }
            }
        };

        emit!(MultipartStarted);
        info!("Started multipart upload {} ({})", key, descriptor.upload_id);
        self.uploads.insert(
            file,
            UploadRecord {
                descriptor,
                parts: BTreeMap::new(),
            },
        );
        self.complete(&task).await;
    }

    async fn handle_conj(
        &mut self,
        task: QueueTask,
        position: Position,
        entry_count: u64,
        bytes: Vec<u8>,
    ) {
        let file = position.file_id(&self.tuning);
        let Some(record) = self.uploads.get_mut(&file) else {
            self.complete(&task).await;
            return;
        };

        let part = record.parts.entry(position.part_index).or_default();
        if part.uploaded {
            // recovery overlap: these bytes are already in the store
            debug!(
                "Chunk for already-stored part {} of {}; dropping",
                position.part_index, record.descriptor.key
            );
            self.complete(&task).await;
            return;
        }

        part.tasks.push(ConjTask {
            task,
            entries: entry_count,
            bytes: Bytes::from(bytes),
        });
        // the task is completed when the part uploads
    }

    async fn handle_upload(&mut self, task: QueueTask, position: Position) {
        let file = position.file_id(&self.tuning);
        let Some(record) = self.uploads.get(&file) else {
            self.complete(&task).await;
            return;
        };
        let already_done = match record.parts.get(&position.part_index) {
            // nothing accumulated for this part; nothing to upload
            None => true,
            Some(part) => part.uploaded,
        };
        if already_done {
            self.complete(&task).await;
            return;
        }

        match self
            .upload_accumulated(&file, position.part_index, false)
            .await
        {
            // stored, or the whole upload vanished; either way this task is done
            Ok(_) => self.complete(&task).await,
            Err(e) => {
                info!(
                    "Part {} upload failed for {}: {}",
                    wire_part_number(position.part_index, &self.tuning),
                    file.key(&self.journal_id, &self.tuning),
                    e
                );
                self.retry(&task, "upload").await;
            }
        }
    }

    async fn handle_end(&mut self, task: QueueTask, position: Position) {
        let file = position.file_id(&self.tuning);
        let Some(record) = self.uploads.get(&file) else {
            self.complete(&task).await;
            return;
        };

        let un_uploaded: Vec<u64> = record
            .parts
            .iter()
            .filter(|(_, part)| !part.uploaded)
            .map(|(&part_index, _)| part_index)
            .collect();

        let step = match un_uploaded.as_slice() {
            [] => EndStep::Finalize,
            [part_index] => {
                let last = Some(part_index) == record.parts.keys().last();
                let size = record.parts[part_index].accumulated_len();
                if last || size > self.tuning.min_part_size {
                    EndStep::UploadRemaining {
                        part_index: *part_index,
                        last,
                    }
                } else {
                    EndStep::RetryLater
                }
            }
            // pending upload actions still have to clear
            _ => EndStep::RetryLater,
        };

        match step {
            EndStep::RetryLater => self.retry(&task, "end").await,
            EndStep::UploadRemaining { part_index, last } => {
                match self.upload_accumulated(&file, part_index, last).await {
                    Ok(true) => self.finalize(task, &file).await,
                    // the upload vanished and the record is gone
                    Ok(false) => self.complete(&task).await,
                    Err(e) => {
                        info!(
                            "Final part upload failed for {}: {}",
                            file.key(&self.journal_id, &self.tuning),
                            e
                        );
                        self.retry(&task, "end").await;
                    }
                }
            }
            EndStep::Finalize => self.finalize(task, &file).await,
        }
    }

    async fn handle_flush(&mut self, task: QueueTask) {
        let mut files: Vec<&FileId> = self.uploads.keys().collect();
        files.sort_by_key(|file| (file.directory.clone(), file.part_base));
        let ends: Vec<Position> = files
            .into_iter()
            .map(|file| Position::new(0, file.part_base, file.directory.clone()))
            .collect();

        debug!("Flush: scheduling {} end actions", ends.len());
        for position in ends {
            if let Err(e) = self.queue.put(&Action::End(position)).await {
                warn!("Failed to enqueue end action during flush: {}", e);
            }
        }
        self.complete(&task).await;
    }

    /// Upload the bytes accumulated for one part. Returns `Ok(false)` when
    /// the target upload no longer exists (404): the upload record is
    /// discarded and every task under it completed.
    async fn upload_accumulated(
        &mut self,
        file: &FileId,
        part_index: u64,
        last: bool,
    ) -> Result<bool, StorageError> {
        let (descriptor, bytes) = {
            let Some(record) = self.uploads.get(file) else {
                return Ok(false);
            };
            let Some(part) = record.parts.get(&part_index) else {
                return Ok(false);
            };
            let mut joined = Vec::with_capacity(part.accumulated_len() as usize);
            for conj in &part.tasks {
                joined.extend_from_slice(&conj.bytes);
            }
            (record.descriptor.clone(), Bytes::from(joined))
        };

        let part_number = wire_part_number(part_index, &self.tuning);
        match self
            .storage
            .upload_part(&descriptor, part_number, bytes, last)
            .await
        {
            Ok(uploaded) => {
                let size = uploaded.size;
                let conj_tasks = {
                    let Some(record) = self.uploads.get_mut(file) else {
                        return Ok(false);
                    };
                    let Some(part) = record.parts.get_mut(&part_index) else {
                        return Ok(false);
                    };
                    part.uploaded = true;
                    part.etag = Some(uploaded.etag);
                    part.size = size;
                    part.last = last;
                    std::mem::take(&mut part.tasks)
                };

                let entries: u64 = conj_tasks.iter().map(|conj| conj.entries).sum();
                for conj in &conj_tasks {
                    self.complete(&conj.task).await;
                }

                let uploaded_total =
                    self.counters.uploaded.fetch_add(entries, Ordering::Relaxed) + entries;
                let enqueued_total = self.counters.enqueued.load(Ordering::Relaxed);
                emit!(PartUploaded {
                    bytes: size,
                    entries,
                });
                emit!(UploadBacklog {
                    entries: enqueued_total.saturating_sub(uploaded_total),
                });
                debug!(
                    "Uploaded part {} of {} ({} bytes, {} entries)",
                    part_number, descriptor.key, size, entries
                );
                Ok(true)
            }
            Err(e) if e.is_not_found() => {
                info!(
                    "Upload {} is gone (404); treating as finalized",
                    descriptor.key
                );
                self.discard_upload(file).await;
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Complete the multipart upload from its uploaded parts (or abort it
    /// when no part was ever stored).
    async fn finalize(&mut self, task: QueueTask, file: &FileId) {
        let Some(record) = self.uploads.get(file) else {
            self.complete(&task).await;
            return;
        };

        // BTreeMap order makes part numbers ascending within the file
        let parts: Vec<PartRef> = record
            .parts
            .iter()
            .map(|(&part_index, part)| PartRef {
                part_number: wire_part_number(part_index, &self.tuning),
                etag: part.etag.clone().unwrap_or_default(),
            })
            .collect();
        let descriptor = record.descriptor.clone();

        match self.storage.complete_multipart(&descriptor, &parts).await {
            Ok(()) => {
                if parts.is_empty() {
                    emit!(MultipartAborted);
                    info!("Aborted empty multipart upload {}", descriptor.key);
                } else {
                    emit!(MultipartCompleted {
                        parts: parts.len() as u64,
                    });
                    info!(
                        "Completed multipart upload {} ({} parts)",
                        descriptor.key,
                        parts.len()
                    );
                }
                self.uploads.remove(file);
                self.complete(&task).await;
            }
            Err(e) => {
                info!("Multipart completion failed for {}: {}", descriptor.key, e);
                self.retry(&task, "end").await;
            }
        }
    }

    /// Drop an upload whose multipart id no longer exists, completing every
    /// task that contributed to it.
    async fn discard_upload(&mut self, file: &FileId) {
        if let Some(record) = self.uploads.remove(file) {
            for (_, part) in record.parts {
                for conj in part.tasks {
                    self.complete(&conj.task).await;
                }
            }
        }
    }

    async fn complete(&self, task: &QueueTask) {
        if let Err(e) = self.queue.complete(task).await {
            warn!("Failed to record completion of task {}: {}", task.id(), e);
        }
    }

    /// Requeue the task and pace the loop before touching the store again.
    async fn retry(&self, task: &QueueTask, kind: &'static str) {
        emit!(ActionRetried { kind });
        self.queue.retry(task).await;
        tokio::select! {
            _ = self.kill.cancelled() => {}
            _ = tokio::time::sleep(self.tuning.retry_delay) => {}
        }
    }
}
