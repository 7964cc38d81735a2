//! Entry batching.
//!
//! Producers hand entries to the batcher; a single background task
//! coalesces them into bounded batches (by count and/or age) and invokes
//! the flush callback. Flushes are serialized by construction — the task
//! owns both the buffer and the callback. `submit` applies backpressure by
//! awaiting channel capacity while a size-triggered flush drains.

use std::future::Future;
use std::time::Duration;

use snafu::prelude::*;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{ConfigError, MissingBatchBoundSnafu};

/// Channel capacity when only a latency bound is configured.
const DEFAULT_QUEUE_DEPTH: usize = 8192;

/// Handle to the batching task.
pub struct Batcher<E> {
    tx: mpsc::Sender<E>,
    shutdown: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl<E: Send + 'static> Batcher<E> {
    /// Spawn the batching task. At least one of `max_size` / `max_latency`
    /// is required.
    pub fn spawn<F, Fut>(
        max_size: Option<usize>,
        max_latency: Option<Duration>,
        on_flush: F,
    ) -> Result<Self, ConfigError>
    where
        F: FnMut(Vec<E>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        ensure!(
            max_size.is_some() || max_latency.is_some(),
            MissingBatchBoundSnafu
        );

        let capacity = max_size.unwrap_or(DEFAULT_QUEUE_DEPTH).max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let shutdown = CancellationToken::new();

        let handle = tokio::spawn(Self::run(
            rx,
            max_size,
            max_latency,
            on_flush,
            shutdown.clone(),
        ));

        Ok(Self {
            tx,
            shutdown,
            handle: Some(handle),
        })
    }

    /// Enqueue one entry, waiting for capacity while a flush drains.
    /// Fails once the batcher has shut down.
    pub async fn submit(&self, entry: E) -> Result<(), E> {
        self.tx.send(entry).await.map_err(|e| e.0)
    }

    /// Stop accepting entries, flush whatever is buffered, and wait for the
    /// task to finish.
    pub async fn close(&mut self) {
        self.shutdown.cancel();
        if let Some(handle) = self.handle.take()
            && let Err(e) = handle.await
        {
            debug!("Batcher task ended abnormally: {}", e);
        }
    }

    async fn run<F, Fut>(
        mut rx: mpsc::Receiver<E>,
        max_size: Option<usize>,
        max_latency: Option<Duration>,
        mut on_flush: F,
        shutdown: CancellationToken,
    ) where
        F: FnMut(Vec<E>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut buf: Vec<E> = Vec::with_capacity(max_size.unwrap_or(0));
        // with no latency bound the timer never fires
        let idle = Duration::from_secs(3600);
        let latency = max_latency.unwrap_or(idle);
        let mut deadline = Instant::now() + latency;

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,

                _ = tokio::time::sleep_until(deadline) => {
                    // the timer may fire with nothing buffered; that's a no-op
                    if !buf.is_empty() {
                        on_flush(std::mem::take(&mut buf)).await;
                    }
                    deadline = Instant::now() + latency;
                }

                entry = rx.recv() => match entry {
                    Some(entry) => {
                        buf.push(entry);
                        if let Some(max) = max_size
                            && buf.len() >= max
                        {
                            on_flush(std::mem::take(&mut buf)).await;
                            deadline = Instant::now() + latency;
                        }
                    }
                    None => break,
                },
            }
        }

        // drain whatever producers managed to enqueue, then flush once more
        rx.close();
        while let Some(entry) = rx.recv().await {
            buf.push(entry);
            if let Some(max) = max_size
                && buf.len() >= max
            {
                on_flush(std::mem::take(&mut buf)).await;
            }
        }
        if !buf.is_empty() {
            on_flush(buf).await;
        }
        debug!("Batcher task finished");
    }
}
