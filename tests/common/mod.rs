//! Shared helpers for scenario tests: store wrappers that inject faults,
//! gate uploads or simulate outages, plus a settable test clock.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use drift::error::StorageError;
use drift::store::{
    MemoryStore, MultipartDescriptor, ObjectStorage, PartRef, PendingMultipart, UploadedPart,
};
use drift::{JournalConfig, Tuning};

/// Store limits scaled down so a few hundred small entries exercise part
/// and file rollover.
pub fn test_tuning() -> Tuning {
    Tuning {
        min_part_size: 512,
        max_parts_per_file: 4,
        retry_delay: Duration::from_millis(20),
        drain_take_timeout: Duration::from_millis(200),
    }
}

pub fn test_config(local_directory: &Path, max_batch_size: usize) -> JournalConfig {
    let mut config = JournalConfig::new("bucket", local_directory);
    config.id = "app".to_string();
    config.max_batch_size = Some(max_batch_size);
    config.max_batch_latency_ms = Some(50);
    config.fsync = false;
    config
}

/// A clock the test advances by hand.
#[derive(Clone)]
pub struct TestClock(Arc<Mutex<DateTime<Utc>>>);

impl TestClock {
    pub fn at(year: i32, month: u32, day: u32, hour: u32) -> Self {
        Self(Arc::new(Mutex::new(
            Utc.with_ymd_and_hms(year, month, day, hour, 0, 0).unwrap(),
        )))
    }

    pub fn set(&self, year: i32, month: u32, day: u32, hour: u32) {
        *self.0.lock().unwrap() = Utc.with_ymd_and_hms(year, month, day, hour, 0, 0).unwrap();
    }

    pub fn now(&self) -> DateTime<Utc> {
        *self.0.lock().unwrap()
    }

    pub fn as_fn(&self) -> impl Fn() -> DateTime<Utc> + Send + Sync + 'static {
        let clock = self.clone();
        move || clock.now()
    }
}

/// Entries `1..=n` the way producers submit them.
pub fn numbered_entries(from: u64, to: u64) -> Vec<String> {
    (from..=to).map(|n| n.to_string()).collect()
}

/// Concatenate every object under `prefix` in key order and split the byte
/// stream back into entries (identity compression, newline delimiter).
pub fn read_back(store: &MemoryStore, prefix: &str) -> Vec<String> {
    let mut bytes = Vec::new();
    for (_, object) in store.objects_with_prefix(prefix) {
        bytes.extend_from_slice(&object.bytes);
    }
    String::from_utf8(bytes)
        .unwrap()
        .split('\n')
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

fn injected(operation: &'static str) -> StorageError {
    StorageError::Request {
        operation,
        target: "injected".to_string(),
        message: "injected fault".to_string(),
    }
}

/// Wrapper that fails `init`/`upload_part`/`complete` with a fixed
/// probability, driven by a seeded rng so runs are reproducible.
pub struct FaultInjector<S> {
    inner: S,
    probability: f64,
    rng: Mutex<StdRng>,
}

impl<S> FaultInjector<S> {
    pub fn new(inner: S, probability: f64, seed: u64) -> Self {
        Self {
            inner,
            probability,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    fn roll(&self, operation: &'static str) -> Result<(), StorageError> {
        if self.rng.lock().unwrap().gen_bool(self.probability) {
            Err(injected(operation))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl<S: ObjectStorage> ObjectStorage for FaultInjector<S> {
    async fn init_multipart(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<MultipartDescriptor, StorageError> {
        self.roll("create_multipart_upload")?;
        self.inner.init_multipart(bucket, key).await
    }

    async fn upload_part(
        &self,
        descriptor: &MultipartDescriptor,
        part_number: i32,
        bytes: Bytes,
        last: bool,
    ) -> Result<UploadedPart, StorageError> {
        self.roll("upload_part")?;
        self.inner
            .upload_part(descriptor, part_number, bytes, last)
            .await
    }

    async fn complete_multipart(
        &self,
        descriptor: &MultipartDescriptor,
        parts: &[PartRef],
    ) -> Result<(), StorageError> {
        self.roll("complete_multipart_upload")?;
        self.inner.complete_multipart(descriptor, parts).await
    }

    async fn abort_multipart(&self, descriptor: &MultipartDescriptor) -> Result<(), StorageError> {
        self.inner.abort_multipart(descriptor).await
    }

    async fn list_complete(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, StorageError> {
        self.inner.list_complete(bucket, prefix).await
    }

    async fn list_multipart(
        &self,
        bucket: &str,
        prefix: &str,
    ) -> Result<Vec<PendingMultipart>, StorageError> {
        self.inner.list_multipart(bucket, prefix).await
    }

    async fn list_parts(
        &self,
        descriptor: &MultipartDescriptor,
    ) -> Result<Vec<UploadedPart>, StorageError> {
        self.inner.list_parts(descriptor).await
    }
}

/// Wrapper whose part uploads fail until the gate is opened; used to pin a
/// pipeline mid-flight before a simulated crash.
pub struct GateStore<S> {
    inner: S,
    open: AtomicBool,
}

impl<S> GateStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            open: AtomicBool::new(false),
        }
    }

    pub fn open_gate(&self) {
        self.open.store(true, Ordering::Release);
    }
}

#[async_trait]
impl<S: ObjectStorage> ObjectStorage for GateStore<S> {
    async fn init_multipart(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<MultipartDescriptor, StorageError> {
        self.inner.init_multipart(bucket, key).await
    }

    async fn upload_part(
        &self,
        descriptor: &MultipartDescriptor,
        part_number: i32,
        bytes: Bytes,
        last: bool,
    ) -> Result<UploadedPart, StorageError> {
        if !self.open.load(Ordering::Acquire) {
            return Err(injected("upload_part"));
        }
        self.inner
            .upload_part(descriptor, part_number, bytes, last)
            .await
    }

    async fn complete_multipart(
        &self,
        descriptor: &MultipartDescriptor,
        parts: &[PartRef],
    ) -> Result<(), StorageError> {
        if !self.open.load(Ordering::Acquire) {
            return Err(injected("complete_multipart_upload"));
        }
        self.inner.complete_multipart(descriptor, parts).await
    }

    async fn abort_multipart(&self, descriptor: &MultipartDescriptor) -> Result<(), StorageError> {
        self.inner.abort_multipart(descriptor).await
    }

    async fn list_complete(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, StorageError> {
        self.inner.list_complete(bucket, prefix).await
    }

    async fn list_multipart(
        &self,
        bucket: &str,
        prefix: &str,
    ) -> Result<Vec<PendingMultipart>, StorageError> {
        self.inner.list_multipart(bucket, prefix).await
    }

    async fn list_parts(
        &self,
        descriptor: &MultipartDescriptor,
    ) -> Result<Vec<UploadedPart>, StorageError> {
        self.inner.list_parts(descriptor).await
    }
}

/// Wrapper that fails the three upload operations during periodic outage
/// windows, simulating streaked service unavailability.
pub struct OutageStore<S> {
    inner: S,
    started: Instant,
    period: Duration,
    outage: Duration,
}

impl<S> OutageStore<S> {
    pub fn new(inner: S, period: Duration, outage: Duration) -> Self {
        Self {
            inner,
            started: Instant::now(),
            period,
            outage,
        }
    }

    fn check(&self, operation: &'static str) -> Result<(), StorageError> {
        let elapsed = self.started.elapsed().as_millis() as u64;
        let phase = elapsed % self.period.as_millis() as u64;
        if phase < self.outage.as_millis() as u64 {
            Err(injected(operation))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl<S: ObjectStorage> ObjectStorage for OutageStore<S> {
    async fn init_multipart(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<MultipartDescriptor, StorageError> {
        self.check("create_multipart_upload")?;
        self.inner.init_multipart(bucket, key).await
    }

    async fn upload_part(
        &self,
        descriptor: &MultipartDescriptor,
        part_number: i32,
        bytes: Bytes,
        last: bool,
    ) -> Result<UploadedPart, StorageError> {
        self.check("upload_part")?;
        self.inner
            .upload_part(descriptor, part_number, bytes, last)
            .await
    }

    async fn complete_multipart(
        &self,
        descriptor: &MultipartDescriptor,
        parts: &[PartRef],
    ) -> Result<(), StorageError> {
        self.check("complete_multipart_upload")?;
        self.inner.complete_multipart(descriptor, parts).await
    }

    async fn abort_multipart(&self, descriptor: &MultipartDescriptor) -> Result<(), StorageError> {
        self.inner.abort_multipart(descriptor).await
    }

    async fn list_complete(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, StorageError> {
        self.inner.list_complete(bucket, prefix).await
    }

    async fn list_multipart(
        &self,
        bucket: &str,
        prefix: &str,
    ) -> Result<Vec<PendingMultipart>, StorageError> {
        self.inner.list_multipart(bucket, prefix).await
    }

    async fn list_parts(
        &self,
        descriptor: &MultipartDescriptor,
    ) -> Result<Vec<UploadedPart>, StorageError> {
        self.inner.list_parts(descriptor).await
    }
}
