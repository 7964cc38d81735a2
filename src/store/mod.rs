//! Object-store capability layer.
//!
//! The journal drives multipart uploads through the [`ObjectStorage`]
//! trait, which hides SDK specifics and surfaces typed errors. [`S3Store`]
//! talks to S3-compatible services; [`MemoryStore`] backs tests and local
//! development.

mod memory;
mod s3;

pub use memory::MemoryStore;
pub use s3::S3Store;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::StorageError;

/// Identity of an in-progress multipart upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultipartDescriptor {
    pub bucket: String,
    pub key: String,
    pub upload_id: String,
}

impl MultipartDescriptor {
    /// `bucket/key` form used in log messages and error targets.
    pub fn target(&self) -> String {
        format!("{}/{}", self.bucket, self.key)
    }
}

/// A part the store has accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedPart {
    pub part_number: i32,
    pub etag: String,
    pub size: u64,
    pub last: bool,
}

/// An uncompleted multipart upload surfaced by listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMultipart {
    pub key: String,
    pub upload_id: String,
}

/// `(part_number, etag)` pair referenced by a multipart completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartRef {
    pub part_number: i32,
    pub etag: String,
}

/// Capability surface over the object store.
///
/// Contracts shared by every implementation:
/// - `upload_part` against a vanished upload yields an error whose
///   `is_not_found()` is true, never a panic;
/// - `complete_multipart` with an empty part list aborts the upload
///   instead, and a 404 on complete/abort counts as success (the upload was
///   already finalized);
/// - parts passed to `complete_multipart` are in ascending part-number
///   order.
#[async_trait]
pub trait ObjectStorage: Send + Sync + 'static {
    /// Create a fresh multipart upload for `bucket`/`key`.
    async fn init_multipart(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<MultipartDescriptor, StorageError>;

    /// Upload one part. Non-terminal parts must exceed the store's minimum
    /// part size; `last` marks the final part of the object.
    async fn upload_part(
        &self,
        descriptor: &MultipartDescriptor,
        part_number: i32,
        bytes: Bytes,
        last: bool,
    ) -> Result<UploadedPart, StorageError>;

    /// Finalize the upload from the given parts (or abort when empty).
    async fn complete_multipart(
        &self,
        descriptor: &MultipartDescriptor,
        parts: &[PartRef],
    ) -> Result<(), StorageError>;

    /// Abandon the upload, discarding stored parts.
    async fn abort_multipart(&self, descriptor: &MultipartDescriptor) -> Result<(), StorageError>;

    /// Keys of completed objects under `prefix`.
    async fn list_complete(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, StorageError>;

    /// Uncompleted multipart uploads under `prefix`.
    async fn list_multipart(
        &self,
        bucket: &str,
        prefix: &str,
    ) -> Result<Vec<PendingMultipart>, StorageError>;

    /// Parts already stored for an in-progress upload.
    async fn list_parts(
        &self,
        descriptor: &MultipartDescriptor,
    ) -> Result<Vec<UploadedPart>, StorageError>;
}

#[async_trait]
impl<S: ObjectStorage + ?Sized> ObjectStorage for std::sync::Arc<S> {
    async fn init_multipart(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<MultipartDescriptor, StorageError> {
        (**self).init_multipart(bucket, key).await
    }

    async fn upload_part(
        &self,
        descriptor: &MultipartDescriptor,
        part_number: i32,
        bytes: Bytes,
        last: bool,
    ) -> Result<UploadedPart, StorageError> {
        (**self).upload_part(descriptor, part_number, bytes, last).await
    }

    async fn complete_multipart(
        &self,
        descriptor: &MultipartDescriptor,
        parts: &[PartRef],
    ) -> Result<(), StorageError> {
        (**self).complete_multipart(descriptor, parts).await
    }

    async fn abort_multipart(&self, descriptor: &MultipartDescriptor) -> Result<(), StorageError> {
        (**self).abort_multipart(descriptor).await
    }

    async fn list_complete(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, StorageError> {
        (**self).list_complete(bucket, prefix).await
    }

    async fn list_multipart(
        &self,
        bucket: &str,
        prefix: &str,
    ) -> Result<Vec<PendingMultipart>, StorageError> {
        (**self).list_multipart(bucket, prefix).await
    }

    async fn list_parts(
        &self,
        descriptor: &MultipartDescriptor,
    ) -> Result<Vec<UploadedPart>, StorageError> {
        (**self).list_parts(descriptor).await
    }
}
