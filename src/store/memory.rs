//! In-memory object store.
//!
//! Implements the full `ObjectStorage` contract, including the
//! empty-complete-aborts and 404-as-success behaviors, so tests and local
//! development exercise the same code paths as a real store.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use crate::error::StorageError;

use super::{MultipartDescriptor, ObjectStorage, PartRef, PendingMultipart, UploadedPart};

#[derive(Debug, Clone)]
struct StoredPart {
    etag: String,
    bytes: Bytes,
}

#[derive(Debug)]
struct PendingUpload {
    bucket: String,
    key: String,
    parts: BTreeMap<i32, StoredPart>,
}

/// A finalized object together with the parts that composed it.
#[derive(Debug, Clone)]
pub struct CompletedObject {
    pub bytes: Vec<u8>,
    /// `(part_number, size)` in completion order.
    pub parts: Vec<(i32, u64)>,
}

#[derive(Debug, Default)]
struct MemoryState {
    uploads: HashMap<String, PendingUpload>,
    objects: BTreeMap<String, CompletedObject>,
    counter: u64,
}

/// In-memory `ObjectStorage` implementation.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes of a finalized object.
    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        let state = self.state.lock().expect("memory store poisoned");
        state.objects.get(key).map(|object| object.bytes.clone())
    }

    /// Finalized objects under `prefix`, ordered by key.
    pub fn objects_with_prefix(&self, prefix: &str) -> Vec<(String, CompletedObject)> {
        let state = self.state.lock().expect("memory store poisoned");
        state
            .objects
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, object)| (key.clone(), object.clone()))
            .collect()
    }

    /// `(part_number, size)` pairs of a finalized object.
    pub fn completed_parts(&self, key: &str) -> Option<Vec<(i32, u64)>> {
        let state = self.state.lock().expect("memory store poisoned");
        state.objects.get(key).map(|object| object.parts.clone())
    }

    /// Number of uploads that were never finalized or aborted.
    pub fn pending_upload_count(&self) -> usize {
        let state = self.state.lock().expect("memory store poisoned");
        state.uploads.len()
    }
}

#[async_trait]
impl ObjectStorage for MemoryStore {
    async fn init_multipart(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<MultipartDescriptor, StorageError> {
        let mut state = self.state.lock().expect("memory store poisoned");
        state.counter += 1;
        let upload_id = format!("upload-{:06}", state.counter);
        state.uploads.insert(
            upload_id.clone(),
            PendingUpload {
                bucket: bucket.to_string(),
                key: key.to_string(),
                parts: BTreeMap::new(),
            },
        );
        Ok(MultipartDescriptor {
            bucket: bucket.to_string(),
            key: key.to_string(),
            upload_id,
        })
    }

    async fn upload_part(
        &self,
        descriptor: &MultipartDescriptor,
        part_number: i32,
        bytes: Bytes,
        last: bool,
    ) -> Result<UploadedPart, StorageError> {
        let mut state = self.state.lock().expect("memory store poisoned");
        state.counter += 1;
        let etag = format!("etag-{:06}", state.counter);

        let upload = state.uploads.get_mut(&descriptor.upload_id).ok_or(
            StorageError::NotFound {
                operation: "upload_part",
                target: descriptor.target(),
            },
        )?;

        let size = bytes.len() as u64;
        // duplicate part numbers overwrite, as the real store does
        upload.parts.insert(
            part_number,
            StoredPart {
                etag: etag.clone(),
                bytes,
            },
        );

        Ok(UploadedPart {
            part_number,
            etag,
            size,
            last,
        })
    }

    async fn complete_multipart(
        &self,
        descriptor: &MultipartDescriptor,
        parts: &[PartRef],
    ) -> Result<(), StorageError> {
        if parts.is_empty() {
            return self.abort_multipart(descriptor).await;
        }

        let mut state = self.state.lock().expect("memory store poisoned");
        let Some(upload) = state.uploads.remove(&descriptor.upload_id) else {
            // already finalized
            return Ok(());
        };

        let mut bytes = Vec::new();
        let mut completed = Vec::with_capacity(parts.len());
        for part_ref in parts {
            let stored =
                upload
                    .parts
                    .get(&part_ref.part_number)
                    .ok_or(StorageError::Request {
                        operation: "complete_multipart_upload",
                        target: descriptor.target(),
                        message: format!("part {} was never uploaded", part_ref.part_number),
                    })?;
            if stored.etag != part_ref.etag {
                return Err(StorageError::Request {
                    operation: "complete_multipart_upload",
                    target: descriptor.target(),
                    message: format!("etag mismatch on part {}", part_ref.part_number),
                });
            }
            bytes.extend_from_slice(&stored.bytes);
            completed.push((part_ref.part_number, stored.bytes.len() as u64));
        }

        state.objects.insert(
            upload.key.clone(),
            CompletedObject {
                bytes,
                parts: completed,
            },
        );
        Ok(())
    }

    async fn abort_multipart(&self, descriptor: &MultipartDescriptor) -> Result<(), StorageError> {
        let mut state = self.state.lock().expect("memory store poisoned");
        state.uploads.remove(&descriptor.upload_id);
        Ok(())
    }

    async fn list_complete(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, StorageError> {
        let _ = bucket;
        let state = self.state.lock().expect("memory store poisoned");
        Ok(state
            .objects
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn list_multipart(
        &self,
        bucket: &str,
        prefix: &str,
    ) -> Result<Vec<PendingMultipart>, StorageError> {
        let _ = bucket;
        let state = self.state.lock().expect("memory store poisoned");
        let mut uploads: Vec<PendingMultipart> = state
            .uploads
            .iter()
            .filter(|(_, upload)| upload.key.starts_with(prefix))
            .map(|(upload_id, upload)| PendingMultipart {
                key: upload.key.clone(),
                upload_id: upload_id.clone(),
            })
            .collect();
        uploads.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(uploads)
    }

    async fn list_parts(
        &self,
        descriptor: &MultipartDescriptor,
    ) -> Result<Vec<UploadedPart>, StorageError> {
        let state = self.state.lock().expect("memory store poisoned");
        let upload = state
            .uploads
            .get(&descriptor.upload_id)
            .ok_or(StorageError::NotFound {
                operation: "list_parts",
                target: descriptor.target(),
            })?;

        Ok(upload
            .parts
            .iter()
            .map(|(&part_number, stored)| UploadedPart {
                part_number,
                etag: stored.etag.clone(),
                size: stored.bytes.len() as u64,
                last: false,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn multipart_lifecycle() {
        let store = MemoryStore::new();
        let descriptor = store.init_multipart("bucket", "dir/a-000000.journal").await.unwrap();

        let first = store
            .upload_part(&descriptor, 1, Bytes::from_static(b"hello "), false)
            .await
            .unwrap();
        let second = store
            .upload_part(&descriptor, 2, Bytes::from_static(b"world"), true)
            .await
            .unwrap();

        let parts = vec![
            PartRef {
                part_number: 1,
                etag: first.etag,
            },
            PartRef {
                part_number: 2,
                etag: second.etag,
            },
        ];
        store.complete_multipart(&descriptor, &parts).await.unwrap();

        assert_eq!(store.object("dir/a-000000.journal").unwrap(), b"hello world");
        assert_eq!(store.pending_upload_count(), 0);
        assert_eq!(
            store.completed_parts("dir/a-000000.journal").unwrap(),
            vec![(1, 6), (2, 5)]
        );
    }

    #[tokio::test]
    async fn upload_part_after_finalize_is_not_found() {
        let store = MemoryStore::new();
        let descriptor = store.init_multipart("bucket", "k").await.unwrap();
        store.abort_multipart(&descriptor).await.unwrap();

        let err = store
            .upload_part(&descriptor, 1, Bytes::from_static(b"x"), true)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn complete_with_empty_parts_aborts() {
        let store = MemoryStore::new();
        let descriptor = store.init_multipart("bucket", "k").await.unwrap();
        store.complete_multipart(&descriptor, &[]).await.unwrap();

        assert_eq!(store.pending_upload_count(), 0);
        assert!(store.object("k").is_none());
    }

    #[tokio::test]
    async fn duplicate_complete_is_success() {
        let store = MemoryStore::new();
        let descriptor = store.init_multipart("bucket", "k").await.unwrap();
        let part = store
            .upload_part(&descriptor, 1, Bytes::from_static(b"x"), true)
            .await
            .unwrap();
        let parts = vec![PartRef {
            part_number: 1,
            etag: part.etag,
        }];

        store.complete_multipart(&descriptor, &parts).await.unwrap();
        store.complete_multipart(&descriptor, &parts).await.unwrap();
        assert_eq!(store.object("k").unwrap(), b"x");
    }

    #[tokio::test]
    async fn listings_filter_by_prefix() {
        let store = MemoryStore::new();
        let finished = store.init_multipart("bucket", "a/one").await.unwrap();
        let part = store
            .upload_part(&finished, 1, Bytes::from_static(b"1"), true)
            .await
            .unwrap();
        store
            .complete_multipart(
                &finished,
                &[PartRef {
                    part_number: 1,
                    etag: part.etag,
                }],
            )
            .await
            .unwrap();

        store.init_multipart("bucket", "a/two").await.unwrap();
        store.init_multipart("bucket", "b/three").await.unwrap();

        assert_eq!(
            store.list_complete("bucket", "a/").await.unwrap(),
            vec!["a/one".to_string()]
        );
        let pending = store.list_multipart("bucket", "a/").await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].key, "a/two");
    }
}
