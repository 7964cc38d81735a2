//! S3 storage backend implementation.

use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::{Credentials, SharedCredentialsProvider};
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use bytes::Bytes;
use snafu::prelude::*;

use crate::config::JournalConfig;
use crate::error::{MissingEtagSnafu, MissingUploadIdSnafu, StorageError};

use super::{MultipartDescriptor, ObjectStorage, PartRef, PendingMultipart, UploadedPart};

/// `ObjectStorage` backed by the AWS SDK, speaking to S3 or any
/// S3-compatible endpoint (path-style addressing is forced when a custom
/// endpoint is configured).
#[derive(Debug, Clone)]
pub struct S3Store {
    client: Client,
}

impl S3Store {
    /// Wrap an existing SDK client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Build a client from journal configuration. Credentials fall back to
    /// the SDK environment chain when no static keys are configured.
    pub async fn from_config(config: &JournalConfig) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());

        if let Some(region) = &config.region {
            loader = loader.region(aws_config::Region::new(region.clone()));
        }
        if let (Some(access_key), Some(secret_key)) = (&config.access_key, &config.secret_key) {
            let credentials =
                Credentials::new(access_key.clone(), secret_key.clone(), None, None, "static");
            loader = loader.credentials_provider(SharedCredentialsProvider::new(credentials));
        }

        let sdk_config = loader.load().await;
        let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config);
        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }

        Self {
            client: Client::from_conf(builder.build()),
        }
    }
}

/// Map an SDK error onto the storage taxonomy. 404-family service codes
/// become `NotFound`; everything else is a retryable request failure.
fn from_sdk<E, R>(
    operation: &'static str,
    target: impl Into<String>,
    err: SdkError<E, R>,
) -> StorageError
where
    E: ProvideErrorMetadata + std::fmt::Debug,
    R: std::fmt::Debug,
{
    let target = target.into();
    let code = err.as_service_error().and_then(|e| e.code());
    if matches!(code, Some("NoSuchUpload" | "NoSuchKey" | "NotFound")) {
        return StorageError::NotFound { operation, target };
    }

    let message = match err.as_service_error() {
        Some(service) => format!(
            "{}: {}",
            service.code().unwrap_or("unknown"),
            service.message().unwrap_or("no message")
        ),
        None => format!("{err:?}"),
    };
    StorageError::Request {
        operation,
        target,
        message,
    }
}

#[async_trait]
impl ObjectStorage for S3Store {
    async fn init_multipart(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<MultipartDescriptor, StorageError> {
        let target = format!("{bucket}/{key}");
        let output = self
            .client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| from_sdk("create_multipart_upload", target.clone(), e))?;

        let upload_id = output
            .upload_id()
            .map(str::to_owned)
            .context(MissingUploadIdSnafu { target })?;

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
        let target = descriptor.target();
        let size = bytes.len() as u64;

        let output = self
            .client
            .upload_part()
            .bucket(&descriptor.bucket)
            .key(&descriptor.key)
            .upload_id(&descriptor.upload_id)
            .part_number(part_number)
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(|e| from_sdk("upload_part", target.clone(), e))?;

        let etag = output
            .e_tag()
            .map(str::to_owned)
            .context(MissingEtagSnafu { target })?;

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

        let completed: Vec<CompletedPart> = parts
            .iter()
            .map(|part| {
                CompletedPart::builder()
                    .part_number(part.part_number)
                    .e_tag(&part.etag)
                    .build()
            })
            .collect();
        let upload = CompletedMultipartUpload::builder()
            .set_parts(Some(completed))
            .build();

        let result = self
            .client
            .complete_multipart_upload()
            .bucket(&descriptor.bucket)
            .key(&descriptor.key)
            .upload_id(&descriptor.upload_id)
            .multipart_upload(upload)
            .send()
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) => {
                let err = from_sdk("complete_multipart_upload", descriptor.target(), e);
                // 404 means another completion already won
                if err.is_not_found() { Ok(()) } else { Err(err) }
            }
        }
    }

    async fn abort_multipart(&self, descriptor: &MultipartDescriptor) -> Result<(), StorageError> {
        let result = self
            .client
            .abort_multipart_upload()
            .bucket(&descriptor.bucket)
            .key(&descriptor.key)
            .upload_id(&descriptor.upload_id)
            .send()
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) => {
                let err = from_sdk("abort_multipart_upload", descriptor.target(), e);
                if err.is_not_found() { Ok(()) } else { Err(err) }
            }
        }
    }

    async fn list_complete(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, StorageError> {
        let target = format!("{bucket}/{prefix}");
        let mut keys = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut req = self.client.list_objects_v2().bucket(bucket).prefix(prefix);
            if let Some(token) = &continuation_token {
                req = req.continuation_token(token);
            }

            let resp = req
                .send()
                .await
                .map_err(|e| from_sdk("list_objects_v2", target.clone(), e))?;

            for object in resp.contents() {
                if let Some(key) = object.key() {
                    keys.push(key.to_string());
                }
            }

            if resp.is_truncated().unwrap_or(false) {
                continuation_token = resp.next_continuation_token().map(str::to_owned);
            } else {
                break;
            }
        }

        Ok(keys)
    }

    async fn list_multipart(
        &self,
        bucket: &str,
        prefix: &str,
    ) -> Result<Vec<PendingMultipart>, StorageError> {
        let target = format!("{bucket}/{prefix}");
        let mut uploads = Vec::new();
        let mut key_marker: Option<String> = None;
        let mut upload_id_marker: Option<String> = None;

        loop {
            let mut req = self
                .client
                .list_multipart_uploads()
                .bucket(bucket)
                .prefix(prefix);
            if let Some(marker) = &key_marker {
                req = req.key_marker(marker);
            }
            if let Some(marker) = &upload_id_marker {
                req = req.upload_id_marker(marker);
            }

            let resp = req
                .send()
                .await
                .map_err(|e| from_sdk("list_multipart_uploads", target.clone(), e))?;

            for upload in resp.uploads() {
                if let (Some(key), Some(upload_id)) = (upload.key(), upload.upload_id()) {
                    uploads.push(PendingMultipart {
                        key: key.to_string(),
                        upload_id: upload_id.to_string(),
                    });
                }
            }

            if resp.is_truncated().unwrap_or(false) {
                key_marker = resp.next_key_marker().map(str::to_owned);
                upload_id_marker = resp.next_upload_id_marker().map(str::to_owned);
            } else {
                break;
            }
        }

        Ok(uploads)
    }

    async fn list_parts(
        &self,
        descriptor: &MultipartDescriptor,
    ) -> Result<Vec<UploadedPart>, StorageError> {
        let target = descriptor.target();
        let mut parts = Vec::new();
        let mut marker: Option<String> = None;

        loop {
            let mut req = self
                .client
                .list_parts()
                .bucket(&descriptor.bucket)
                .key(&descriptor.key)
                .upload_id(&descriptor.upload_id);
            if let Some(marker) = &marker {
                req = req.part_number_marker(marker);
            }

            let resp = req
                .send()
                .await
                .map_err(|e| from_sdk("list_parts", target.clone(), e))?;

            for part in resp.parts() {
                if let (Some(part_number), Some(etag)) = (part.part_number(), part.e_tag()) {
                    parts.push(UploadedPart {
                        part_number,
                        etag: etag.to_string(),
                        size: part.size().unwrap_or(0) as u64,
                        last: false,
                    });
                }
            }

            if resp.is_truncated().unwrap_or(false) {
                marker = resp.next_part_number_marker().map(str::to_owned);
            } else {
                break;
            }
        }

        Ok(parts)
    }
}
