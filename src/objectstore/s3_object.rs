//! SDK-backed uploader
//!
//! Uploads with bucket credentials through `aws-sdk-s3` instead of presigned
//! URLs. A stream that fits in one part goes out as a single `PutObject`;
//! anything larger becomes a managed multipart upload. Cleanup uses
//! `DeleteObject` / `AbortMultipartUpload` keyed by bucket and object name.

use super::temp_file::PartBuffer;
use super::uploader::CleanupOnce;
use super::ObjectStoreError;
use crate::metrics;
use crate::s3::S3Client;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart, ServerSideEncryption};
use std::sync::Arc;
use tokio::io::AsyncRead;

/// Smallest part S3 accepts (except for the last one)
pub const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

/// Largest part count of an S3 multipart upload
pub const MAX_PARTS: u32 = 10_000;

/// Server-side encryption settings from the authorization response
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Encryption {
    /// `AES256` or `aws:kms`
    pub server_side_encryption: Option<String>,
    pub kms_key_id: Option<String>,
}

impl Encryption {
    fn algorithm(&self) -> Option<ServerSideEncryption> {
        self.server_side_encryption
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(ServerSideEncryption::from)
    }

    fn kms_key_id(&self) -> Option<String> {
        // A KMS key only applies to aws:kms encryption
        self.algorithm()
            .filter(|sse| *sse == ServerSideEncryption::AwsKms)
            .and(self.kms_key_id.clone())
            .filter(|k| !k.is_empty())
    }
}

/// SDK upload destination
pub struct S3Object {
    client: Arc<S3Client>,
    key: String,
    part_size: u64,
    encryption: Encryption,
    upload_id: Option<String>,
    stored: bool,
    cleanup: CleanupOnce,
}

impl S3Object {
    /// Create an SDK destination for `key` in the client's bucket
    pub fn new(
        client: Arc<S3Client>,
        key: impl Into<String>,
        encryption: Encryption,
    ) -> Result<Self, ObjectStoreError> {
        let key = key.into();
        if key.is_empty() {
            return Err(ObjectStoreError::InvalidUrl(format!(
                "empty object name for bucket '{}'",
                client.bucket()
            )));
        }

        Ok(Self {
            client,
            key,
            part_size: MIN_PART_SIZE,
            encryption,
            upload_id: None,
            stored: false,
            cleanup: CleanupOnce::default(),
        })
    }

    /// Use a larger part size (values below the S3 minimum are raised)
    pub fn with_part_size(mut self, part_size: u64) -> Self {
        self.part_size = part_size.max(MIN_PART_SIZE);
        self
    }

    /// Upload the stream, choosing single or multipart by its length
    #[tracing::instrument(
        name = "objectstore.s3",
        skip(self, reader),
        fields(s3.bucket = %self.client.bucket(), s3.key = %self.key, s3.upload_id = tracing::field::Empty),
        err
    )]
    pub async fn upload<R>(&mut self, reader: R) -> Result<(), ObjectStoreError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut reader = reader;
        let first = PartBuffer::fill(&mut reader, self.part_size).await?;

        if first.size() < self.part_size {
            self.put_object(first).await?;
            self.stored = true;
            return Ok(());
        }

        let upload_id = self.create_multipart_upload().await?;
        tracing::Span::current().record("s3.upload_id", upload_id.as_str());
        self.upload_id = Some(upload_id.clone());

        let mut parts = Vec::new();
        let mut buffer = first;
        let mut part_number: u32 = 1;

        loop {
            let exhausted = buffer.size() < self.part_size;
            let etag = self.upload_part(&upload_id, part_number, buffer).await?;
            parts.push(
                CompletedPart::builder()
                    .part_number(part_number as i32)
                    .e_tag(etag)
                    .build(),
            );

            if exhausted {
                break;
            }

            buffer = PartBuffer::fill(&mut reader, self.part_size).await?;
            if buffer.is_empty() {
                break;
            }

            part_number += 1;
            if part_number > MAX_PARTS {
                return Err(ObjectStoreError::NotEnoughParts(
                    self.part_size * u64::from(MAX_PARTS),
                ));
            }
        }

        metrics::record_multipart_parts(parts.len());
        self.complete_multipart_upload(&upload_id, parts).await?;
        self.stored = true;
        Ok(())
    }

    async fn put_object(&self, buffer: PartBuffer) -> Result<(), ObjectStoreError> {
        let size = buffer.size();
        let body = byte_stream(buffer).await?;

        self.client
            .sdk()
            .put_object()
            .bucket(self.client.bucket())
            .key(&self.key)
            .content_length(size as i64)
            .body(body)
            .set_server_side_encryption(self.encryption.algorithm())
            .set_ssekms_key_id(self.encryption.kms_key_id())
            .send()
            .await
            .map_err(|e| sdk_error("PutObject", e))?;

        tracing::debug!(bytes = size, "PutObject completed");
        Ok(())
    }

    async fn create_multipart_upload(&self) -> Result<String, ObjectStoreError> {
        let output = self
            .client
            .sdk()
            .create_multipart_upload()
            .bucket(self.client.bucket())
            .key(&self.key)
            .set_server_side_encryption(self.encryption.algorithm())
            .set_ssekms_key_id(self.encryption.kms_key_id())
            .send()
            .await
            .map_err(|e| sdk_error("CreateMultipartUpload", e))?;

        output
            .upload_id()
            .map(str::to_string)
            .ok_or_else(|| ObjectStoreError::Sdk("CreateMultipartUpload returned no upload id".into()))
    }

    #[tracing::instrument(
        name = "objectstore.s3.upload_part",
        skip(self, upload_id, buffer),
        fields(s3.part_number = part_number, upload.bytes = buffer.size()),
        err
    )]
    async fn upload_part(
        &self,
        upload_id: &str,
        part_number: u32,
        buffer: PartBuffer,
    ) -> Result<String, ObjectStoreError> {
        let size = buffer.size();
        let body = byte_stream(buffer).await?;

        let output = self
            .client
            .sdk()
            .upload_part()
            .bucket(self.client.bucket())
            .key(&self.key)
            .upload_id(upload_id)
            .part_number(part_number as i32)
            .content_length(size as i64)
            .body(body)
            .send()
            .await
            .map_err(|e| sdk_error("UploadPart", e))?;

        output
            .e_tag()
            .map(str::to_string)
            .ok_or(ObjectStoreError::MissingETag("upload_part"))
    }

    async fn complete_multipart_upload(
        &self,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> Result<(), ObjectStoreError> {
        let count = parts.len();

        self.client
            .sdk()
            .complete_multipart_upload()
            .bucket(self.client.bucket())
            .key(&self.key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| sdk_error("CompleteMultipartUpload", e))?;

        tracing::debug!(parts = count, "CompleteMultipartUpload completed");
        Ok(())
    }

    /// Delete the stored object (best effort, at most once)
    pub async fn delete(&self) {
        if !self.cleanup.claim() {
            return;
        }
        self.delete_object().await;
    }

    /// Abort an unfinished multipart upload, or delete an object that was
    /// stored but rejected afterwards (best effort, at most once)
    pub async fn abort(&self) {
        if !self.cleanup.claim() {
            return;
        }

        if self.stored {
            self.delete_object().await;
            return;
        }

        let Some(upload_id) = self.upload_id.as_deref() else {
            tracing::debug!(key = %self.key, "SDK upload failed before storing anything");
            return;
        };

        let result = self
            .client
            .sdk()
            .abort_multipart_upload()
            .bucket(self.client.bucket())
            .key(&self.key)
            .upload_id(upload_id)
            .send()
            .await;

        match result {
            Ok(_) => metrics::record_cleanup("abort", true),
            Err(e) => {
                metrics::record_cleanup("abort", false);
                tracing::error!(
                    bucket = %self.client.bucket(),
                    key = %self.key,
                    error = %DisplayErrorContext(&e),
                    "AbortMultipartUpload failed"
                );
            }
        }
    }

    async fn delete_object(&self) {
        let result = self
            .client
            .sdk()
            .delete_object()
            .bucket(self.client.bucket())
            .key(&self.key)
            .send()
            .await;

        match result {
            Ok(_) => metrics::record_cleanup("delete", true),
            Err(e) => {
                metrics::record_cleanup("delete", false);
                tracing::error!(
                    bucket = %self.client.bucket(),
                    key = %self.key,
                    error = %DisplayErrorContext(&e),
                    "DeleteObject failed"
                );
            }
        }
    }
}

async fn byte_stream(buffer: PartBuffer) -> Result<ByteStream, ObjectStoreError> {
    ByteStream::read_from()
        .file(buffer.into_file())
        .build()
        .await
        .map_err(|e| ObjectStoreError::Sdk(e.to_string()))
}

fn sdk_error<E: std::error::Error>(operation: &str, error: E) -> ObjectStoreError {
    ObjectStoreError::Sdk(format!("{}: {}", operation, DisplayErrorContext(error)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::s3::S3ClientConfig;

    async fn client() -> Arc<S3Client> {
        let config = S3ClientConfig {
            bucket: "bucket".into(),
            region: "us-east-1".into(),
            endpoint: Some("http://127.0.0.1:1".into()),
            access_key: Some("AKID".into()),
            secret_key: Some("SECRET".into()),
            path_style: true,
            use_iam_profile: false,
        };
        Arc::new(S3Client::new(config).await.unwrap())
    }

    #[test]
    fn test_encryption_kms_key_only_with_kms() {
        let aes = Encryption {
            server_side_encryption: Some("AES256".into()),
            kms_key_id: Some("key".into()),
        };
        assert_eq!(aes.algorithm(), Some(ServerSideEncryption::Aes256));
        assert_eq!(aes.kms_key_id(), None);

        let kms = Encryption {
            server_side_encryption: Some("aws:kms".into()),
            kms_key_id: Some("key".into()),
        };
        assert_eq!(kms.kms_key_id(), Some("key".to_string()));

        assert_eq!(Encryption::default().algorithm(), None);
    }

    #[tokio::test]
    async fn test_empty_key_rejected() {
        let result = S3Object::new(client().await, "", Encryption::default());
        assert!(matches!(result, Err(ObjectStoreError::InvalidUrl(_))));
    }

    #[tokio::test]
    async fn test_part_size_floor() {
        let object = S3Object::new(client().await, "tmp/key", Encryption::default())
            .unwrap()
            .with_part_size(1024);
        assert_eq!(object.part_size, MIN_PART_SIZE);
    }

    #[tokio::test]
    async fn test_abort_before_upload_is_noop() {
        let object = S3Object::new(client().await, "tmp/key", Encryption::default()).unwrap();
        // Nothing stored and no upload id: returns without touching the network.
        object.abort().await;
        assert!(!object.cleanup.claim());
    }
}
