//! Presigned S3 multipart upload
//!
//! The incoming stream is cut into `part_size` slices. Each slice is parked
//! in a [`PartBuffer`] and sent to the next presigned part URL, strictly in
//! part-number order. Once the stream is exhausted the upload is completed
//! with a `CompleteMultipartUpload` request and the returned ETag is checked
//! against the composite ETag of the uploaded parts.
//!
//! # Example
//!
//! ```no_run
//! use hayate::objectstore::{Lifetimes, Multipart, RemoteStrategy, Uploader};
//! use tokio::io::AsyncWriteExt;
//! use tokio_util::sync::CancellationToken;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let ctx = CancellationToken::new();
//! let multipart = Multipart::new(
//!     reqwest::Client::new(),
//!     &["https://s3.example.com/bucket/key?partNumber=1&uploadId=abc".to_string()],
//!     "https://s3.example.com/bucket/key?uploadId=abc",
//!     Some("https://s3.example.com/bucket/key?uploadId=abc"),
//!     Some("https://s3.example.com/bucket/key"),
//!     5 * 1024 * 1024,
//! )?;
//!
//! let deadline = tokio::time::Instant::now() + Duration::from_secs(3600);
//! let mut uploader = Uploader::start(RemoteStrategy::Multipart(multipart), Lifetimes::new(&ctx, deadline), 65536);
//! uploader.write_all(b"some bytes").await?;
//! uploader.close().await?;
//! # Ok(())
//! # }
//! ```

use super::put_object::{parse_url, put_body, send_cleanup};
use super::temp_file::PartBuffer;
use super::uploader::CleanupOnce;
use super::xml;
use super::{extract_etag, ObjectStoreError};
use crate::metrics;
use md5::{Digest, Md5};
use reqwest::header::CONTENT_TYPE;
use reqwest::{Method, Url};
use tokio::io::AsyncRead;

pub use super::xml::CompletedPart;

/// Presigned multipart destination
pub struct Multipart {
    client: reqwest::Client,
    part_urls: Vec<Url>,
    complete_url: Url,
    abort_url: Option<Url>,
    delete_url: Option<Url>,
    part_size: u64,
    cleanup: CleanupOnce,
}

impl Multipart {
    /// Create a multipart destination
    ///
    /// Fails before any byte moves if a URL is malformed, no part URL was
    /// given, or `part_size` is not positive.
    pub fn new(
        client: reqwest::Client,
        part_urls: &[String],
        complete_url: &str,
        abort_url: Option<&str>,
        delete_url: Option<&str>,
        part_size: i64,
    ) -> Result<Self, ObjectStoreError> {
        let part_size = u64::try_from(part_size)
            .ok()
            .filter(|size| *size > 0)
            .ok_or_else(|| {
                ObjectStoreError::InvalidMultipart(format!("part size {} is not positive", part_size))
            })?;

        if part_urls.is_empty() {
            return Err(ObjectStoreError::InvalidMultipart(
                "no part URLs".to_string(),
            ));
        }

        let part_urls = part_urls
            .iter()
            .map(|url| parse_url(url))
            .collect::<Result<Vec<_>, _>>()?;
        let optional = |url: Option<&str>| url.filter(|u| !u.is_empty()).map(parse_url).transpose();

        Ok(Self {
            client,
            part_urls,
            complete_url: parse_url(complete_url)?,
            abort_url: optional(abort_url)?,
            delete_url: optional(delete_url)?,
            part_size,
            cleanup: CleanupOnce::default(),
        })
    }

    /// Largest stream this destination can take
    pub fn capacity(&self) -> u64 {
        self.part_size.saturating_mul(self.part_urls.len() as u64)
    }

    /// Upload every part, complete the upload and return the final ETag
    #[tracing::instrument(
        name = "objectstore.multipart",
        skip(self, reader),
        fields(
            multipart.part_size = self.part_size,
            multipart.part_urls = self.part_urls.len(),
            multipart.parts = tracing::field::Empty
        ),
        err
    )]
    pub async fn upload<R>(&mut self, reader: R) -> Result<String, ObjectStoreError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut reader = reader;
        let mut parts = Vec::with_capacity(self.part_urls.len());

        for (index, url) in self.part_urls.iter().enumerate() {
            let part_number = index as u32 + 1;
            let buffer = PartBuffer::fill(&mut reader, self.part_size).await?;

            // The first part always goes out so an empty stream still
            // completes; later empty reads mean the input ran out.
            if buffer.is_empty() && part_number > 1 {
                break;
            }

            let exhausted = buffer.size() < self.part_size;
            let etag = self.upload_part(part_number, url, buffer).await?;
            parts.push(CompletedPart { part_number, etag });

            if exhausted {
                break;
            }
        }

        let remaining = tokio::io::copy(&mut reader, &mut tokio::io::sink()).await?;
        if remaining > 0 {
            return Err(ObjectStoreError::NotEnoughParts(self.capacity()));
        }

        tracing::Span::current().record("multipart.parts", parts.len() as u64);
        metrics::record_multipart_parts(parts.len());

        self.complete(&parts).await
    }

    #[tracing::instrument(
        name = "objectstore.multipart.part",
        skip(self, url, buffer),
        fields(part.number = part_number, part.bytes = buffer.size()),
        err
    )]
    async fn upload_part(
        &self,
        part_number: u32,
        url: &Url,
        buffer: PartBuffer,
    ) -> Result<String, ObjectStoreError> {
        let expected = buffer.md5().to_string();
        let size = buffer.size();

        let etag = put_body(&self.client, url.clone(), buffer.into_body(), Some(size), "upload_part").await?;

        let actual = extract_etag(&etag);
        if actual != expected {
            return Err(ObjectStoreError::ETagMismatch {
                expected,
                actual: actual.to_string(),
            });
        }

        Ok(etag)
    }

    #[tracing::instrument(
        name = "objectstore.multipart.complete",
        skip(self, parts),
        fields(parts = parts.len(), s3.etag = tracing::field::Empty),
        err
    )]
    async fn complete(&self, parts: &[CompletedPart]) -> Result<String, ObjectStoreError> {
        let body = xml::complete_multipart_body(parts)?;

        let response = self
            .client
            .post(self.complete_url.clone())
            .header(CONTENT_TYPE, "application/xml")
            .body(body)
            .send()
            .await
            .map_err(|e| ObjectStoreError::Request(format!("complete_multipart: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ObjectStoreError::Status {
                operation: "complete_multipart",
                status: status.as_u16(),
            });
        }

        let text = response.text().await?;
        let etag = xml::parse_complete_response(&text)?;
        tracing::Span::current().record("s3.etag", etag.as_str());

        let expected = build_multipart_upload_etag(parts)?;
        let actual = extract_etag(&etag);
        if actual != expected {
            return Err(ObjectStoreError::ETagMismatch {
                expected,
                actual: actual.to_string(),
            });
        }

        Ok(etag)
    }

    /// Delete the completed object (best effort, at most once)
    pub async fn delete(&self) {
        if !self.cleanup.claim() {
            return;
        }
        if let Some(url) = &self.delete_url {
            send_cleanup(&self.client, Method::DELETE, url.clone(), "delete").await;
        }
    }

    /// Abort the multipart upload (best effort, at most once)
    pub async fn abort(&self) {
        if !self.cleanup.claim() {
            return;
        }
        match &self.abort_url {
            Some(url) => send_cleanup(&self.client, Method::DELETE, url.clone(), "abort").await,
            None => tracing::warn!("Multipart upload failed and no abort URL was provided"),
        }
    }
}

/// Compute the S3 composite ETag of an ordered list of parts
///
/// `hex(md5(decode(etag_1) || ... || decode(etag_n))) + "-" + n`
pub fn build_multipart_upload_etag(parts: &[CompletedPart]) -> Result<String, ObjectStoreError> {
    let mut hasher = Md5::new();

    for part in parts {
        let raw = extract_etag(&part.etag);
        let decoded = hex::decode(raw).map_err(|_| ObjectStoreError::InvalidETag(raw.to_string()))?;
        hasher.update(&decoded);
    }

    Ok(format!("{}-{}", hex::encode(hasher.finalize()), parts.len()))
}
