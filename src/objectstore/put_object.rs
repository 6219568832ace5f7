//! Single-object uploader
//!
//! Uploads one stream with a single presigned `PUT`. The store's ETag is
//! checked against the MD5 computed while writing (see
//! [`Uploader::close`](super::Uploader::close)); the object is deleted
//! through its presigned `DELETE` URL once the caller context ends.
//!
//! # Example
//!
//! ```no_run
//! use hayate::objectstore::{Lifetimes, Object, RemoteStrategy, Uploader};
//! use tokio::io::AsyncWriteExt;
//! use tokio_util::sync::CancellationToken;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let ctx = CancellationToken::new();
//! let deadline = tokio::time::Instant::now() + Duration::from_secs(60);
//! let object = Object::new(
//!     reqwest::Client::new(),
//!     "https://bucket.s3.amazonaws.com/tmp/upload?X-Amz-Signature=...",
//!     Some("https://bucket.s3.amazonaws.com/tmp/upload?X-Amz-Signature=..."),
//!     13,
//!     true,
//! )?;
//!
//! let mut uploader = Uploader::start(RemoteStrategy::Object(object), Lifetimes::new(&ctx, deadline), 65536);
//! uploader.write_all(b"Hello, World!").await?;
//! uploader.close().await?;
//!
//! // Later, once the backend is done with the object:
//! ctx.cancel();
//! # Ok(())
//! # }
//! ```

use super::uploader::CleanupOnce;
use super::{extract_etag, ObjectStoreError};
use crate::metrics;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, ETAG};
use reqwest::{Method, StatusCode, Url};
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio_util::io::ReaderStream;

/// Upper bound for a single delete/abort request
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(60);

/// Single presigned PUT destination
pub struct Object {
    client: reqwest::Client,
    put_url: Url,
    delete_url: Option<Url>,
    size: Option<u64>,
    stored: bool,
    cleanup: CleanupOnce,
}

impl Object {
    /// Create a single-object destination
    ///
    /// `size` is the expected byte count, negative when unknown. An unknown
    /// size streams with chunked encoding unless `length_required` is set, in
    /// which case this fails before any byte moves.
    pub fn new(
        client: reqwest::Client,
        put_url: &str,
        delete_url: Option<&str>,
        size: i64,
        length_required: bool,
    ) -> Result<Self, ObjectStoreError> {
        let put_url = parse_url(put_url)?;
        let delete_url = delete_url
            .filter(|url| !url.is_empty())
            .map(parse_url)
            .transpose()?;
        let size = u64::try_from(size).ok();

        if size.is_none() && length_required {
            return Err(ObjectStoreError::MissingContentLength);
        }

        Ok(Self {
            client,
            put_url,
            delete_url,
            size,
            stored: false,
            cleanup: CleanupOnce::default(),
        })
    }

    /// Stream `reader` to the presigned PUT URL and return the store's ETag
    #[tracing::instrument(
        name = "objectstore.put_object",
        skip(self, reader),
        fields(
            http.method = "PUT",
            upload.bytes = ?self.size,
            s3.etag = tracing::field::Empty
        ),
        err
    )]
    pub async fn upload<R>(&mut self, reader: R) -> Result<String, ObjectStoreError>
    where
        R: AsyncRead + Send + Sync + 'static,
    {
        let body = reqwest::Body::wrap_stream(ReaderStream::new(reader));
        let etag = put_body(&self.client, self.put_url.clone(), body, self.size, "put_object").await?;
        self.stored = true;

        tracing::Span::current().record("s3.etag", etag.as_str());
        Ok(etag)
    }

    /// Delete the stored object (best effort, at most once)
    pub async fn delete(&self) {
        if !self.cleanup.claim() {
            return;
        }
        if let Some(url) = &self.delete_url {
            send_cleanup(&self.client, Method::DELETE, url.clone(), "delete").await;
        }
    }

    /// Abort a failed upload
    ///
    /// A PUT that never succeeded left nothing behind, so there is nothing to
    /// remove. A PUT that succeeded but was rejected afterwards is deleted.
    pub async fn abort(&self) {
        if self.stored {
            self.delete().await;
        } else if self.cleanup.claim() {
            tracing::debug!("Single object upload failed, nothing to clean up");
        }
    }
}

/// Parse a presigned URL, rejecting anything that is not http(s)
pub(crate) fn parse_url(raw: &str) -> Result<Url, ObjectStoreError> {
    let url = Url::parse(raw).map_err(|e| ObjectStoreError::InvalidUrl(e.to_string()))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        scheme => Err(ObjectStoreError::InvalidUrl(format!(
            "unsupported scheme '{}'",
            scheme
        ))),
    }
}

/// PUT a body and return the raw `ETag` header of a 200 response
pub(crate) async fn put_body(
    client: &reqwest::Client,
    url: Url,
    body: reqwest::Body,
    length: Option<u64>,
    operation: &'static str,
) -> Result<String, ObjectStoreError> {
    let mut request = client
        .put(url)
        .header(CONTENT_TYPE, "application/octet-stream")
        .body(body);
    if let Some(length) = length {
        request = request.header(CONTENT_LENGTH, length);
    }

    let response = request
        .send()
        .await
        .map_err(|e| ObjectStoreError::Request(format!("{}: {}", operation, e)))?;

    let status = response.status();
    if status != StatusCode::OK {
        return Err(ObjectStoreError::Status {
            operation,
            status: status.as_u16(),
        });
    }

    response
        .headers()
        .get(ETAG)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !extract_etag(value).is_empty())
        .map(str::to_string)
        .ok_or(ObjectStoreError::MissingETag(operation))
}

/// Fire a delete/abort request; failures are logged, never returned
pub(crate) async fn send_cleanup(
    client: &reqwest::Client,
    method: Method,
    url: Url,
    action: &'static str,
) {
    let host = url.host_str().unwrap_or_default().to_string();

    match client
        .request(method, url)
        .timeout(CLEANUP_TIMEOUT)
        .send()
        .await
    {
        Ok(response) if response.status().is_success() => {
            metrics::record_cleanup(action, true);
            tracing::debug!(action = action, host = %host, "Object storage cleanup succeeded");
        }
        Ok(response) => {
            metrics::record_cleanup(action, false);
            tracing::warn!(
                action = action,
                host = %host,
                status = response.status().as_u16(),
                "Object storage cleanup returned unexpected status"
            );
        }
        Err(e) => {
            metrics::record_cleanup(action, false);
            tracing::error!(
                action = action,
                host = %host,
                error = %e,
                "Object storage cleanup request failed"
            );
        }
    }
}
