//! Object storage uploaders
//!
//! Streams one file to a remote store while the request body is still being
//! read. Every destination is driven through the same [`Uploader`] handle:
//! bytes go in through a bounded duplex channel, `close()` waits for the
//! network side to finish, and cleanup (delete or abort) runs once the
//! caller signals it no longer needs the object.
//!
//! # Destinations
//!
//! | Strategy | Transport | Cleanup |
//! |----------|-----------|---------|
//! | [`Object`] | single presigned `PUT` | presigned `DELETE` |
//! | [`Multipart`] | presigned part `PUT`s + `POST` complete | `DELETE` / abort |
//! | [`S3Object`] | AWS SDK with bucket credentials | `DeleteObject` / `AbortMultipartUpload` |

use crate::s3::S3ClientPool;
use std::time::Duration;
use thiserror::Error;

pub mod multipart;
pub mod put_object;
pub mod s3_object;
pub mod temp_file;
pub mod uploader;
pub mod xml;

pub use multipart::{build_multipart_upload_etag, CompletedPart, Multipart};
pub use put_object::Object;
pub use s3_object::S3Object;
pub use uploader::{Lifetimes, RemoteStrategy, Uploader};

/// Object storage errors
#[derive(Error, Debug)]
pub enum ObjectStoreError {
    #[error("Missing content length")]
    MissingContentLength,

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid multipart configuration: {0}")]
    InvalidMultipart(String),

    #[error("Request error: {0}")]
    Request(String),

    #[error("Unexpected status code {status} from {operation}")]
    Status { operation: &'static str, status: u16 },

    #[error("ETag mismatch: expected {expected}, got {actual}")]
    ETagMismatch { expected: String, actual: String },

    #[error("Missing ETag in {0} response")]
    MissingETag(&'static str),

    #[error("Invalid ETag: {0}")]
    InvalidETag(String),

    #[error("Not enough parts: stream exceeds {0} bytes")]
    NotEnoughParts(u64),

    #[error("Complete multipart upload failed: {code}: {message}")]
    CompleteFailed { code: String, message: String },

    #[error("XML error: {0}")]
    Xml(String),

    #[error("Upload deadline exceeded")]
    DeadlineExceeded,

    #[error("Upload cancelled")]
    Cancelled,

    #[error("S3 SDK error: {0}")]
    Sdk(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ObjectStoreError {
    /// Failure category used as a metrics label
    pub fn category(&self) -> &'static str {
        match self {
            Self::MissingContentLength | Self::InvalidUrl(_) | Self::InvalidMultipart(_) => {
                "configuration"
            }
            Self::Request(_) | Self::Status { .. } | Self::Sdk(_) | Self::Io(_) => "transport",
            Self::ETagMismatch { .. } | Self::MissingETag(_) | Self::InvalidETag(_) => "integrity",
            Self::CompleteFailed { .. } | Self::Xml(_) => "transport",
            Self::NotEnoughParts(_) => "not_enough_parts",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::Cancelled => "cancelled",
        }
    }
}

impl From<reqwest::Error> for ObjectStoreError {
    fn from(e: reqwest::Error) -> Self {
        ObjectStoreError::Request(e.to_string())
    }
}

/// Strip the surrounding double quotes S3 puts around ETag values
pub fn extract_etag(raw: &str) -> &str {
    raw.trim().trim_matches('"')
}

/// Process-wide clients shared by every upload
///
/// Built once at startup and injected into the save path; tests build their
/// own instance pointed at a stub store.
pub struct ObjectStoreClients {
    http: reqwest::Client,
    s3: S3ClientPool,
    pipe_capacity: usize,
}

impl ObjectStoreClients {
    /// Create the shared clients
    pub fn new(pipe_capacity: usize) -> Result<Self, ObjectStoreError> {
        let http = http_client_builder()
            .connect_timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self::with_http_client(http, pipe_capacity))
    }

    /// Wrap an existing HTTP client
    pub fn with_http_client(http: reqwest::Client, pipe_capacity: usize) -> Self {
        Self {
            http,
            s3: S3ClientPool::new(),
            pipe_capacity: pipe_capacity.max(1),
        }
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub fn s3(&self) -> &S3ClientPool {
        &self.s3
    }

    /// Capacity of the in-process duplex channel feeding each uploader
    pub fn pipe_capacity(&self) -> usize {
        self.pipe_capacity
    }
}

impl Default for ObjectStoreClients {
    fn default() -> Self {
        let http = http_client_builder().build().unwrap_or_default();
        Self::with_http_client(http, uploader::DEFAULT_PIPE_CAPACITY)
    }
}

/// A presigned URL answering with a redirect is a failed request
fn http_client_builder() -> reqwest::ClientBuilder {
    reqwest::Client::builder().redirect(reqwest::redirect::Policy::none())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_etag() {
        assert_eq!(extract_etag("\"abc123\""), "abc123");
        assert_eq!(extract_etag("abc123"), "abc123");
        assert_eq!(extract_etag(" \"abc-2\" "), "abc-2");
    }

    #[test]
    fn test_error_categories() {
        assert_eq!(
            ObjectStoreError::MissingContentLength.category(),
            "configuration"
        );
        assert_eq!(
            ObjectStoreError::Status {
                operation: "put",
                status: 404
            }
            .category(),
            "transport"
        );
        assert_eq!(ObjectStoreError::NotEnoughParts(8).category(), "not_enough_parts");
        assert_eq!(ObjectStoreError::DeadlineExceeded.category(), "deadline_exceeded");
    }

    #[test]
    fn test_pipe_capacity_never_zero() {
        let clients = ObjectStoreClients::with_http_client(reqwest::Client::new(), 0);
        assert_eq!(clients.pipe_capacity(), 1);
    }
}
