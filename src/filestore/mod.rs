//! File save engine
//!
//! Copies one incoming byte stream to every configured destination (a local
//! temp file and/or one remote uploader) in a single pass, hashing as it
//! goes, and describes the result as a [`FileHandler`].

pub mod file_handler;
pub mod multi_hash;
pub mod save_options;

pub use file_handler::{save_file_from_reader, FileHandler};
pub use multi_hash::MultiHash;
pub use save_options::{RemoteMode, SaveOptions, SdkOptions};

use crate::objectstore::ObjectStoreError;
use crate::s3::S3ClientError;
use thiserror::Error;

/// File save errors
#[derive(Error, Debug)]
pub enum FileStoreError {
    #[error("Missing destination: neither a local path nor a remote object was configured")]
    MissingDestination,

    #[error("Size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: i64, actual: u64 },

    #[error("Entity is too large: limit is {limit} bytes")]
    EntityTooLarge { limit: u64 },

    #[error("Object storage error: {0}")]
    ObjectStore(#[from] ObjectStoreError),

    #[error("S3 client error: {0}")]
    S3Client(#[from] S3ClientError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl FileStoreError {
    /// True when the upload deadline expired before the save finished
    pub fn is_deadline_exceeded(&self) -> bool {
        matches!(
            self,
            FileStoreError::ObjectStore(ObjectStoreError::DeadlineExceeded)
        )
    }
}
