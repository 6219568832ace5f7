//! S3 Client Pool Module
//!
//! Caches SDK clients so uploads to the same bucket with the same
//! credentials share one connection pool.
//!
//! # Design
//!
//! - One client per (bucket, region, endpoint, path style, access key id)
//! - Clients are created lazily on first use
//! - Concurrent access through a `DashMap` of `Arc` references
//!
//! # Example
//!
//! ```no_run
//! use hayate::s3::{S3ClientConfig, S3ClientPool};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let pool = S3ClientPool::new();
//! let config = S3ClientConfig {
//!     bucket: "uploads".into(),
//!     region: "eu-west-1".into(),
//!     access_key: Some("AKID".into()),
//!     secret_key: Some("SECRET".into()),
//!     ..Default::default()
//! };
//!
//! let client = pool.get_or_create(&config).await?;
//! println!("Got client for bucket: {}", client.bucket());
//! # Ok(())
//! # }
//! ```

use crate::s3::{S3Client, S3ClientConfig, S3ClientError};
use dashmap::DashMap;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ClientKey {
    bucket: String,
    region: String,
    endpoint: Option<String>,
    path_style: bool,
    access_key: Option<String>,
}

impl From<&S3ClientConfig> for ClientKey {
    fn from(config: &S3ClientConfig) -> Self {
        Self {
            bucket: config.bucket.clone(),
            region: config.region.clone(),
            endpoint: config.endpoint.clone(),
            path_style: config.path_style,
            access_key: config.access_key.clone(),
        }
    }
}

/// S3 Client Pool
///
/// # Thread Safety
///
/// The pool is thread-safe. Clients are wrapped in `Arc` for shared access.
#[derive(Default)]
pub struct S3ClientPool {
    clients: DashMap<ClientKey, Arc<S3Client>>,
}

impl S3ClientPool {
    /// Create an empty pool
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached client for `config`, creating it if needed
    ///
    /// Two racing callers may both build a client; the first one stored
    /// wins and the other is dropped.
    pub async fn get_or_create(
        &self,
        config: &S3ClientConfig,
    ) -> Result<Arc<S3Client>, S3ClientError> {
        let key = ClientKey::from(config);

        if let Some(client) = self.clients.get(&key) {
            return Ok(Arc::clone(client.value()));
        }

        let client = Arc::new(S3Client::new(config.clone()).await?);
        let entry = self.clients.entry(key).or_insert(client);
        Ok(Arc::clone(entry.value()))
    }

    /// Get the number of clients in the pool
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }
}
