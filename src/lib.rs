//! Hayate Library
//!
//! Request-accelerating reverse proxy: upload requests are intercepted, their
//! file bytes are streamed to local disk and/or object storage, and the
//! backend receives a small rewritten request describing where the files went.
//!
//! # Features
//!
//! - **Single pass**: every byte is read once and fanned out to each destination
//! - **Object storage**: presigned PUT, presigned multipart, or the S3 SDK
//! - **Integrity**: MD5 / SHA-256 digests and ETag verification
//! - **Backpressure**: a slow store throttles the client, never memory
//! - **Signed fields**: rewritten form fields are listed in a JWT for the backend
//!
//! # Example
//!
//! ```no_run
//! use hayate::{config::Config, objectstore::ObjectStoreClients, server::Server};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let clients = Arc::new(ObjectStoreClients::new(config.upload.pipe_buffer_size)?);
//!     let server = Server::bind(config, clients).await?;
//!     server.run(CancellationToken::new()).await?;
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod config;
pub mod filestore;
pub mod logging;
pub mod metrics;
pub mod objectstore;
pub mod router;
pub mod s3;
pub mod server;
pub mod upload;

// Re-export commonly used types
pub use config::Config;
pub use filestore::{save_file_from_reader, FileHandler, SaveOptions};
pub use server::Server;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
