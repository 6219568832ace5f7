//! Upload module
//!
//! Turns an inbound upload request into a small request the backend can
//! handle: file bytes are saved by [`crate::filestore`] and replaced with
//! fields describing where they went.
//!
//! | Submodule | Role |
//! |-----------|------|
//! | [`rewrite`] | `multipart/form-data` rewriting |
//! | [`body`] | whole-body uploads |
//! | [`processor`] | per-field hooks and the signed field manifest |
//! | [`preparer`] | authorization response → save options + verifier |
//! | [`accelerate`] | pre-authorize, save, verify, forward |

use crate::api::ApiError;
use crate::filestore::{save_file_from_reader, FileHandler, FileStoreError, SaveOptions};
use crate::objectstore::ObjectStoreClients;
use hyper::StatusCode;
use serde::Deserialize;
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;

pub mod accelerate;
pub mod body;
pub mod preparer;
pub mod processor;
pub mod rewrite;
pub mod signer;

pub use accelerate::Accelerator;
pub use preparer::{DefaultPreparer, IntegrityVerifier, Preparer, Verifier};
pub use processor::{MultipartFormProcessor, OutboundField, RewrittenForm, SavedFileTracker};
pub use signer::{Signer, SignerError};

/// Upload errors
#[derive(Error, Debug)]
pub enum UploadError {
    #[error("Illegal filename: {0:?}")]
    IllegalFilename(String),

    #[error("Injected client parameter: {0}")]
    InjectedClientParam(String),

    #[error("Too many files: limit is {0}")]
    TooManyFiles(usize),

    #[error("Invalid multipart body: {0}")]
    InvalidMultipart(String),

    #[error("Verification failed: {0}")]
    Verification(String),

    #[error("Backend API error: {0}")]
    Api(#[from] ApiError),

    #[error("File store error: {0}")]
    FileStore(#[from] FileStoreError),

    #[error("Signing error: {0}")]
    Signing(#[from] SignerError),
}

impl UploadError {
    /// HTTP status reported to the client
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::IllegalFilename(_)
            | Self::InjectedClientParam(_)
            | Self::TooManyFiles(_)
            | Self::InvalidMultipart(_) => StatusCode::BAD_REQUEST,
            Self::FileStore(FileStoreError::EntityTooLarge { .. }) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::FileStore(e) if e.is_deadline_exceeded() => StatusCode::GATEWAY_TIMEOUT,
            Self::Api(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// How an upload route carries its file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadKind {
    /// `multipart/form-data` with one or more file parts
    Multipart,
    /// The whole request body is the file
    Body,
}

/// Everything needed to save the files of one request
pub struct UploadContext<'a> {
    /// Request context; cancelling it releases temp files and stored objects
    pub ctx: &'a CancellationToken,
    pub clients: &'a ObjectStoreClients,
    pub opts: &'a SaveOptions,
    pub verifier: Option<&'a dyn Verifier>,
    /// Most file parts accepted per request, 0 for no limit
    pub max_files: usize,
}

impl UploadContext<'_> {
    /// Save one file, verify it, and record its fields in `form`
    pub(crate) async fn store_file<R>(
        &self,
        field_name: &str,
        file_name: &str,
        reader: R,
        size: i64,
        processor: &mut dyn MultipartFormProcessor,
        form: &mut RewrittenForm,
    ) -> Result<FileHandler, UploadError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let opts = self.opts.with_prefix(file_name);
        let hash_functions = processor
            .hash_functions()
            .map(<[String]>::to_vec)
            .unwrap_or_else(|| vec!["md5".to_string()]);

        let handler =
            save_file_from_reader(self.ctx, self.clients, reader, size, &opts, &hash_functions)
                .await?;

        if let Err(e) = self.accept_file(field_name, &handler, processor, form).await {
            if let Some(path) = &handler.local_path {
                if let Err(remove_error) = tokio::fs::remove_file(path).await {
                    tracing::debug!(path = %path.display(), error = %remove_error, "Temp file already gone");
                }
            }
            return Err(e);
        }

        Ok(handler)
    }

    async fn accept_file(
        &self,
        field_name: &str,
        handler: &FileHandler,
        processor: &mut dyn MultipartFormProcessor,
        form: &mut RewrittenForm,
    ) -> Result<(), UploadError> {
        if let Some(verifier) = self.verifier {
            verifier.verify(handler).await?;
        }

        for (name, value) in handler.fields(field_name, processor.hash_functions()) {
            if form.contains(&name) {
                return Err(UploadError::InjectedClientParam(name));
            }
            form.push_text(name, value);
        }

        processor.process_file(field_name, handler, form).await
    }
}
