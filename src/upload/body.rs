//! Whole-body uploads
//!
//! The request body is the file. It is saved under the field name `file`
//! and the backend receives an `application/x-www-form-urlencoded` body
//! with the `file.*` fields.

use super::processor::{MultipartFormProcessor, RewrittenForm};
use super::{UploadContext, UploadError};
use bytes::Bytes;
use futures::{Stream, TryStreamExt};
use std::io;
use tokio_util::io::StreamReader;

/// Field name of a whole-body upload
pub const BODY_FIELD: &str = "file";

impl UploadContext<'_> {
    /// Save a whole request body of `size` bytes (negative when unknown)
    #[tracing::instrument(
        name = "upload.body",
        skip(self, body, processor),
        fields(upload.route = %processor.name()),
        err
    )]
    pub async fn save_body<S, E>(
        &self,
        body: S,
        size: i64,
        processor: &mut dyn MultipartFormProcessor,
    ) -> Result<RewrittenForm, UploadError>
    where
        S: Stream<Item = Result<Bytes, E>> + Send,
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let reader = Box::pin(StreamReader::new(body.map_err(io::Error::other)));
        let mut form = RewrittenForm::default();

        self.store_file(BODY_FIELD, BODY_FIELD, reader, size, processor, &mut form)
            .await?;

        Ok(form)
    }
}
