//! `multipart/form-data` rewriting
//!
//! Every file part is saved and replaced by `<field>.name`, `<field>.path`
//! (or `<field>.remote_url` / `<field>.remote_id`) and `<field>.size`, plus
//! digest fields when requested. Plain fields are copied through unchanged.

use super::processor::{MultipartFormProcessor, OutboundField, RewrittenForm};
use super::{UploadContext, UploadError};
use bytes::Bytes;
use futures::{Stream, TryStreamExt};
use std::collections::HashSet;
use std::io;
use std::path::PathBuf;
use tokio_util::io::StreamReader;

/// Reject file names that could escape a directory
pub fn validate_filename(filename: &str) -> Result<(), UploadError> {
    let illegal = filename == "."
        || filename == ".."
        || filename.contains('/')
        || filename.contains('\\')
        || filename.contains('\0');

    if illegal {
        return Err(UploadError::IllegalFilename(filename.to_string()));
    }
    Ok(())
}

/// Extract the boundary from a `multipart/form-data` content type
pub fn parse_boundary(content_type: Option<&str>) -> Result<String, UploadError> {
    let content_type = content_type
        .ok_or_else(|| UploadError::InvalidMultipart("missing Content-Type".to_string()))?;
    multer::parse_boundary(content_type).map_err(|e| UploadError::InvalidMultipart(e.to_string()))
}

fn invalid(e: multer::Error) -> UploadError {
    UploadError::InvalidMultipart(e.to_string())
}

impl UploadContext<'_> {
    /// Rewrite a `multipart/form-data` body
    ///
    /// Local files created for this body are removed again if rewriting
    /// fails part way.
    #[tracing::instrument(
        name = "upload.rewrite",
        skip(self, body, boundary, processor),
        fields(upload.route = %processor.name(), upload.files = tracing::field::Empty),
        err
    )]
    pub async fn rewrite_multipart<S, E>(
        &self,
        body: S,
        boundary: &str,
        processor: &mut dyn MultipartFormProcessor,
    ) -> Result<RewrittenForm, UploadError>
    where
        S: Stream<Item = Result<Bytes, E>> + Send + 'static,
        E: Into<Box<dyn std::error::Error + Send + Sync>> + 'static,
    {
        let mut multipart = multer::Multipart::new(body, boundary);
        let mut form = RewrittenForm::default();
        let mut created = Vec::new();

        let result = self
            .rewrite_fields(&mut multipart, &mut form, processor, &mut created)
            .await;

        if let Err(e) = result {
            for path in created {
                if let Err(remove_error) = tokio::fs::remove_file(&path).await {
                    tracing::debug!(path = %path.display(), error = %remove_error, "Temp file already gone");
                }
            }
            return Err(e);
        }

        tracing::Span::current().record("upload.files", processor.count() as u64);
        Ok(form)
    }

    async fn rewrite_fields(
        &self,
        multipart: &mut multer::Multipart<'static>,
        form: &mut RewrittenForm,
        processor: &mut dyn MultipartFormProcessor,
        created: &mut Vec<PathBuf>,
    ) -> Result<(), UploadError> {
        let mut file_fields: HashSet<String> = HashSet::new();
        let mut files = 0usize;

        while let Some(field) = multipart.next_field().await.map_err(invalid)? {
            let name = field.name().unwrap_or_default().to_string();
            let file_name = field
                .file_name()
                .filter(|file_name| !file_name.is_empty())
                .map(str::to_string);

            let Some(file_name) = file_name else {
                if is_rewritten_name(&file_fields, &name) {
                    return Err(UploadError::InjectedClientParam(name));
                }
                let content_type = field.content_type().map(ToString::to_string);
                let value = field.bytes().await.map_err(invalid)?;
                form.push(OutboundField {
                    name: name.clone(),
                    value,
                    content_type,
                });
                processor.process_field(&name, form).await?;
                continue;
            };

            files += 1;
            if self.max_files > 0 && files > self.max_files {
                return Err(UploadError::TooManyFiles(self.max_files));
            }
            validate_filename(&file_name)?;
            if !file_fields.insert(name.clone()) {
                return Err(UploadError::InjectedClientParam(name));
            }

            tracing::debug!(field = %name, file = %file_name, "Saving file part");
            let reader = Box::pin(StreamReader::new(field.map_err(io::Error::other)));
            let handler = self
                .store_file(&name, &file_name, reader, -1, processor, form)
                .await?;

            if let Some(path) = handler.local_path {
                created.push(path);
            }
        }

        Ok(())
    }
}

/// True when `name` is `<file field>.<anything>` for a file already seen
fn is_rewritten_name(file_fields: &HashSet<String>, name: &str) -> bool {
    name.rsplit_once('.')
        .is_some_and(|(prefix, _)| file_fields.contains(prefix))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_filename() {
        assert!(validate_filename("report.pdf").is_ok());
        assert!(validate_filename("..hidden").is_ok());

        for bad in [".", "..", "../etc/passwd", "a/b", "a\\b"] {
            assert!(
                matches!(validate_filename(bad), Err(UploadError::IllegalFilename(_))),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn test_parse_boundary() {
        assert_eq!(
            parse_boundary(Some("multipart/form-data; boundary=XyZ")).unwrap(),
            "XyZ"
        );
        assert!(parse_boundary(Some("application/json")).is_err());
        assert!(parse_boundary(None).is_err());
    }

    #[test]
    fn test_rewritten_name_detection() {
        let mut fields = HashSet::new();
        fields.insert("file".to_string());

        assert!(is_rewritten_name(&fields, "file.path"));
        assert!(is_rewritten_name(&fields, "file.remote_id"));
        assert!(!is_rewritten_name(&fields, "file"));
        assert!(!is_rewritten_name(&fields, "other.path"));
    }
}
