//! Outbound form and per-field hooks
//!
//! [`RewrittenForm`] collects the fields sent to the backend in place of the
//! original request body. A [`MultipartFormProcessor`] sees every saved file
//! and every plain field as it goes by and finalizes the outbound headers.

use super::signer::{Signer, REWRITTEN_FIELDS_HEADER};
use super::UploadError;
use crate::filestore::FileHandler;
use async_trait::async_trait;
use bytes::Bytes;
use hyper::header::{HeaderMap, HeaderValue};
use std::collections::BTreeMap;
use std::sync::Arc;

/// One outbound form field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundField {
    pub name: String,
    pub value: Bytes,
    pub content_type: Option<String>,
}

/// Fields of the rewritten request, in arrival order
#[derive(Debug, Default)]
pub struct RewrittenForm {
    fields: Vec<OutboundField>,
}

impl RewrittenForm {
    pub fn push(&mut self, field: OutboundField) {
        self.fields.push(field);
    }

    pub fn push_text(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.fields.push(OutboundField {
            name: name.into(),
            value: Bytes::from(value.into()),
            content_type: None,
        });
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.iter().any(|field| field.name == name)
    }

    /// First value of `name` as text
    pub fn get(&self, name: &str) -> Option<String> {
        self.fields
            .iter()
            .find(|field| field.name == name)
            .map(|field| String::from_utf8_lossy(&field.value).into_owned())
    }

    pub fn fields(&self) -> &[OutboundField] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Build a `multipart/form-data` body; every part is a plain field
    pub fn into_reqwest_form(self) -> reqwest::multipart::Form {
        self.fields
            .into_iter()
            .fold(reqwest::multipart::Form::new(), |form, field| {
                let part = reqwest::multipart::Part::bytes(field.value.to_vec());
                let part = match field.content_type.as_deref() {
                    Some(mime) => match part.mime_str(mime) {
                        Ok(part) => part,
                        Err(_) => reqwest::multipart::Part::bytes(field.value.to_vec()),
                    },
                    None => part,
                };
                form.part(field.name, part)
            })
    }

    /// Name/value pairs for an `application/x-www-form-urlencoded` body
    pub fn into_pairs(self) -> Vec<(String, String)> {
        self.fields
            .into_iter()
            .map(|field| {
                let value = String::from_utf8_lossy(&field.value).into_owned();
                (field.name, value)
            })
            .collect()
    }
}

/// Hooks run while a request body is rewritten
#[async_trait]
pub trait MultipartFormProcessor: Send {
    /// Called after a file was saved, verified and its fields were added
    async fn process_file(
        &mut self,
        form_name: &str,
        file: &FileHandler,
        form: &mut RewrittenForm,
    ) -> Result<(), UploadError>;

    /// Called after a plain field was copied
    async fn process_field(
        &mut self,
        form_name: &str,
        form: &mut RewrittenForm,
    ) -> Result<(), UploadError>;

    /// Called once after the whole body was consumed
    async fn finalize(&mut self, headers: &mut HeaderMap) -> Result<(), UploadError>;

    /// Digests to add as form fields; `None` for none, empty for all
    fn hash_functions(&self) -> Option<&[String]> {
        None
    }

    fn name(&self) -> &str;

    /// Number of files processed so far
    fn count(&self) -> usize;
}

/// Records every rewritten file field and signs the list on finalize
pub struct SavedFileTracker {
    route: String,
    signer: Option<Arc<Signer>>,
    hash_functions: Option<Vec<String>>,
    rewritten: BTreeMap<String, String>,
}

impl SavedFileTracker {
    pub fn new(
        route: impl Into<String>,
        signer: Option<Arc<Signer>>,
        hash_functions: Option<Vec<String>>,
    ) -> Self {
        Self {
            route: route.into(),
            signer,
            hash_functions,
            rewritten: BTreeMap::new(),
        }
    }

    /// Field name → local path, or remote id when nothing was kept locally
    pub fn rewritten_fields(&self) -> &BTreeMap<String, String> {
        &self.rewritten
    }
}

#[async_trait]
impl MultipartFormProcessor for SavedFileTracker {
    async fn process_file(
        &mut self,
        form_name: &str,
        file: &FileHandler,
        _form: &mut RewrittenForm,
    ) -> Result<(), UploadError> {
        if self.rewritten.contains_key(form_name) {
            return Err(UploadError::InjectedClientParam(form_name.to_string()));
        }

        let location = match &file.local_path {
            Some(path) => path.display().to_string(),
            None => file.remote_id.clone(),
        };
        self.rewritten.insert(form_name.to_string(), location);
        Ok(())
    }

    async fn process_field(
        &mut self,
        _form_name: &str,
        _form: &mut RewrittenForm,
    ) -> Result<(), UploadError> {
        Ok(())
    }

    async fn finalize(&mut self, headers: &mut HeaderMap) -> Result<(), UploadError> {
        let Some(signer) = &self.signer else {
            return Ok(());
        };

        let token = signer.sign_rewritten_fields(&self.rewritten)?;
        let value = HeaderValue::from_str(&token)
            .map_err(|e| UploadError::Verification(format!("unencodable manifest: {}", e)))?;
        headers.insert(REWRITTEN_FIELDS_HEADER, value);
        Ok(())
    }

    fn hash_functions(&self) -> Option<&[String]> {
        self.hash_functions.as_deref()
    }

    fn name(&self) -> &str {
        &self.route
    }

    fn count(&self) -> usize {
        self.rewritten.len()
    }
}
