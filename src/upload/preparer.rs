//! Save preparation and post-save verification
//!
//! A [`Preparer`] turns the backend's authorization response into the
//! [`SaveOptions`] for this request and, when the response asks for it, a
//! [`Verifier`] that checks every saved file before it is reported.

use super::UploadError;
use crate::api::AuthorizeResponse;
use crate::filestore::{FileHandler, SaveOptions};
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;

/// Checks a saved file before its fields are forwarded
#[async_trait]
pub trait Verifier: Send + Sync {
    async fn verify(&self, file: &FileHandler) -> Result<(), UploadError>;
}

/// Maps an authorization response to save options and an optional verifier
pub trait Preparer: Send + Sync {
    fn prepare(
        &self,
        response: &AuthorizeResponse,
    ) -> Result<(SaveOptions, Option<Box<dyn Verifier>>), UploadError>;
}

/// Resolves options with a fallback temp directory and upload timeout
#[derive(Debug, Clone)]
pub struct DefaultPreparer {
    temp_dir: Option<PathBuf>,
    default_timeout: Duration,
}

impl DefaultPreparer {
    pub fn new(temp_dir: Option<PathBuf>, default_timeout: Duration) -> Self {
        Self {
            temp_dir,
            default_timeout,
        }
    }
}

impl Preparer for DefaultPreparer {
    fn prepare(
        &self,
        response: &AuthorizeResponse,
    ) -> Result<(SaveOptions, Option<Box<dyn Verifier>>), UploadError> {
        let opts =
            SaveOptions::from_authorize(response, self.temp_dir.as_deref(), self.default_timeout);

        let verifier = (!response.lfs_oid.is_empty()).then(|| {
            Box::new(IntegrityVerifier::new(&response.lfs_oid, response.lfs_size))
                as Box<dyn Verifier>
        });

        Ok((opts, verifier))
    }
}

/// Requires an exact size and SHA-256 digest
#[derive(Debug, Clone)]
pub struct IntegrityVerifier {
    sha256: String,
    size: i64,
}

impl IntegrityVerifier {
    pub fn new(sha256: &str, size: i64) -> Self {
        Self {
            sha256: sha256.to_ascii_lowercase(),
            size,
        }
    }
}

#[async_trait]
impl Verifier for IntegrityVerifier {
    async fn verify(&self, file: &FileHandler) -> Result<(), UploadError> {
        if i64::try_from(file.size).ok() != Some(self.size) {
            return Err(UploadError::Verification(format!(
                "expected {} bytes, got {}",
                self.size, file.size
            )));
        }

        match file.sha256() {
            Some(actual) if actual == self.sha256 => Ok(()),
            actual => Err(UploadError::Verification(format!(
                "expected sha256 {}, got {}",
                self.sha256,
                actual.unwrap_or("none")
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    const HELLO_SHA256: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    fn saved(size: u64, sha256: &str) -> FileHandler {
        let mut hashes = BTreeMap::new();
        hashes.insert("sha256".to_string(), sha256.to_string());
        FileHandler {
            size,
            hashes,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_integrity_verifier() {
        let verifier = IntegrityVerifier::new(&HELLO_SHA256.to_uppercase(), 5);

        assert!(verifier.verify(&saved(5, HELLO_SHA256)).await.is_ok());
        assert!(matches!(
            verifier.verify(&saved(4, HELLO_SHA256)).await,
            Err(UploadError::Verification(_))
        ));
        assert!(matches!(
            verifier.verify(&saved(5, "00")).await,
            Err(UploadError::Verification(_))
        ));
    }

    #[test]
    fn test_default_preparer_adds_verifier_for_lfs() {
        let preparer = DefaultPreparer::new(Some(PathBuf::from("/tmp")), Duration::from_secs(60));

        let (opts, verifier) = preparer.prepare(&AuthorizeResponse::default()).unwrap();
        assert!(opts.is_local());
        assert!(verifier.is_none());

        let response = AuthorizeResponse {
            lfs_oid: HELLO_SHA256.into(),
            lfs_size: 5,
            ..Default::default()
        };
        let (_, verifier) = preparer.prepare(&response).unwrap();
        assert!(verifier.is_some());
    }
}
