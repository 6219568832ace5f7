//! Static keys for SDK uploads
//!
//! Bucket keys normally arrive with the authorization response
//! (`ObjectStorageCredentials`). When the response carries none, the
//! standard `AWS_*` environment variables are tried.

use super::S3ClientConfig;
use std::fmt;
use thiserror::Error;

/// Origin name reported to the SDK
const PROVIDER_NAME: &str = "hayate-authorize";

#[derive(Error, Debug)]
pub enum CredentialsError {
    #[error("Missing credentials: {0}")]
    MissingCredentials(String),
}

/// Key pair an SDK client signs with
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Credentials({}, <redacted>)", self.access_key_id)
    }
}

fn required(value: Option<String>, what: &str) -> Result<String, CredentialsError> {
    value
        .filter(|v| !v.is_empty())
        .ok_or_else(|| CredentialsError::MissingCredentials(format!("{} not set", what)))
}

impl Credentials {
    pub fn new(access_key_id: impl Into<String>, secret_access_key: impl Into<String>) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            session_token: None,
        }
    }

    pub fn access_key_id(&self) -> &str {
        &self.access_key_id
    }

    pub fn secret_access_key(&self) -> &str {
        &self.secret_access_key
    }

    /// Keys handed over with the upload's client config
    pub fn from_config(config: &S3ClientConfig) -> Result<Self, CredentialsError> {
        Ok(Self::new(
            required(config.access_key.clone(), "access key")?,
            required(config.secret_key.clone(), "secret key")?,
        ))
    }

    /// `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY` and optionally
    /// `AWS_SESSION_TOKEN`
    pub fn from_env() -> Result<Self, CredentialsError> {
        let var = |name: &str| std::env::var(name).ok();

        Ok(Self {
            access_key_id: required(var("AWS_ACCESS_KEY_ID"), "AWS_ACCESS_KEY_ID")?,
            secret_access_key: required(var("AWS_SECRET_ACCESS_KEY"), "AWS_SECRET_ACCESS_KEY")?,
            session_token: var("AWS_SESSION_TOKEN").filter(|t| !t.is_empty()),
        })
    }

    /// Config keys when present, else the environment
    pub fn resolve(config: &S3ClientConfig) -> Result<Self, CredentialsError> {
        Self::from_config(config).or_else(|e| {
            tracing::debug!(reason = %e, "No keys in authorization response, trying environment");
            Self::from_env()
        })
    }

    pub fn into_sdk(self) -> aws_credential_types::Credentials {
        aws_credential_types::Credentials::new(
            self.access_key_id,
            self.secret_access_key,
            self.session_token,
            None,
            PROVIDER_NAME,
        )
    }
}
