//! Per-upload destination settings
//!
//! [`SaveOptions`] is resolved once from the backend's authorization response
//! and never changes while the upload runs.

use crate::api::AuthorizeResponse;
use crate::objectstore::s3_object::Encryption;
use crate::s3::S3ClientConfig;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::Instant;

/// Upload timeout when the authorization response names none
pub const DEFAULT_UPLOAD_TIMEOUT: Duration = Duration::from_secs(4 * 60 * 60);

/// Temp file prefix when no file name is known
pub const DEFAULT_TEMP_FILE_PREFIX: &str = "upload";

/// Provider name selecting SDK uploads
const AWS_PROVIDER: &str = "AWS";

/// Which remote destination a save drives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteMode {
    None,
    SinglePut,
    Multipart,
    Sdk,
}

/// SDK upload target
#[derive(Debug, Clone)]
pub struct SdkOptions {
    pub client: S3ClientConfig,
    pub object_name: String,
    pub encryption: Encryption,
}

/// Where and how one file is stored
#[derive(Debug, Clone)]
pub struct SaveOptions {
    /// Directory for the local copy; `None` disables it
    pub local_temp_path: Option<PathBuf>,
    /// Prefix of the local temp file name, also the file's display name
    pub temp_file_prefix: String,

    pub remote_id: String,
    /// URL the backend reads the object from
    pub remote_url: String,
    pub presigned_put: Option<String>,
    pub presigned_delete: Option<String>,
    /// Fail single-PUT uploads of unknown size instead of streaming chunked
    pub put_requires_length: bool,

    /// Multipart part size; multipart is active when > 0
    pub part_size: i64,
    pub presigned_parts: Vec<String>,
    pub presigned_complete_multipart: Option<String>,
    pub presigned_abort_multipart: Option<String>,

    /// Absolute upload deadline
    pub deadline: Instant,

    pub object_storage: Option<SdkOptions>,

    /// Per-file size cap in bytes, 0 for none
    pub maximum_size: i64,
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

impl SaveOptions {
    /// Local-only options writing into `dir`
    pub fn local(dir: impl Into<PathBuf>) -> Self {
        Self {
            local_temp_path: Some(dir.into()),
            ..Self::remote_only()
        }
    }

    fn remote_only() -> Self {
        Self {
            local_temp_path: None,
            temp_file_prefix: DEFAULT_TEMP_FILE_PREFIX.to_string(),
            remote_id: String::new(),
            remote_url: String::new(),
            presigned_put: None,
            presigned_delete: None,
            put_requires_length: false,
            part_size: 0,
            presigned_parts: Vec::new(),
            presigned_complete_multipart: None,
            presigned_abort_multipart: None,
            deadline: Instant::now() + DEFAULT_UPLOAD_TIMEOUT,
            object_storage: None,
            maximum_size: 0,
        }
    }

    /// Resolve options from an authorization response
    ///
    /// `fallback_temp_dir` is used for the local copy only when the response
    /// names neither a `TempPath` nor a remote destination.
    pub fn from_authorize(
        response: &AuthorizeResponse,
        fallback_temp_dir: Option<&Path>,
        default_timeout: Duration,
    ) -> Self {
        let remote = &response.remote_object;
        let timeout = if remote.timeout > 0 {
            Duration::from_secs(remote.timeout)
        } else {
            default_timeout
        };

        let mut opts = Self {
            local_temp_path: non_empty(&response.temp_path).map(PathBuf::from),
            remote_id: remote.id.clone(),
            remote_url: remote.get_url.clone(),
            presigned_put: non_empty(&remote.store_url),
            presigned_delete: non_empty(&remote.delete_url),
            put_requires_length: remote.content_length_required,
            deadline: Instant::now() + timeout,
            maximum_size: response.maximum_size.max(0),
            ..Self::remote_only()
        };

        if let Some(multipart) = &remote.multipart_upload {
            opts.part_size = multipart.part_size;
            opts.presigned_parts = multipart.part_urls.clone();
            opts.presigned_complete_multipart = non_empty(&multipart.complete_url);
            opts.presigned_abort_multipart = non_empty(&multipart.abort_url);
        }

        opts.object_storage = sdk_options(response);

        if opts.local_temp_path.is_none() && opts.remote_mode() == RemoteMode::None {
            opts.local_temp_path = fallback_temp_dir.map(Path::to_path_buf);
        }

        opts
    }

    /// The same options with a different temp file prefix
    pub fn with_prefix(&self, prefix: &str) -> Self {
        Self {
            temp_file_prefix: prefix.to_string(),
            ..self.clone()
        }
    }

    pub fn is_local(&self) -> bool {
        self.local_temp_path.is_some()
    }

    /// A presigned destination is configured
    pub fn is_remote(&self) -> bool {
        self.presigned_put.is_some() || self.is_multipart()
    }

    pub fn is_multipart(&self) -> bool {
        self.part_size > 0
    }

    /// The remote destination to use; SDK uploads win over presigned URLs
    pub fn remote_mode(&self) -> RemoteMode {
        if self.object_storage.is_some() {
            RemoteMode::Sdk
        } else if self.is_multipart() {
            RemoteMode::Multipart
        } else if self.is_remote() {
            RemoteMode::SinglePut
        } else {
            RemoteMode::None
        }
    }
}

fn sdk_options(response: &AuthorizeResponse) -> Option<SdkOptions> {
    let remote = &response.remote_object;
    if !remote.use_sdk_client || remote.remote_temp_object_id.is_empty() {
        return None;
    }

    let storage = remote
        .object_storage
        .as_ref()
        .filter(|storage| storage.provider == AWS_PROVIDER)?;
    let s3 = &storage.s3_config;
    let credentials = response
        .object_storage_credentials
        .as_ref()
        .map(|c| &c.s3_credentials);

    if !s3.use_iam_profile && credentials.is_none() {
        return None;
    }

    Some(SdkOptions {
        client: S3ClientConfig {
            bucket: s3.bucket.clone(),
            region: s3.region.clone(),
            endpoint: non_empty(&s3.endpoint),
            access_key: credentials.and_then(|c| non_empty(&c.aws_access_key_id)),
            secret_key: credentials.and_then(|c| non_empty(&c.aws_secret_access_key)),
            path_style: s3.path_style,
            use_iam_profile: s3.use_iam_profile,
        },
        object_name: remote.remote_temp_object_id.clone(),
        encryption: Encryption {
            server_side_encryption: non_empty(&s3.server_side_encryption),
            kms_key_id: non_empty(&s3.sse_kms_key_id),
        },
    })
}
