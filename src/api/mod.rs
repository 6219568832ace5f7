//! Backend API
//!
//! Types exchanged with the application backend during pre-authorization,
//! and the client that talks to it.
//!
//! The authorization response uses the backend's PascalCase keys:
//!
//! ```json
//! {
//!   "TempPath": "/var/tmp/uploads",
//!   "RemoteObject": {
//!     "ID": "f3a1...",
//!     "GetURL": "https://bucket.s3.amazonaws.com/tmp/uploads/f3a1?X-Amz-...",
//!     "StoreURL": "https://bucket.s3.amazonaws.com/tmp/uploads/f3a1?X-Amz-...",
//!     "DeleteURL": "https://bucket.s3.amazonaws.com/tmp/uploads/f3a1?X-Amz-...",
//!     "Timeout": 3600
//!   },
//!   "MaximumSize": 104857600
//! }
//! ```

pub mod client;

pub use client::{
    full_body, proxy_headers, relay_response, status_response, ApiClient, Authorization, BoxError,
    OutboundBody, ResponseBody,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Backend API errors
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Invalid backend URL: {0}")]
    InvalidUrl(String),

    #[error("Backend request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Invalid authorization response: {0}")]
    InvalidResponse(String),

    #[error("Signing error: {0}")]
    Signing(String),
}

/// Pre-authorization answer describing where and how to store an upload
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthorizeResponse {
    #[serde(rename = "TempPath")]
    pub temp_path: String,

    #[serde(rename = "RemoteObject")]
    pub remote_object: RemoteObject,

    /// Per-file size cap in bytes, 0 for none
    #[serde(rename = "MaximumSize")]
    pub maximum_size: i64,

    /// Hash fields to emit; empty means all of them
    #[serde(rename = "UploadHashFunctions")]
    pub upload_hash_functions: Vec<String>,

    /// Expected SHA-256 of a Git LFS object
    #[serde(rename = "LfsOid")]
    pub lfs_oid: String,

    #[serde(rename = "LfsSize")]
    pub lfs_size: i64,

    #[serde(rename = "ObjectStorageCredentials")]
    pub object_storage_credentials: Option<ObjectStorageCredentials>,
}

/// Remote object descriptor
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteObject {
    #[serde(rename = "ID")]
    pub id: String,

    #[serde(rename = "GetURL")]
    pub get_url: String,

    #[serde(rename = "StoreURL")]
    pub store_url: String,

    #[serde(rename = "DeleteURL")]
    pub delete_url: String,

    /// Upload timeout in seconds, 0 for the configured default
    #[serde(rename = "Timeout")]
    pub timeout: u64,

    #[serde(rename = "UseSdkClient")]
    pub use_sdk_client: bool,

    #[serde(rename = "RemoteTempObjectID")]
    pub remote_temp_object_id: String,

    #[serde(rename = "ObjectStorage")]
    pub object_storage: Option<ObjectStorageParams>,

    #[serde(rename = "MultipartUpload")]
    pub multipart_upload: Option<MultipartUploadParams>,

    #[serde(rename = "ContentLengthRequired")]
    pub content_length_required: bool,
}

/// Presigned multipart upload descriptor
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MultipartUploadParams {
    #[serde(rename = "PartSize")]
    pub part_size: i64,

    #[serde(rename = "PartURLs")]
    pub part_urls: Vec<String>,

    #[serde(rename = "CompleteURL")]
    pub complete_url: String,

    #[serde(rename = "AbortURL")]
    pub abort_url: String,
}

/// Bucket settings for SDK uploads
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectStorageParams {
    #[serde(rename = "Provider")]
    pub provider: String,

    #[serde(rename = "S3Config")]
    pub s3_config: S3Params,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct S3Params {
    #[serde(rename = "Bucket")]
    pub bucket: String,

    #[serde(rename = "Region")]
    pub region: String,

    #[serde(rename = "Endpoint")]
    pub endpoint: String,

    #[serde(rename = "PathStyle")]
    pub path_style: bool,

    #[serde(rename = "UseIamProfile")]
    pub use_iam_profile: bool,

    #[serde(rename = "ServerSideEncryption")]
    pub server_side_encryption: String,

    #[serde(rename = "SSEKMSKeyID")]
    pub sse_kms_key_id: String,
}

/// Long-lived bucket credentials for SDK uploads
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectStorageCredentials {
    #[serde(rename = "Provider")]
    pub provider: String,

    #[serde(rename = "S3Credentials")]
    pub s3_credentials: S3Credentials,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct S3Credentials {
    #[serde(rename = "AwsAccessKeyID")]
    pub aws_access_key_id: String,

    #[serde(rename = "AwsSecretAccessKey")]
    pub aws_secret_access_key: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_presigned_multipart() {
        let json = r#"{
            "TempPath": "/tmp/uploads",
            "RemoteObject": {
                "ID": "abc",
                "GetURL": "http://store/get",
                "DeleteURL": "http://store/delete",
                "Timeout": 120,
                "MultipartUpload": {
                    "PartSize": 4,
                    "PartURLs": ["http://store/1", "http://store/2"],
                    "CompleteURL": "http://store/complete",
                    "AbortURL": "http://store/abort"
                }
            },
            "MaximumSize": 1024
        }"#;

        let response: AuthorizeResponse = serde_json::from_str(json).unwrap();
        assert_eq!(response.temp_path, "/tmp/uploads");
        assert_eq!(response.remote_object.timeout, 120);
        assert_eq!(response.maximum_size, 1024);

        let multipart = response.remote_object.multipart_upload.unwrap();
        assert_eq!(multipart.part_size, 4);
        assert_eq!(multipart.part_urls.len(), 2);
        assert!(response.remote_object.store_url.is_empty());
    }

    #[test]
    fn test_parse_sdk_settings() {
        let json = r#"{
            "RemoteObject": {
                "ID": "abc",
                "UseSdkClient": true,
                "RemoteTempObjectID": "tmp/uploads/abc",
                "ObjectStorage": {
                    "Provider": "AWS",
                    "S3Config": {"Bucket": "uploads", "Region": "eu-west-1", "PathStyle": true}
                }
            },
            "ObjectStorageCredentials": {
                "Provider": "AWS",
                "S3Credentials": {"AwsAccessKeyID": "AKID", "AwsSecretAccessKey": "SECRET"}
            }
        }"#;

        let response: AuthorizeResponse = serde_json::from_str(json).unwrap();
        let storage = response.remote_object.object_storage.unwrap();
        assert_eq!(storage.s3_config.bucket, "uploads");
        assert!(storage.s3_config.path_style);
        assert_eq!(
            response
                .object_storage_credentials
                .unwrap()
                .s3_credentials
                .aws_access_key_id,
            "AKID"
        );
    }

    #[test]
    fn test_parse_empty_object() {
        let response: AuthorizeResponse = serde_json::from_str("{}").unwrap();
        assert_eq!(response, AuthorizeResponse::default());
    }
}
