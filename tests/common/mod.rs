//! Shared helpers for integration tests
//!
//! A `wiremock` server stands in for the object store and the backend.

#![allow(dead_code)]

use hayate::objectstore::{build_multipart_upload_etag, CompletedPart};
use md5::{Digest, Md5};
use std::time::Duration;
use wiremock::{MockServer, Request, Respond, ResponseTemplate};

pub fn md5_hex(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

/// Composite ETag S3 reports for an object uploaded in `parts`
pub fn composite_etag(parts: &[&[u8]]) -> String {
    let parts: Vec<CompletedPart> = parts
        .iter()
        .enumerate()
        .map(|(i, data)| CompletedPart {
            part_number: i as u32 + 1,
            etag: md5_hex(data),
        })
        .collect();
    build_multipart_upload_etag(&parts).unwrap()
}

/// Answers a PUT like S3 does: 200 with the quoted MD5 of the body
pub struct EtagFromBody;

impl Respond for EtagFromBody {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        ResponseTemplate::new(200).insert_header("ETag", format!("\"{}\"", md5_hex(&request.body)))
    }
}

/// A `CompleteMultipartUploadResult` carrying `etag`
pub fn complete_result(etag: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_string(format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
         <CompleteMultipartUploadResult>\
         <Location>http://store/bucket/key</Location>\
         <Bucket>bucket</Bucket><Key>key</Key>\
         <ETag>\"{}\"</ETag>\
         </CompleteMultipartUploadResult>",
        etag
    ))
}

/// Requests the server received for `method` on `path`
pub async fn received(server: &MockServer, method: &str, path: &str) -> Vec<Request> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .into_iter()
        .filter(|r| r.method.as_str() == method && r.url.path() == path)
        .collect()
}

/// Wait until `method path` was received `count` times (cleanup runs in the
/// background after the caller context ends)
pub async fn wait_for(server: &MockServer, method: &str, path: &str, count: usize) -> usize {
    for _ in 0..100 {
        let seen = received(server, method, path).await.len();
        if seen >= count {
            return seen;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    received(server, method, path).await.len()
}

/// Give background cleanup a moment, then count requests
pub async fn settle_and_count(server: &MockServer, method: &str, path: &str) -> usize {
    tokio::time::sleep(Duration::from_millis(200)).await;
    received(server, method, path).await.len()
}

/// Build a `multipart/form-data` body by hand
pub struct FormBuilder {
    boundary: String,
    body: Vec<u8>,
}

impl FormBuilder {
    pub fn new() -> Self {
        Self {
            boundary: "hayate-test-boundary".to_string(),
            body: Vec::new(),
        }
    }

    pub fn field(mut self, name: &str, value: &str) -> Self {
        self.body.extend_from_slice(
            format!(
                "--{}\r\nContent-Disposition: form-data; name=\"{}\"\r\n\r\n{}\r\n",
                self.boundary, name, value
            )
            .as_bytes(),
        );
        self
    }

    pub fn file(mut self, name: &str, filename: &str, content: &[u8]) -> Self {
        self.body.extend_from_slice(
            format!(
                "--{}\r\nContent-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n\
                 Content-Type: application/octet-stream\r\n\r\n",
                self.boundary, name, filename
            )
            .as_bytes(),
        );
        self.body.extend_from_slice(content);
        self.body.extend_from_slice(b"\r\n");
        self
    }

    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    pub fn content_type(&self) -> String {
        format!("multipart/form-data; boundary={}", self.boundary)
    }

    pub fn build(mut self) -> Vec<u8> {
        self.body
            .extend_from_slice(format!("--{}--\r\n", self.boundary).as_bytes());
        self.body
    }
}
