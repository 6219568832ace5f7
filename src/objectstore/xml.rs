//! S3 XML wire shapes
//!
//! `CompleteMultipartUpload` answers with either a
//! `CompleteMultipartUploadResult` or an `Error` document, even on HTTP 200.
//! Both are read through a single envelope whose fields are all optional;
//! the root element name is not checked.

use super::ObjectStoreError;
use serde::{Deserialize, Serialize};

/// One uploaded part, as listed in the complete request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompletedPart {
    #[serde(rename = "PartNumber")]
    pub part_number: u32,
    #[serde(rename = "ETag")]
    pub etag: String,
}

#[derive(Serialize)]
#[serde(rename = "CompleteMultipartUpload")]
struct CompleteMultipartUpload<'a> {
    #[serde(rename = "Part")]
    parts: &'a [CompletedPart],
}

/// Result or error document returned by `CompleteMultipartUpload`
#[derive(Debug, Default, Deserialize)]
pub struct CompleteMultipartUploadResponse {
    #[serde(rename = "Location", default)]
    pub location: Option<String>,
    #[serde(rename = "Bucket", default)]
    pub bucket: Option<String>,
    #[serde(rename = "Key", default)]
    pub key: Option<String>,
    #[serde(rename = "ETag", default)]
    pub etag: Option<String>,
    #[serde(rename = "Code", default)]
    pub code: Option<String>,
    #[serde(rename = "Message", default)]
    pub message: Option<String>,
}

/// Build the `CompleteMultipartUpload` request body
pub fn complete_multipart_body(parts: &[CompletedPart]) -> Result<String, ObjectStoreError> {
    quick_xml::se::to_string(&CompleteMultipartUpload { parts })
        .map_err(|e| ObjectStoreError::Xml(e.to_string()))
}

/// Parse a complete response and return the final object ETag
///
/// An in-body `<Code>` is a failure regardless of the HTTP status.
pub fn parse_complete_response(body: &str) -> Result<String, ObjectStoreError> {
    let envelope: CompleteMultipartUploadResponse =
        quick_xml::de::from_str(body).map_err(|e| ObjectStoreError::Xml(e.to_string()))?;

    if let Some(code) = envelope.code.filter(|code| !code.is_empty()) {
        return Err(ObjectStoreError::CompleteFailed {
            code,
            message: envelope.message.unwrap_or_default(),
        });
    }

    envelope
        .etag
        .filter(|etag| !etag.is_empty())
        .ok_or(ObjectStoreError::MissingETag("complete_multipart"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_complete_body_lists_parts_in_order() {
        let parts = vec![
            CompletedPart {
                part_number: 1,
                etag: "aaa".into(),
            },
            CompletedPart {
                part_number: 2,
                etag: "bbb".into(),
            },
        ];

        let body = complete_multipart_body(&parts).unwrap();
        assert!(body.starts_with("<CompleteMultipartUpload>"));
        let first = body.find("<PartNumber>1</PartNumber><ETag>aaa</ETag>").unwrap();
        let second = body.find("<PartNumber>2</PartNumber><ETag>bbb</ETag>").unwrap();
        assert!(first < second);
        assert_eq!(body.matches("<Part>").count(), 2);
    }

    #[test]
    fn test_parse_result() {
        let body = r#"<?xml version="1.0" encoding="UTF-8"?>
<CompleteMultipartUploadResult xmlns="http://s3.amazonaws.com/doc/2006-03-01/">
  <Location>http://example.com/bucket/key</Location>
  <Bucket>bucket</Bucket>
  <Key>key</Key>
  <ETag>"3858f62230ac3c915f300c664312c11f-2"</ETag>
</CompleteMultipartUploadResult>"#;

        let etag = parse_complete_response(body).unwrap();
        assert_eq!(etag, "\"3858f62230ac3c915f300c664312c11f-2\"");
    }

    #[test]
    fn test_parse_in_body_error() {
        let body = r#"<?xml version="1.0" encoding="UTF-8"?>
<Error>
  <Code>InternalError</Code>
  <Message>We encountered an internal error. Please try again.</Message>
  <RequestId>656c76696e6727732072657175657374</RequestId>
</Error>"#;

        match parse_complete_response(body) {
            Err(ObjectStoreError::CompleteFailed { code, message }) => {
                assert_eq!(code, "InternalError");
                assert!(message.starts_with("We encountered"));
            }
            other => panic!("expected CompleteFailed, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_missing_etag() {
        let body = "<CompleteMultipartUploadResult><Key>key</Key></CompleteMultipartUploadResult>";
        assert!(matches!(
            parse_complete_response(body),
            Err(ObjectStoreError::MissingETag(_))
        ));
    }

    #[test]
    fn test_parse_garbage() {
        assert!(matches!(
            parse_complete_response("<not-closed"),
            Err(ObjectStoreError::Xml(_))
        ));
    }
}
