//! Upload acceleration
//!
//! ```text
//! client ──► pre-authorize ──► rejected? ──► relay backend response
//!                 │
//!                 ▼
//!          save files (local / remote) ──► verify ──► forward rewritten
//!                                                      request to backend
//! ```
//!
//! Every file saved for a request is released when the response has been
//! sent or the request is abandoned: the request context is cancelled by a
//! drop guard that travels with the response body.

use super::preparer::Preparer;
use super::processor::{MultipartFormProcessor, SavedFileTracker};
use super::rewrite::parse_boundary;
use super::signer::Signer;
use super::{UploadContext, UploadError, UploadKind};
use crate::api::{
    proxy_headers, relay_response, status_response, ApiClient, Authorization, AuthorizeResponse,
    BoxError, OutboundBody, ResponseBody,
};
use crate::objectstore::ObjectStoreClients;
use bytes::Bytes;
use futures::{Stream, TryStreamExt};
use http_body_util::BodyStream;
use hyper::body::Body;
use hyper::header::{CONTENT_LENGTH, CONTENT_TYPE};
use hyper::{Request, Response};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// What the backend said after the upload was handled
enum Forwarded {
    Backend(reqwest::Response),
    Rejected(reqwest::Response),
}

/// Handles upload routes end to end
pub struct Accelerator {
    api: Arc<ApiClient>,
    clients: Arc<ObjectStoreClients>,
    preparer: Box<dyn Preparer>,
    signer: Option<Arc<Signer>>,
    max_files: usize,
    hash_fields: bool,
}

impl Accelerator {
    pub fn new(
        api: Arc<ApiClient>,
        clients: Arc<ObjectStoreClients>,
        preparer: Box<dyn Preparer>,
        signer: Option<Arc<Signer>>,
    ) -> Self {
        Self {
            api,
            clients,
            preparer,
            signer,
            max_files: 0,
            hash_fields: false,
        }
    }

    /// Most file parts per request, 0 for no limit
    pub fn with_max_files(mut self, max_files: usize) -> Self {
        self.max_files = max_files;
        self
    }

    /// Add digest fields for every file even when the backend names none
    pub fn with_hash_fields(mut self, hash_fields: bool) -> Self {
        self.hash_fields = hash_fields;
        self
    }

    /// Handle one upload request
    ///
    /// Errors never escape: they become a bare status response and any
    /// stored object is cleaned up.
    pub async fn handle<B>(
        &self,
        request: Request<B>,
        kind: UploadKind,
        route: &str,
    ) -> Response<ResponseBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError> + 'static,
    {
        let ctx = CancellationToken::new();
        let guard = ctx.clone().drop_guard();

        match self.accelerate(&ctx, request, kind, route).await {
            Ok(Forwarded::Backend(response)) => relay_response(response, Some(guard)),
            Ok(Forwarded::Rejected(response)) => relay_response(response, None),
            Err(e) => {
                let status = e.status_code();
                if status.is_server_error() {
                    tracing::error!(route = route, error = %e, "Upload failed");
                } else {
                    tracing::warn!(route = route, error = %e, "Upload rejected");
                }
                status_response(status)
            }
        }
    }

    #[tracing::instrument(
        name = "upload.accelerate",
        skip(self, ctx, request, kind),
        fields(
            http.method = %request.method(),
            http.path = %request.uri().path(),
            upload.kind = ?kind
        )
    )]
    async fn accelerate<B>(
        &self,
        ctx: &CancellationToken,
        request: Request<B>,
        kind: UploadKind,
        route: &str,
    ) -> Result<Forwarded, UploadError>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError> + 'static,
    {
        let (parts, body) = request.into_parts();
        let path = parts.uri.path();
        let query = parts.uri.query();

        let authorized = match self
            .api
            .pre_authorize(&parts.method, path, query, &parts.headers)
            .await?
        {
            Authorization::Authorized(response) => response,
            Authorization::Rejected(response) => return Ok(Forwarded::Rejected(response)),
        };

        let (opts, verifier) = self.preparer.prepare(&authorized)?;
        let mut processor = SavedFileTracker::new(
            route,
            self.signer.clone(),
            self.hash_functions(&authorized),
        );
        let upload = UploadContext {
            ctx,
            clients: &self.clients,
            opts: &opts,
            verifier: verifier.as_deref(),
            max_files: self.max_files,
        };

        let outbound = match kind {
            UploadKind::Multipart => {
                let content_type = parts
                    .headers
                    .get(CONTENT_TYPE)
                    .and_then(|value| value.to_str().ok());
                let boundary = parse_boundary(content_type)?;
                let form = upload
                    .rewrite_multipart(body_stream(body), &boundary, &mut processor)
                    .await?;
                OutboundBody::Form(form.into_reqwest_form())
            }
            UploadKind::Body => {
                let size = parts
                    .headers
                    .get(CONTENT_LENGTH)
                    .and_then(|value| value.to_str().ok())
                    .and_then(|value| value.parse::<i64>().ok())
                    .unwrap_or(-1);
                let form = upload
                    .save_body(body_stream(body), size, &mut processor)
                    .await?;
                OutboundBody::Urlencoded(form.into_pairs())
            }
        };

        let mut headers = proxy_headers(&parts.headers);
        processor.finalize(&mut headers).await?;

        let response = self
            .api
            .forward(parts.method.clone(), path, query, headers, outbound)
            .await?;

        tracing::info!(
            status = response.status().as_u16(),
            files = processor.rewritten_fields().len(),
            "Upload forwarded"
        );
        Ok(Forwarded::Backend(response))
    }

    fn hash_functions(&self, response: &AuthorizeResponse) -> Option<Vec<String>> {
        if !response.upload_hash_functions.is_empty() {
            Some(response.upload_hash_functions.clone())
        } else if self.hash_fields {
            Some(Vec::new())
        } else {
            None
        }
    }
}

/// Data frames of a request body; trailers are dropped
fn body_stream<B>(
    body: B,
) -> impl Stream<Item = Result<Bytes, BoxError>> + Send + 'static
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError> + 'static,
{
    BodyStream::new(body)
        .map_err(|e| -> BoxError { e.into() })
        .try_filter_map(|frame| futures::future::ready(Ok(frame.into_data().ok())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upload::DefaultPreparer;
    use std::time::Duration;

    fn accelerator(hash_fields: bool) -> Accelerator {
        let api = ApiClient::new("http://127.0.0.1:1", Duration::from_secs(1), None).unwrap();
        Accelerator::new(
            Arc::new(api),
            Arc::new(ObjectStoreClients::default()),
            Box::new(DefaultPreparer::new(None, Duration::from_secs(60))),
            None,
        )
        .with_hash_fields(hash_fields)
    }

    #[test]
    fn test_hash_functions_selection() {
        let response = AuthorizeResponse::default();
        assert_eq!(accelerator(false).hash_functions(&response), None);
        assert_eq!(accelerator(true).hash_functions(&response), Some(vec![]));

        let response = AuthorizeResponse {
            upload_hash_functions: vec!["sha1".into()],
            ..Default::default()
        };
        assert_eq!(
            accelerator(false).hash_functions(&response),
            Some(vec!["sha1".to_string()])
        );
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_bad_gateway() {
        let request = Request::builder()
            .method("POST")
            .uri("/upload")
            .body(http_body_util::Full::new(Bytes::from_static(b"data")))
            .unwrap();

        let response = accelerator(false)
            .handle(request, UploadKind::Body, "upload")
            .await;
        assert_eq!(response.status(), hyper::StatusCode::BAD_GATEWAY);
    }
}
