//! Backend HTTP client
//!
//! Sends pre-authorization calls and forwards (rewritten) requests to the
//! application backend, and turns backend responses into hyper responses
//! that stream back to the client.

use super::{ApiError, AuthorizeResponse};
use crate::upload::signer::{Signer, API_REQUEST_HEADER};
use bytes::Bytes;
use futures::StreamExt;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::Frame;
use hyper::header::{HeaderMap, HeaderName, CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, HOST};
use hyper::{Method, Response, StatusCode};
use reqwest::Url;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::DropGuard;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Body type of every response the proxy sends
pub type ResponseBody = UnsyncBoxBody<Bytes, BoxError>;

/// Headers that describe a single connection and must not be forwarded
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
];

/// Outcome of a pre-authorization call
pub enum Authorization {
    /// The backend accepted the upload and said where to store it
    Authorized(Box<AuthorizeResponse>),
    /// The backend refused; its response goes back to the client as-is
    Rejected(reqwest::Response),
}

/// Request body sent to the backend
pub enum OutboundBody {
    /// Streamed through untouched
    Stream(reqwest::Body),
    /// Rewritten `multipart/form-data`
    Form(reqwest::multipart::Form),
    /// Rewritten `application/x-www-form-urlencoded`
    Urlencoded(Vec<(String, String)>),
}

/// Backend API client
pub struct ApiClient {
    http: reqwest::Client,
    backend: Url,
    authorize_timeout: Duration,
    signer: Option<Arc<Signer>>,
}

impl ApiClient {
    /// Create a client for the backend at `backend`
    pub fn new(
        backend: &str,
        authorize_timeout: Duration,
        signer: Option<Arc<Signer>>,
    ) -> Result<Self, ApiError> {
        let backend = Url::parse(backend).map_err(|e| ApiError::InvalidUrl(e.to_string()))?;
        if !matches!(backend.scheme(), "http" | "https") {
            return Err(ApiError::InvalidUrl(format!(
                "unsupported scheme '{}'",
                backend.scheme()
            )));
        }

        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(authorize_timeout)
            .build()?;

        Ok(Self {
            http,
            backend,
            authorize_timeout,
            signer,
        })
    }

    pub fn backend(&self) -> &Url {
        &self.backend
    }

    fn backend_url(&self, path: &str, query: Option<&str>) -> Url {
        let mut url = self.backend.clone();
        let base = url.path().trim_end_matches('/').to_string();
        url.set_path(&format!("{}{}", base, path));
        url.set_query(query);
        url
    }

    /// Ask the backend whether (and where) this upload may be stored
    ///
    /// The call goes to `<path>/authorize` with the client's headers and an
    /// empty body.
    #[tracing::instrument(
        name = "api.authorize",
        skip(self, query, headers),
        fields(http.method = %method, http.path = %path, http.status_code = tracing::field::Empty),
        err
    )]
    pub async fn pre_authorize(
        &self,
        method: &Method,
        path: &str,
        query: Option<&str>,
        headers: &HeaderMap,
    ) -> Result<Authorization, ApiError> {
        let url = self.backend_url(&format!("{}/authorize", path.trim_end_matches('/')), query);

        let mut headers = proxy_headers(headers);
        headers.remove(CONTENT_LENGTH);
        headers.remove(CONTENT_TYPE);

        let mut request = self
            .http
            .request(method.clone(), url)
            .headers(headers)
            .timeout(self.authorize_timeout);

        if let Some(signer) = &self.signer {
            let token = signer
                .sign_api_request()
                .map_err(|e| ApiError::Signing(e.to_string()))?;
            request = request.header(API_REQUEST_HEADER, token);
        }

        let response = request.send().await?;
        let status = response.status();
        tracing::Span::current().record("http.status_code", status.as_u16());

        if !status.is_success() {
            tracing::info!(status = status.as_u16(), "Backend rejected upload");
            return Ok(Authorization::Rejected(response));
        }

        let body = response.bytes().await?;
        let authorized: AuthorizeResponse = serde_json::from_slice(&body)
            .map_err(|e| ApiError::InvalidResponse(e.to_string()))?;

        Ok(Authorization::Authorized(Box::new(authorized)))
    }

    /// Send a request to the backend
    ///
    /// `headers` should already have gone through [`proxy_headers`]. For
    /// rewritten bodies the content headers are replaced.
    #[tracing::instrument(
        name = "api.forward",
        skip(self, query, headers, body),
        fields(http.method = %method, http.path = %path),
        err
    )]
    pub async fn forward(
        &self,
        method: Method,
        path: &str,
        query: Option<&str>,
        mut headers: HeaderMap,
        body: OutboundBody,
    ) -> Result<reqwest::Response, ApiError> {
        let url = self.backend_url(path, query);

        let request = match body {
            OutboundBody::Stream(body) => self.http.request(method, url).headers(headers).body(body),
            OutboundBody::Form(form) => {
                headers.remove(CONTENT_LENGTH);
                headers.remove(CONTENT_TYPE);
                self.http.request(method, url).headers(headers).multipart(form)
            }
            OutboundBody::Urlencoded(fields) => {
                headers.remove(CONTENT_LENGTH);
                headers.remove(CONTENT_TYPE);
                self.http.request(method, url).headers(headers).form(&fields)
            }
        };

        Ok(request.send().await?)
    }
}

/// Copy request headers for forwarding, dropping hop-by-hop headers and `Host`
pub fn proxy_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = headers.clone();
    strip_hop_by_hop(&mut out);
    out.remove(HOST);
    out
}

/// Remove hop-by-hop headers, including any the `Connection` header names
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

/// Stream a backend response back to the client
///
/// `guard` is held until the body has been fully sent or dropped, which is
/// what releases cleanup of the objects this request stored.
pub fn relay_response(response: reqwest::Response, guard: Option<DropGuard>) -> Response<ResponseBody> {
    let status = response.status();
    let mut headers = response.headers().clone();
    strip_hop_by_hop(&mut headers);

    let stream = response.bytes_stream().map(move |chunk| {
        let _held = &guard;
        chunk.map(Frame::data).map_err(BoxError::from)
    });

    let mut relayed = Response::new(StreamBody::new(stream).boxed_unsync());
    *relayed.status_mut() = status;
    *relayed.headers_mut() = headers;
    relayed
}

/// Buffered response body
pub fn full_body(bytes: impl Into<Bytes>) -> ResponseBody {
    Full::new(bytes.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// Plain-text response carrying only the status reason
pub fn status_response(status: StatusCode) -> Response<ResponseBody> {
    let reason = status.canonical_reason().unwrap_or("Error");
    let mut response = Response::new(full_body(format!("{}\n", reason)));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}
