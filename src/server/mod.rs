//! HTTP server module
//!
//! Accepts client connections and dispatches each request:
//!
//! * `GET /health` is answered locally with `ok`.
//! * Requests matching an upload route go through the
//!   [`Accelerator`](crate::upload::Accelerator).
//! * Everything else is streamed to the backend unchanged.
//!
//! # Example
//!
//! ```no_run
//! use hayate::config::Config;
//! use hayate::objectstore::ObjectStoreClients;
//! use hayate::server::Server;
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load("config.yaml")?;
//! let clients = Arc::new(ObjectStoreClients::new(config.upload.pipe_buffer_size)?);
//! let server = Server::bind(config, clients).await?;
//! println!("Listening on {}", server.local_addr());
//! server.run(CancellationToken::new()).await?;
//! # Ok(())
//! # }
//! ```

use crate::api::{
    full_body, proxy_headers, relay_response, status_response, ApiClient, ApiError, BoxError,
    OutboundBody, ResponseBody,
};
use crate::config::Config;
use crate::metrics;
use crate::objectstore::ObjectStoreClients;
use crate::router::{RouteMatch, Router, RouterError};
use crate::upload::{Accelerator, DefaultPreparer, Signer};
use bytes::Bytes;
use futures::TryStreamExt;
use http_body_util::BodyStream;
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Server errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Failed to bind to address: {0}")]
    BindError(String),

    #[error("Invalid route: {0}")]
    Route(#[from] RouterError),

    #[error("Backend client error: {0}")]
    Api(#[from] ApiError),
}

/// Shared per-process request state
struct AppState {
    router: Router,
    api: Arc<ApiClient>,
    accelerator: Accelerator,
}

/// HTTP Server
pub struct Server {
    state: Arc<AppState>,
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Server {
    /// Build the request pipeline from `config` and bind the listener
    ///
    /// Port 0 binds an OS-assigned port; see [`Server::local_addr`].
    pub async fn bind(config: Config, clients: Arc<ObjectStoreClients>) -> Result<Self, ServerError> {
        let addr: SocketAddr = config
            .server
            .address
            .parse()
            .map_err(|e| ServerError::BindError(format!("Invalid address: {}", e)))?;

        let signer = config
            .backend
            .jwt_secret
            .as_deref()
            .map(|secret| Arc::new(Signer::new_hs256(secret)));
        let api = Arc::new(ApiClient::new(
            &config.backend.url,
            config.backend.timeout(),
            signer.clone(),
        )?);
        let router = Router::new(&config.upload.routes)?;

        let preparer = DefaultPreparer::new(
            config.upload.temp_dir.clone(),
            config.upload.default_timeout(),
        );
        let accelerator = Accelerator::new(api.clone(), clients, Box::new(preparer), signer)
            .with_max_files(config.upload.max_files)
            .with_hash_fields(config.upload.hash_fields);

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::BindError(format!("Failed to bind to {}: {}", addr, e)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| ServerError::BindError(format!("Failed to get local address: {}", e)))?;

        info!(
            address = %local_addr,
            backend = %api.backend(),
            routes = router.routes().len(),
            "Server bound"
        );

        Ok(Self {
            state: Arc::new(AppState {
                router,
                api,
                accelerator,
            }),
            listener,
            local_addr,
        })
    }

    /// The address the server is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept connections until `shutdown` is cancelled
    ///
    /// Each connection is served on its own task; connections already in
    /// flight finish on their own.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), ServerError> {
        info!(address = %self.local_addr, "Starting server");

        loop {
            let (stream, peer_addr) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                        continue;
                    }
                },
            };

            let state = Arc::clone(&self.state);
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(move |req| {
                    let state = Arc::clone(&state);
                    async move { handle_request(req, state).await }
                });

                if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                    warn!(peer = %peer_addr, error = %e, "Error serving connection");
                }
            });
        }

        info!("Shutting down server");
        Ok(())
    }
}

async fn handle_request(
    req: Request<Incoming>,
    state: Arc<AppState>,
) -> Result<Response<ResponseBody>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let route = state.router.route(&method, &path);
    let label = route.label().to_string();

    let response = match route {
        RouteMatch::Health => health(),
        RouteMatch::Upload(upload) => {
            info!(method = %method, path = %path, route = %label, "Accelerating upload");
            state.accelerator.handle(req, upload.kind(), upload.name()).await
        }
        RouteMatch::Proxy => proxy(&state.api, req).await,
    };

    metrics::record_request(&label, response.status().as_u16());
    Ok(response)
}

fn health() -> Response<ResponseBody> {
    let mut response = Response::new(full_body(Bytes::from_static(b"ok")));
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response
}

/// Stream a request to the backend and its response back
async fn proxy(api: &ApiClient, req: Request<Incoming>) -> Response<ResponseBody> {
    let (parts, body) = req.into_parts();
    let body = BodyStream::new(body)
        .map_err(BoxError::from)
        .try_filter_map(|frame| futures::future::ready(Ok(frame.into_data().ok())));

    let result = api
        .forward(
            parts.method.clone(),
            parts.uri.path(),
            parts.uri.query(),
            proxy_headers(&parts.headers),
            OutboundBody::Stream(reqwest::Body::wrap_stream(body)),
        )
        .await;

    match result {
        Ok(response) => relay_response(response, None),
        Err(e) => {
            error!(path = %parts.uri.path(), error = %e, "Backend request failed");
            status_response(StatusCode::BAD_GATEWAY)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendConfig, LoggingConfig, MetricsConfig, ServerConfig, UploadConfig};

    fn test_config() -> Config {
        Config {
            server: ServerConfig {
                address: "127.0.0.1:0".into(),
            },
            backend: BackendConfig {
                url: "http://127.0.0.1:8080".into(),
                jwt_secret: None,
                timeout_seconds: 30,
            },
            upload: UploadConfig::default(),
            metrics: MetricsConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    #[tokio::test]
    async fn test_server_bind() {
        let server = Server::bind(test_config(), Arc::new(ObjectStoreClients::default()))
            .await
            .unwrap();
        assert_ne!(server.local_addr().port(), 0);
    }

    #[tokio::test]
    async fn test_server_invalid_address() {
        let mut config = test_config();
        config.server.address = "invalid".into();
        let result = Server::bind(config, Arc::new(ObjectStoreClients::default())).await;
        assert!(matches!(result, Err(ServerError::BindError(_))));
    }

    #[tokio::test]
    async fn test_server_invalid_backend() {
        let mut config = test_config();
        config.backend.url = "ftp://backend".into();
        let result = Server::bind(config, Arc::new(ObjectStoreClients::default())).await;
        assert!(matches!(result, Err(ServerError::Api(_))));
    }
}
