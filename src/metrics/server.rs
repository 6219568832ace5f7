//! Prometheus Metrics HTTP Server
//!
//! Serves `/metrics` on a separate listener so scrapes never compete with
//! proxied uploads.
//!
//! # Example
//!
//! ```no_run
//! use hayate::metrics::server::MetricsServer;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let shutdown = CancellationToken::new();
//!     let server = MetricsServer::builder().address("127.0.0.1:9090").build()?;
//!     let addr = server.start(shutdown.clone()).await?;
//!     println!("Metrics server listening on {}", addr);
//!     shutdown.cancel();
//!     Ok(())
//! }
//! ```

use bytes::Bytes;
use http_body_util::Full;
use hyper::header::CONTENT_TYPE;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{Encoder, TextEncoder};
use std::convert::Infallible;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Builder for MetricsServer
#[derive(Default)]
pub struct MetricsServerBuilder {
    address: Option<String>,
}

impl MetricsServerBuilder {
    /// Set the server address
    pub fn address(mut self, address: &str) -> Self {
        self.address = Some(address.to_string());
        self
    }

    /// Listen on all interfaces at `port`
    pub fn port(self, port: u16) -> Self {
        self.address(&format!("0.0.0.0:{}", port))
    }

    /// Build the MetricsServer
    pub fn build(self) -> Result<MetricsServer, MetricsServerError> {
        let address = self
            .address
            .ok_or_else(|| MetricsServerError::ConfigError("Address is required".into()))?;

        Ok(MetricsServer { address })
    }
}

/// Metrics server error
#[derive(Debug, thiserror::Error)]
pub enum MetricsServerError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Prometheus metrics HTTP server
pub struct MetricsServer {
    address: String,
}

impl MetricsServer {
    /// Create a builder for MetricsServer
    pub fn builder() -> MetricsServerBuilder {
        MetricsServerBuilder::default()
    }

    /// Bind and serve until `shutdown` is cancelled
    ///
    /// Returns the actual bound address (useful when using port 0)
    pub async fn start(&self, shutdown: CancellationToken) -> Result<SocketAddr, MetricsServerError> {
        let listener = TcpListener::bind(&self.address).await?;
        let addr = listener.local_addr()?;

        tracing::info!(address = %addr, "Metrics server listening");
        tokio::spawn(run_server(listener, shutdown));

        Ok(addr)
    }
}

async fn run_server(listener: TcpListener, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            result = listener.accept() => {
                match result {
                    Ok((stream, _)) => {
                        let io = TokioIo::new(stream);
                        tokio::spawn(async move {
                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service_fn(handle_request))
                                .await
                            {
                                tracing::debug!(error = %e, "Metrics connection error");
                            }
                        });
                    }
                    Err(e) => tracing::warn!(error = %e, "Metrics accept failed"),
                }
            }
        }
    }
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => metrics_handler(),
        _ => plain(StatusCode::NOT_FOUND, "text/plain", Bytes::from_static(b"Not Found")),
    };
    Ok(response)
}

fn metrics_handler() -> Response<Full<Bytes>> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();

    match encoder.encode(&prometheus::gather(), &mut buffer) {
        Ok(()) => plain(StatusCode::OK, encoder.format_type(), Bytes::from(buffer)),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode metrics");
            plain(
                StatusCode::INTERNAL_SERVER_ERROR,
                "text/plain",
                Bytes::from_static(b"Failed to encode metrics"),
            )
        }
    }
}

fn plain(status: StatusCode, content_type: &str, body: Bytes) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body));
    *response.status_mut() = status;
    if let Ok(value) = content_type.parse() {
        response.headers_mut().insert(CONTENT_TYPE, value);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_missing_address() {
        let result = MetricsServerBuilder::default().build();
        assert!(result.is_err());
    }

    #[test]
    fn test_builder_with_port() {
        let server = MetricsServer::builder().port(9090).build().unwrap();
        assert_eq!(server.address, "0.0.0.0:9090");
    }

    #[test]
    fn test_metrics_handler_encodes() {
        crate::metrics::record_request("metrics_test", 200);
        let response = metrics_handler();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
