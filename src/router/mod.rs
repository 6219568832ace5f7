//! Request router
//!
//! Decides, per request, whether it is a health check, an accelerated upload
//! or plain traffic for the backend. Upload routes are matched in
//! configuration order; the first match wins.

use crate::config::RouteConfig;
use crate::upload::UploadKind;
use hyper::Method;
use regex_lite::Regex;
use thiserror::Error;

/// Path answered locally with `ok`
pub const HEALTH_PATH: &str = "/health";

/// Router errors
#[derive(Error, Debug)]
pub enum RouterError {
    #[error("Invalid path pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Invalid method: {0}")]
    InvalidMethod(String),
}

/// A compiled upload route
#[derive(Debug, Clone)]
pub struct Route {
    name: String,
    method: Method,
    path: Regex,
    kind: UploadKind,
}

impl Route {
    pub fn new(name: &str, method: &str, pattern: &str, kind: UploadKind) -> Result<Self, RouterError> {
        let method = method
            .parse::<Method>()
            .map_err(|_| RouterError::InvalidMethod(method.to_string()))?;
        let path = Regex::new(pattern).map_err(|e| RouterError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            name: name.to_string(),
            method,
            path,
            kind,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> UploadKind {
        self.kind
    }

    fn matches(&self, method: &Method, path: &str) -> bool {
        self.method == method && self.path.is_match(path)
    }
}

/// Where a request goes
#[derive(Debug, Clone, Copy)]
pub enum RouteMatch<'a> {
    Health,
    Upload(&'a Route),
    Proxy,
}

impl RouteMatch<'_> {
    /// Label for logs and metrics
    pub fn label(&self) -> &str {
        match self {
            RouteMatch::Health => "health",
            RouteMatch::Upload(route) => route.name(),
            RouteMatch::Proxy => "proxy",
        }
    }
}

/// Ordered route table
#[derive(Debug, Clone, Default)]
pub struct Router {
    routes: Vec<Route>,
}

impl Router {
    /// Compile the configured routes
    pub fn new(routes: &[RouteConfig]) -> Result<Self, RouterError> {
        let routes = routes
            .iter()
            .map(|route| Route::new(route.display_name(), &route.method, &route.path, route.kind))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { routes })
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    /// Route a request
    pub fn route(&self, method: &Method, path: &str) -> RouteMatch<'_> {
        if path == HEALTH_PATH && method == Method::GET {
            return RouteMatch::Health;
        }

        self.routes
            .iter()
            .find(|route| route.matches(method, path))
            .map(RouteMatch::Upload)
            .unwrap_or(RouteMatch::Proxy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router() -> Router {
        Router::new(&[
            RouteConfig {
                name: Some("attachments".into()),
                method: "POST".into(),
                path: "^/api/v4/projects/[0-9]+/uploads$".into(),
                kind: UploadKind::Multipart,
            },
            RouteConfig {
                name: None,
                method: "PUT".into(),
                path: "^/lfs/objects/[0-9a-f]{64}/[0-9]+$".into(),
                kind: UploadKind::Body,
            },
        ])
        .unwrap()
    }

    #[test]
    fn test_health() {
        assert!(matches!(
            router().route(&Method::GET, "/health"),
            RouteMatch::Health
        ));
        assert!(matches!(
            router().route(&Method::POST, "/health"),
            RouteMatch::Proxy
        ));
    }

    #[test]
    fn test_upload_routes() {
        let router = router();

        let RouteMatch::Upload(route) = router.route(&Method::POST, "/api/v4/projects/12/uploads")
        else {
            panic!("expected an upload route");
        };
        assert_eq!(route.name(), "attachments");
        assert_eq!(route.kind(), UploadKind::Multipart);

        let oid = "a".repeat(64);
        let RouteMatch::Upload(route) = router.route(&Method::PUT, &format!("/lfs/objects/{}/5", oid))
        else {
            panic!("expected an upload route");
        };
        assert_eq!(route.kind(), UploadKind::Body);
        assert_eq!(route.name(), "^/lfs/objects/[0-9a-f]{64}/[0-9]+$");
    }

    #[test]
    fn test_method_must_match() {
        assert!(matches!(
            router().route(&Method::GET, "/api/v4/projects/12/uploads"),
            RouteMatch::Proxy
        ));
    }

    #[test]
    fn test_unmatched_path_is_proxied() {
        let router = router();
        let route = router.route(&Method::POST, "/api/v4/projects/12/issues");
        assert!(matches!(route, RouteMatch::Proxy));
        assert_eq!(route.label(), "proxy");
    }

    #[test]
    fn test_invalid_route() {
        assert!(matches!(
            Route::new("bad", "POST", "(", UploadKind::Body),
            Err(RouterError::InvalidPattern { .. })
        ));
        assert!(matches!(
            Route::new("bad", "NOT A METHOD", "^/$", UploadKind::Body),
            Err(RouterError::InvalidMethod(_))
        ));
    }
}
