//! Configuration module for Hayate
//!
//! Handles loading and parsing of YAML configuration files with support for
//! environment variable expansion and validation.
//!
//! # Example
//!
//! ```yaml
//! server:
//!   address: "0.0.0.0:8181"
//! backend:
//!   url: "http://127.0.0.1:8080"
//!   jwt_secret: "${UPLOAD_JWT_SECRET}"
//! upload:
//!   temp_dir: "/var/tmp/hayate"
//!   routes:
//!     - name: attachments
//!       path: "^/api/v4/projects/[0-9]+/uploads$"
//!       kind: multipart
//!     - name: lfs
//!       method: PUT
//!       path: "^/.+\\.git/gitlab-lfs/objects/[0-9a-f]{64}/[0-9]+$"
//!       kind: body
//! metrics:
//!   enabled: true
//!   port: 9090
//! logging:
//!   level: info
//!   format: json
//! ```

use crate::upload::UploadKind;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

mod loader;

pub use loader::{expand_env_vars, ConfigLoader};

/// Validate that a URL starts with http:// or https://
fn is_valid_http_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub backend: BackendConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        ConfigLoader::load(path)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.address.parse::<SocketAddr>().map_err(|e| {
            ConfigError::ValidationError(format!(
                "Invalid server address '{}': {}",
                self.server.address, e
            ))
        })?;

        if !is_valid_http_url(&self.backend.url) {
            return Err(ConfigError::ValidationError(
                "Invalid backend url: must start with http:// or https://".into(),
            ));
        }

        if self.backend.jwt_secret.as_deref() == Some("") {
            return Err(ConfigError::ValidationError(
                "backend.jwt_secret cannot be empty when set".into(),
            ));
        }

        if self.upload.pipe_buffer_size == 0 {
            return Err(ConfigError::ValidationError(
                "upload.pipe_buffer_size must be greater than 0".into(),
            ));
        }

        for route in &self.upload.routes {
            if route.path.is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "Route '{}' has an empty path",
                    route.display_name()
                )));
            }
            if let Err(e) = regex_lite::Regex::new(&route.path) {
                return Err(ConfigError::ValidationError(format!(
                    "Route '{}' has an invalid path pattern: {}",
                    route.display_name(),
                    e
                )));
            }
            if route.method.parse::<hyper::Method>().is_err() {
                return Err(ConfigError::ValidationError(format!(
                    "Route '{}' has an invalid method '{}'",
                    route.display_name(),
                    route.method
                )));
            }
        }

        match self.logging.level.to_ascii_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            level => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log level '{}': must be trace, debug, info, warn or error",
                    level
                )))
            }
        }

        Ok(())
    }
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub address: String,
}

/// Application backend configuration
#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    /// Base URL every request is forwarded to
    pub url: String,

    /// HS256 secret for API request and field manifest tokens
    #[serde(default)]
    pub jwt_secret: Option<String>,

    /// Pre-authorization timeout. Default: 30
    #[serde(default = "default_backend_timeout")]
    pub timeout_seconds: u64,
}

impl BackendConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

fn default_backend_timeout() -> u64 {
    30
}

/// Upload configuration
#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    /// Local temp directory used when the backend names none
    #[serde(default)]
    pub temp_dir: Option<PathBuf>,

    /// Upload deadline when the backend names none. Default: 14400 (4h)
    #[serde(default = "default_upload_timeout")]
    pub default_timeout_seconds: u64,

    /// File parts accepted per request, 0 for no limit. Default: 10
    #[serde(default = "default_max_files")]
    pub max_files: usize,

    /// Emit digest fields for every saved file. Default: true
    #[serde(default = "default_hash_fields")]
    pub hash_fields: bool,

    /// Capacity of the channel feeding each remote upload. Default: 64 KiB
    #[serde(default = "default_pipe_buffer_size")]
    pub pipe_buffer_size: usize,

    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

impl UploadConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_seconds)
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            temp_dir: None,
            default_timeout_seconds: default_upload_timeout(),
            max_files: default_max_files(),
            hash_fields: default_hash_fields(),
            pipe_buffer_size: default_pipe_buffer_size(),
            routes: Vec::new(),
        }
    }
}

fn default_upload_timeout() -> u64 {
    14400
}

fn default_max_files() -> usize {
    10
}

fn default_hash_fields() -> bool {
    true
}

fn default_pipe_buffer_size() -> usize {
    65536 // 64KB
}

/// An accelerated upload route
#[derive(Debug, Clone, Deserialize)]
pub struct RouteConfig {
    /// Label used in logs and metrics; defaults to the path pattern
    #[serde(default)]
    pub name: Option<String>,

    /// Default: POST
    #[serde(default = "default_route_method")]
    pub method: String,

    /// Regular expression matched against the request path
    pub path: String,

    pub kind: UploadKind,
}

impl RouteConfig {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.path)
    }
}

fn default_route_method() -> String {
    "POST".to_string()
}

/// Metrics configuration
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            port: default_metrics_port(),
        }
    }
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_metrics_port() -> u16 {
    9090
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Default: info. `RUST_LOG` takes precedence.
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        Config {
            server: ServerConfig {
                address: "127.0.0.1:8181".into(),
            },
            backend: BackendConfig {
                url: "http://127.0.0.1:8080".into(),
                jwt_secret: None,
                timeout_seconds: default_backend_timeout(),
            },
            upload: UploadConfig::default(),
            metrics: MetricsConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    #[test]
    fn test_defaults() {
        let upload = UploadConfig::default();
        assert_eq!(upload.default_timeout(), Duration::from_secs(4 * 60 * 60));
        assert_eq!(upload.max_files, 10);
        assert!(upload.hash_fields);
        assert_eq!(upload.pipe_buffer_size, 65536);
        assert_eq!(LoggingConfig::default().format, LogFormat::Text);
    }

    #[test]
    fn test_valid_config() {
        assert!(test_config().validate().is_ok());
    }

    #[test]
    fn test_invalid_backend_url() {
        let mut config = test_config();
        config.backend.url = "127.0.0.1:8080".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_address() {
        let mut config = test_config();
        config.server.address = "invalid".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_route_pattern() {
        let mut config = test_config();
        config.upload.routes.push(RouteConfig {
            name: None,
            method: "POST".into(),
            path: "^/uploads(".into(),
            kind: UploadKind::Multipart,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_jwt_secret_rejected() {
        let mut config = test_config();
        config.backend.jwt_secret = Some(String::new());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_routes() {
        let yaml = r#"
server:
  address: "127.0.0.1:0"
backend:
  url: "http://backend"
upload:
  routes:
    - path: "^/uploads$"
      kind: multipart
    - name: lfs
      method: PUT
      path: "^/lfs/.+$"
      kind: body
logging:
  format: json
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.upload.routes.len(), 2);
        assert_eq!(config.upload.routes[0].method, "POST");
        assert_eq!(config.upload.routes[0].display_name(), "^/uploads$");
        assert_eq!(config.upload.routes[1].kind, UploadKind::Body);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.backend.timeout(), Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }
}
