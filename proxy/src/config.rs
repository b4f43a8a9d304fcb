//! Proxy configuration loaded from a JSON file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tonic::transport::Uri;

use crate::trust_domain::{TrustDomain, TrustDomainError};

const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 5;

/// Errors raised loading the proxy configuration.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read configuration file: {0}")]
    Read(#[from] std::io::Error),

    /// The configuration file is not valid JSON or misses fields.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    /// The configured trust domain name is invalid.
    #[error("invalid trust domain: {0}")]
    InvalidTrustDomain(#[from] TrustDomainError),

    /// The configured backend address is not a valid URI.
    #[error("invalid backend address: {0}")]
    InvalidBackend(#[from] http::uri::InvalidUri),
}

#[derive(Debug, Deserialize)]
struct ConfigFile {
    listen_socket_path: PathBuf,
    backend: String,
    #[serde(default)]
    authority_socket_path: Option<PathBuf>,
    trust_domain: String,
    #[serde(default = "default_request_timeout_secs")]
    request_timeout_secs: u64,
}

fn default_request_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

/// Validated proxy configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path of the Unix socket the proxy listens on.
    pub listen_socket_path: PathBuf,
    /// Address of the single backend all calls are forwarded to.
    pub backend: Uri,
    /// Path of the authority's admin Unix socket. When absent, the
    /// `AUTHORITY_ADMIN_ENDPOINT_SOCKET` environment variable is used.
    pub authority_socket_path: Option<PathBuf>,
    /// Trust domain the proxy and its backend belong to.
    pub trust_domain: TrustDomain,
    /// Per-call budget covering attestation, identity and bundle waits
    /// and the outbound dial.
    pub request_timeout: Duration,
}

impl Config {
    /// Loads and validates the configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read or parsed, or
    /// if the trust domain or backend address is invalid.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = serde_json::from_str(raw)?;
        Ok(Config {
            listen_socket_path: file.listen_socket_path,
            backend: file.backend.parse::<Uri>()?,
            authority_socket_path: file.authority_socket_path,
            trust_domain: TrustDomain::new(&file.trust_domain)?,
            request_timeout: Duration::from_secs(file.request_timeout_secs),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_config_parsed() {
        let config = Config::from_json(
            r#"{
                "listen_socket_path": "/run/proxy/proxy.sock",
                "backend": "https://backend.internal:50051",
                "authority_socket_path": "/run/authority/admin.sock",
                "trust_domain": "example.org",
                "request_timeout_secs": 2
            }"#,
        )
        .unwrap();

        assert_eq!(config.trust_domain.as_str(), "example.org");
        assert_eq!(config.request_timeout, Duration::from_secs(2));
        assert_eq!(
            config.authority_socket_path,
            Some(PathBuf::from("/run/authority/admin.sock"))
        );
    }

    #[test]
    fn test_request_timeout_defaults() {
        let config = Config::from_json(
            r#"{
                "listen_socket_path": "/run/proxy/proxy.sock",
                "backend": "https://backend.internal:50051",
                "trust_domain": "example.org"
            }"#,
        )
        .unwrap();

        assert_eq!(config.request_timeout, Duration::from_secs(5));
        assert_eq!(config.authority_socket_path, None);
    }

    #[test]
    fn test_invalid_trust_domain_rejected() {
        let result = Config::from_json(
            r#"{
                "listen_socket_path": "/run/proxy/proxy.sock",
                "backend": "https://backend.internal:50051",
                "trust_domain": "Example.Org"
            }"#,
        );
        assert!(matches!(result, Err(ConfigError::InvalidTrustDomain(_))));
    }

    #[test]
    fn test_invalid_backend_rejected() {
        let result = Config::from_json(
            r#"{
                "listen_socket_path": "/run/proxy/proxy.sock",
                "backend": "not a uri",
                "trust_domain": "example.org"
            }"#,
        );
        assert!(matches!(result, Err(ConfigError::InvalidBackend(_))));
    }
}
