//! # Configuration
//!
//! Configuration surface consumed by the dispatch engine.
//!
//! Every knob has a serde mapping and a sensible default, so a config file
//! can specify only the sections it cares about.

use crate::ratelimit::RateRule;
use serde::Deserialize;
use std::net::SocketAddr;
use std::time::Duration;

/// Top-level server configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind the server to
    pub address: SocketAddr,
    /// Enable keep-alive connections
    pub keep_alive: bool,
    /// Shutdown timeout for graceful shutdown, in milliseconds
    pub shutdown_timeout_ms: u64,
    /// Request body limits
    pub body: BodyConfig,
    /// WebSocket message limits
    pub message: MessageConfig,
    /// Rate-limit rules, checked in order for every request
    pub rate_limits: Vec<RateRule>,
    /// Route-resolution and file cache settings
    pub cache: CacheConfig,
    /// Reverse-proxy client identity settings
    pub proxy: ProxyConfig,
    /// CORS settings
    pub cors: CorsConfig,
    /// Compression negotiation settings
    pub compression: CompressionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: ([127, 0, 0, 1], 8000).into(),
            keep_alive: true,
            shutdown_timeout_ms: 30_000,
            body: BodyConfig::default(),
            message: MessageConfig::default(),
            rate_limits: Vec::new(),
            cache: CacheConfig::default(),
            proxy: ProxyConfig::default(),
            cors: CorsConfig::default(),
            compression: CompressionConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Graceful shutdown timeout as a [`Duration`]
    #[must_use]
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

/// Request body limits
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BodyConfig {
    /// Max request body size in bytes
    pub max_size: usize,
}

impl Default for BodyConfig {
    fn default() -> Self {
        Self {
            max_size: 5 * 1024 * 1024,
        }
    }
}

/// WebSocket message limits
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MessageConfig {
    /// Max WebSocket message size in bytes
    pub max_size: usize,
}

impl Default for MessageConfig {
    fn default() -> Self {
        Self {
            max_size: 1024 * 1024,
        }
    }
}

/// Route-resolution / file cache settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Whether the resolved-route and file caches participate at all
    pub enabled: bool,
    /// Max item count before the store is wiped (0 means unbounded)
    pub limit: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            limit: 1024,
        }
    }
}

/// Reverse-proxy client identity settings
///
/// When enabled, the client IP used for rate-limit keys is taken from the
/// configured header (first value on a comma-separated list) instead of the
/// socket peer address.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Whether to trust the proxy header
    pub enabled: bool,
    /// Header carrying the original client address
    pub header: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            header: "x-forwarded-for".to_string(),
        }
    }
}

/// CORS settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CorsConfig {
    /// Whether CORS headers and OPTIONS short-circuiting are active
    pub enabled: bool,
    /// `Access-Control-Allow-Origin` value
    pub allow_origin: String,
    /// `Access-Control-Allow-Methods` value
    pub allow_methods: String,
    /// `Access-Control-Allow-Headers` value
    pub allow_headers: String,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            allow_origin: "*".to_string(),
            allow_methods: "GET, POST, PUT, DELETE, PATCH, OPTIONS".to_string(),
            allow_headers: "Content-Type, Authorization".to_string(),
        }
    }
}

/// Compression negotiation settings
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    /// Algorithm tokens ("br", "gzip", "deflate") that must never be selected
    pub disabled: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.address.port(), 8000);
        assert!(config.keep_alive);
        assert_eq!(config.body.max_size, 5 * 1024 * 1024);
        assert!(config.cache.enabled);
        assert!(!config.cors.enabled);
        assert!(config.rate_limits.is_empty());
    }

    #[test]
    fn test_config_partial_deserialize() {
        let config: ServerConfig = serde_json::from_str(
            r#"{
                "body": { "max_size": 1000 },
                "cors": { "enabled": true, "allow_origin": "https://example.com" }
            }"#,
        )
        .unwrap();
        assert_eq!(config.body.max_size, 1000);
        assert!(config.cors.enabled);
        assert_eq!(config.cors.allow_origin, "https://example.com");
        // untouched sections keep their defaults
        assert_eq!(config.message.max_size, 1024 * 1024);
        assert_eq!(config.proxy.header, "x-forwarded-for");
    }

    #[test]
    fn test_config_rate_rules_deserialize() {
        let config: ServerConfig = serde_json::from_str(
            r#"{
                "rate_limits": [
                    { "id": "api", "max_hits": 100, "window_ms": 60000, "penalty_ms": 10000 }
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(config.rate_limits.len(), 1);
        assert_eq!(config.rate_limits[0].id, "api");
        assert_eq!(config.rate_limits[0].max_hits, 100);
    }
}
