//! # Error Handling
//!
//! Centralized error types for the portico core.
//! Uses `thiserror` for ergonomic error definitions.
//!
//! Every pipeline phase normalizes its failure into one of these variants;
//! the lifecycle controller never lets a phase error propagate past the
//! event dispatcher (see `events`).

use thiserror::Error;

/// Result type alias for portico operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for the portico runtime
#[derive(Error, Debug)]
pub enum Error {
    /// Server failed to bind to the specified address
    #[error("Failed to bind server to {address}: {source}")]
    Bind {
        /// The address we tried to bind to
        address: String,
        /// The underlying IO error
        #[source]
        source: std::io::Error,
    },

    /// Invalid route pattern provided at registration time
    #[error("Invalid route pattern: {pattern}: {reason}")]
    InvalidRoutePattern {
        /// The invalid pattern
        pattern: String,
        /// Reason for invalidity
        reason: String,
    },

    /// Request body or WebSocket message exceeds the configured maximum
    #[error("Payload too large: limit={limit} bytes, received={actual} bytes")]
    PayloadTooLarge {
        /// Max allowed size
        limit: usize,
        /// Actual size
        actual: usize,
    },

    /// A rate-limit counter exceeded its maximum within the window
    #[error("Rate limit exceeded for {key} (rule {rule})")]
    RateLimited {
        /// Identity the counter is keyed on
        key: String,
        /// Identifier of the rule that tripped
        rule: String,
    },

    /// A middleware failed while running
    #[error("Middleware error: {0}")]
    Middleware(String),

    /// A validator failed while running
    #[error("Validator error: {0}")]
    Validator(String),

    /// A route handler (or deferred response task) failed while running
    #[error("Handler error: {0}")]
    Handler(String),

    /// The `on_upgrade` gate refused the WebSocket handshake
    #[error("WebSocket upgrade rejected: {reason}")]
    UpgradeRejected {
        /// Why the handshake was refused
        reason: String,
    },

    /// WebSocket frame transport failure
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// HTTP protocol error
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Shorthand for a handler-phase failure with a plain message
    pub fn handler(msg: impl Into<String>) -> Self {
        Self::Handler(msg.into())
    }

    /// Shorthand for a middleware-phase failure with a plain message
    pub fn middleware(msg: impl Into<String>) -> Self {
        Self::Middleware(msg.into())
    }

    /// Shorthand for a validator-phase failure with a plain message
    pub fn validator(msg: impl Into<String>) -> Self {
        Self::Validator(msg.into())
    }
}
