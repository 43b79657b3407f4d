//! # Portico
//!
//! Embeddable HTTP/WebSocket application server.
//! Provides registration-order routing, a per-request lifecycle with
//! deferred response writing, rate limiting with penalty windows, and
//! WebSocket sessions that share one context across their callbacks.
//!
//! ## Architecture
//!
//! The crate centers on a dispatch engine: requests resolve against the
//! route table (through a wipe-on-limit cache), then flow through
//! middleware, validators, and the handler, with every failure branch
//! routed to a lifecycle event and its built-in fallback.
//!
//! ## Modules
//!
//! - `server` - Accept loop, registration API, graceful shutdown
//! - `pipeline` - Request lifecycle controller and shared engine state
//! - `ws` - WebSocket handshake and session loop
//! - `route` - Route definitions, handler types, static mounts
//! - `matcher` - Path patterns with `{param}` and regex segments
//! - `context` - Per-request context and the deferred task queue
//! - `events` - Lifecycle events with built-in fallback responses
//! - `ratelimit` - Windowed rate limiter with penalty extension
//! - `cache` - Bounded wipe-on-limit store
//! - `static_files` - Mount resolution behind a filesystem trait
//! - `encoding` - `Accept-Encoding` negotiation
//! - `config` - Serde-backed server configuration
//! - `error` - Error types and handling

pub mod cache;
pub mod config;
pub mod context;
pub mod encoding;
pub mod error;
pub mod events;
pub mod matcher;
mod pipeline;
pub mod ratelimit;
pub mod registry;
pub mod route;
pub mod server;
pub mod static_files;
mod ws;

pub use cache::BoundedCache;
pub use config::ServerConfig;
pub use context::{Context, ResponseDraft, TaskPhase};
pub use encoding::{negotiate, Compressor, ContentEncoding};
pub use error::{Error, Result};
pub use events::{event_handler, EventDispatcher, EventHandler, EventKind, EventPayload};
pub use matcher::{CompiledPath, Params};
pub use ratelimit::{RateDecision, RateKey, RateLimiter, RateRule, Transport};
pub use registry::{RouteRegistry, RouteSelector, RouteTable, WsRouteSelector};
pub use route::{
    handler, message_handler, middleware_fn, validator_fn, ContextSeed, Flow, Handler,
    HandlerFuture, Method, Middleware, Route, StaticMount, StaticOptions, Validator, WsRoute,
};
pub use server::Server;
pub use static_files::{ContentTypeGuess, FileSystem, TokioFileSystem};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize structured logging from the `RUST_LOG` environment variable
///
/// Safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert_eq!(VERSION, "0.1.0");
    }
}
