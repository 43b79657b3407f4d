//! # Route Records
//!
//! Route definitions for HTTP, WebSocket and static-file serving, plus the
//! function types every pipeline stage is built from.
//!
//! Handlers, middleware and validators all receive the per-connection
//! [`Context`] by mutable reference and return boxed futures; middleware and
//! validators additionally signal [`Flow::End`] to short-circuit the rest of
//! the chain. Routes are immutable after registration.

use crate::context::Context;
use crate::error::Result;
use crate::matcher::{CompiledPath, Params};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use tokio_tungstenite::tungstenite::Message;

/// HTTP methods supported by the router
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// HTTP GET
    Get,
    /// HTTP POST
    Post,
    /// HTTP PUT
    Put,
    /// HTTP DELETE
    Delete,
    /// HTTP PATCH
    Patch,
    /// HTTP HEAD
    Head,
    /// HTTP OPTIONS
    Options,
}

impl Method {
    /// Map from a hyper method; unknown methods fall back to GET
    #[must_use]
    pub fn from_hyper(method: &hyper::Method) -> Self {
        match *method {
            hyper::Method::POST => Self::Post,
            hyper::Method::PUT => Self::Put,
            hyper::Method::DELETE => Self::Delete,
            hyper::Method::PATCH => Self::Patch,
            hyper::Method::HEAD => Self::Head,
            hyper::Method::OPTIONS => Self::Options,
            _ => Self::Get,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Get => write!(f, "GET"),
            Self::Post => write!(f, "POST"),
            Self::Put => write!(f, "PUT"),
            Self::Delete => write!(f, "DELETE"),
            Self::Patch => write!(f, "PATCH"),
            Self::Head => write!(f, "HEAD"),
            Self::Options => write!(f, "OPTIONS"),
        }
    }
}

/// Control signal returned by middleware and validators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Proceed to the next stage
    Continue,
    /// Short-circuit: skip remaining middleware/validators and the handler.
    /// Already-queued response tasks still drain.
    End,
}

/// Boxed future returned by handlers and deferred tasks
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

/// Boxed future returned by middleware and validators
pub type FlowFuture<'a> = Pin<Box<dyn Future<Output = Result<Flow>> + Send + 'a>>;

/// Route handler: owns the final say on the response draft
pub type Handler = Arc<dyn for<'a> Fn(&'a mut Context) -> HandlerFuture<'a> + Send + Sync>;

/// Cross-cutting middleware, run in registration order before validators
pub type Middleware = Arc<dyn for<'a> Fn(&'a mut Context) -> FlowFuture<'a> + Send + Sync>;

/// Per-route guard, run after middleware and before the handler
pub type Validator = Arc<dyn for<'a> Fn(&'a mut Context) -> FlowFuture<'a> + Send + Sync>;

/// WebSocket message handler
pub type MessageHandler =
    Arc<dyn for<'a> Fn(&'a mut Context, &'a Message) -> HandlerFuture<'a> + Send + Sync>;

/// Wrap a closure as a [`Handler`]
pub fn handler<F>(f: F) -> Handler
where
    F: for<'a> Fn(&'a mut Context) -> HandlerFuture<'a> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Wrap a closure as a [`Middleware`]
pub fn middleware_fn<F>(f: F) -> Middleware
where
    F: for<'a> Fn(&'a mut Context) -> FlowFuture<'a> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Wrap a closure as a [`Validator`]
pub fn validator_fn<F>(f: F) -> Validator
where
    F: for<'a> Fn(&'a mut Context) -> FlowFuture<'a> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Wrap a closure as a [`MessageHandler`]
pub fn message_handler<F>(f: F) -> MessageHandler
where
    F: for<'a> Fn(&'a mut Context, &'a Message) -> HandlerFuture<'a> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Initial custom-context value attached to a route
///
/// `PerCall` hands every invocation a fresh copy; `Shared` keeps one mutable
/// value alive across invocations.
#[derive(Debug, Clone, Default)]
pub enum ContextSeed {
    /// No initial value (handlers start from JSON null)
    #[default]
    None,
    /// Fresh-copied into each context
    PerCall(Value),
    /// One persistent value, shared across invocations
    Shared(Arc<Mutex<Value>>),
}

/// A registered HTTP route
///
/// Immutable after registration; created during route-table assembly and
/// read-only while serving.
pub struct Route {
    /// Method this route answers
    pub method: Method,
    /// Compiled path pattern
    pub path: CompiledPath,
    /// Ordered per-route guards
    pub validators: Vec<Validator>,
    /// Headers forced onto every response from this route
    pub headers: HashMap<String, String>,
    /// The handler function
    pub handler: Handler,
    /// Initial custom-context value
    pub seed: ContextSeed,
}

impl Route {
    /// Create a route from a literal-form pattern
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidRoutePattern`] if the pattern does not
    /// compile.
    pub fn new(method: Method, pattern: &str, handler: Handler) -> Result<Self> {
        Ok(Self {
            method,
            path: CompiledPath::compile(pattern)?,
            validators: Vec::new(),
            headers: HashMap::new(),
            handler,
            seed: ContextSeed::None,
        })
    }

    /// Create a route from a regex-form pattern matched after `prefix`
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidRoutePattern`] if the expression does
    /// not compile.
    pub fn new_regex(method: Method, pattern: &str, prefix: &str, handler: Handler) -> Result<Self> {
        Ok(Self {
            method,
            path: CompiledPath::compile_regex(pattern, prefix)?,
            validators: Vec::new(),
            headers: HashMap::new(),
            handler,
            seed: ContextSeed::None,
        })
    }

    /// Append a per-route validator
    #[must_use]
    pub fn with_validator(mut self, validator: Validator) -> Self {
        self.validators.push(validator);
        self
    }

    /// Force a response header on every invocation
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Attach an initial custom-context value
    #[must_use]
    pub fn with_seed(mut self, seed: ContextSeed) -> Self {
        self.seed = seed;
        self
    }

    /// Match a request against this route (method first, then path)
    #[must_use]
    pub fn matches(&self, method: Method, path: &str, segments: &[&str]) -> Option<Params> {
        if self.method != method {
            return None;
        }
        self.path.matches(path, segments)
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("method", &self.method)
            .field("path", &self.path.pattern())
            .field("validators", &self.validators.len())
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// A registered WebSocket route
///
/// Same path-matching shape as HTTP routes, with up to three lifecycle
/// handlers and an optional upgrade gate run before the handshake completes.
pub struct WsRoute {
    /// Compiled path pattern
    pub path: CompiledPath,
    /// Runs once after the handshake completes
    pub on_open: Option<Handler>,
    /// Runs for every inbound message
    pub on_message: Option<MessageHandler>,
    /// Runs exactly once at teardown, even after earlier phase errors
    pub on_close: Option<Handler>,
    /// Gate run with the HTTP context before the upgrade; `Flow::End` or an
    /// error refuses the handshake
    pub on_upgrade: Option<Validator>,
    /// Initial custom-context value
    pub seed: ContextSeed,
}

impl WsRoute {
    /// Create a WebSocket route from a literal-form pattern
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidRoutePattern`] if the pattern does not
    /// compile.
    pub fn new(pattern: &str) -> Result<Self> {
        Ok(Self {
            path: CompiledPath::compile(pattern)?,
            on_open: None,
            on_message: None,
            on_close: None,
            on_upgrade: None,
            seed: ContextSeed::None,
        })
    }

    /// Set the open handler
    #[must_use]
    pub fn on_open(mut self, handler: Handler) -> Self {
        self.on_open = Some(handler);
        self
    }

    /// Set the message handler
    #[must_use]
    pub fn on_message(mut self, handler: MessageHandler) -> Self {
        self.on_message = Some(handler);
        self
    }

    /// Set the close handler
    #[must_use]
    pub fn on_close(mut self, handler: Handler) -> Self {
        self.on_close = Some(handler);
        self
    }

    /// Set the upgrade gate
    #[must_use]
    pub fn on_upgrade(mut self, gate: Validator) -> Self {
        self.on_upgrade = Some(gate);
        self
    }

    /// Attach an initial custom-context value
    #[must_use]
    pub fn with_seed(mut self, seed: ContextSeed) -> Self {
        self.seed = seed;
        self
    }

    /// Match a request path against this route
    #[must_use]
    pub fn matches(&self, path: &str, segments: &[&str]) -> Option<Params> {
        self.path.matches(path, segments)
    }
}

impl fmt::Debug for WsRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WsRoute")
            .field("path", &self.path.pattern())
            .field("on_open", &self.on_open.is_some())
            .field("on_message", &self.on_message.is_some())
            .field("on_close", &self.on_close.is_some())
            .field("on_upgrade", &self.on_upgrade.is_some())
            .finish_non_exhaustive()
    }
}

/// Options for a static-file mount
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticOptions {
    /// Guess a `Content-Type` from the file extension
    pub auto_content_type: bool,
    /// Serve `/page` from `page.html` when `/page` itself does not exist
    pub strip_html: bool,
}

/// A path-prefix → directory association served without per-file routes
///
/// Not pre-expanded: each request is resolved against the filesystem
/// collaborator at dispatch time.
#[derive(Debug, Clone)]
pub struct StaticMount {
    /// Normalized path prefix
    pub prefix: String,
    /// Backing directory
    pub directory: PathBuf,
    /// Serving options
    pub options: StaticOptions,
}

impl StaticMount {
    /// Create a mount with a normalized prefix
    #[must_use]
    pub fn new(prefix: &str, directory: impl Into<PathBuf>, options: StaticOptions) -> Self {
        Self {
            prefix: crate::matcher::normalize_path(prefix),
            directory: directory.into(),
            options,
        }
    }

    /// The request-path remainder under this mount, if the prefix applies
    #[must_use]
    pub fn strip(&self, path: &str) -> Option<String> {
        if self.prefix == "/" {
            return Some(path.trim_start_matches('/').to_string());
        }
        let rest = path.strip_prefix(self.prefix.as_str())?;
        if !rest.is_empty() && !rest.starts_with('/') {
            // "/static-extra" must not match the "/static" mount
            return None;
        }
        Some(rest.trim_start_matches('/').to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::{normalize_path, split_segments};

    fn noop() -> Handler {
        handler(|_ctx| Box::pin(async { Ok(()) }))
    }

    #[test]
    fn test_method_display_roundtrip() {
        assert_eq!(Method::Get.to_string(), "GET");
        assert_eq!(Method::from_hyper(&hyper::Method::DELETE), Method::Delete);
        // unknown methods fall back to GET
        assert_eq!(
            Method::from_hyper(&hyper::Method::from_bytes(b"PURGE").unwrap()),
            Method::Get
        );
    }

    #[test]
    fn test_route_matches_method_first() {
        let route = Route::new(Method::Post, "/users/{id}", noop()).unwrap();
        let path = normalize_path("/users/42");
        let segments = split_segments(&path);
        assert!(route.matches(Method::Get, &path, &segments).is_none());
        let params = route.matches(Method::Post, &path, &segments).unwrap();
        assert_eq!(params.get("id"), Some(&"42".to_string()));
    }

    #[test]
    fn test_route_builder_accumulates() {
        let route = Route::new(Method::Get, "/x", noop())
            .unwrap()
            .with_header("x-frame-options", "DENY")
            .with_validator(validator_fn(|_ctx| Box::pin(async { Ok(Flow::Continue) })));
        assert_eq!(route.validators.len(), 1);
        assert_eq!(
            route.headers.get("x-frame-options"),
            Some(&"DENY".to_string())
        );
    }

    #[test]
    fn test_static_mount_strip() {
        let mount = StaticMount::new("/static/", "/srv/www", StaticOptions::default());
        assert_eq!(mount.prefix, "/static");
        assert_eq!(mount.strip("/static/css/app.css"), Some("css/app.css".to_string()));
        assert_eq!(mount.strip("/static"), Some(String::new()));
        assert_eq!(mount.strip("/static-extra/x"), None);
        assert_eq!(mount.strip("/other/x"), None);
    }

    #[test]
    fn test_root_mount_strips_everything() {
        let mount = StaticMount::new("/", "/srv/www", StaticOptions::default());
        assert_eq!(mount.strip("/index.html"), Some("index.html".to_string()));
    }
}
