//! # HTTP/WebSocket Server
//!
//! Embeddable server front-end: route registration, the accept loop, and
//! graceful shutdown. Each accepted connection runs the request lifecycle
//! from [`crate::pipeline`]; upgrade requests branch into [`crate::ws`].
//!
//! ## Key Features
//!
//! - Async request handling with Tokio runtime
//! - Graceful shutdown on SIGINT with connection draining
//! - Live route registration and removal, with cache invalidation
//! - Network-free request execution for tests via [`Server::test_request`]

use crate::cache::BoundedCache;
use crate::config::ServerConfig;
use crate::context::{Context, ResponseDraft};
use crate::encoding::Compressor;
use crate::error::{Error, Result};
use crate::events::{EventDispatcher, EventHandler, EventKind};
use crate::pipeline::Engine;
use crate::ratelimit::{RateLimiter, Transport};
use crate::registry::{RouteRegistry, RouteSelector, WsRouteSelector};
use crate::route::{ContextSeed, Method, Middleware, Route, StaticMount, Validator, WsRoute};
use crate::static_files::{default_content_type, ContentTypeGuess, FileSystem, TokioFileSystem};
use crate::ws;
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{HeaderMap, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tracing::{error, info, warn};

/// Embeddable application server
///
/// Routes, middleware, validators, and event handlers are registered on a
/// mutable instance; [`Server::serve`] then runs until interrupted. Routes
/// and mounts may keep being added or removed while serving, which drops the
/// resolution and file caches.
pub struct Server {
    config: ServerConfig,
    registry: Arc<RwLock<RouteRegistry>>,
    resolve_cache: Arc<Mutex<BoundedCache<crate::pipeline::ResolveKey, crate::pipeline::Resolution>>>,
    file_cache: Arc<Mutex<BoundedCache<std::path::PathBuf, Bytes>>>,
    limiter: RateLimiter,
    dispatcher: EventDispatcher,
    middleware: Vec<Middleware>,
    validators: Vec<Validator>,
    compressor: Option<Compressor>,
    content_type: ContentTypeGuess,
    fs: Arc<dyn FileSystem>,
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl Server {
    /// Create a server with default configuration
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(ServerConfig::default())
    }

    /// Create a server from explicit configuration
    #[must_use]
    pub fn with_config(config: ServerConfig) -> Self {
        let cache_limit = if config.cache.limit == 0 {
            None
        } else {
            Some(config.cache.limit)
        };
        let resolve_cache = Arc::new(Mutex::new(BoundedCache::new(cache_limit)));
        let file_cache = Arc::new(Mutex::new(BoundedCache::new(cache_limit)));

        let mut registry = RouteRegistry::new();
        let on_change = {
            let resolve_cache = Arc::clone(&resolve_cache);
            let file_cache = Arc::clone(&file_cache);
            Arc::new(move || {
                resolve_cache
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .clear(&[]);
                file_cache
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .clear(&[]);
            })
        };
        registry.set_on_change(on_change);

        Self {
            config,
            registry: Arc::new(RwLock::new(registry)),
            resolve_cache,
            file_cache,
            limiter: RateLimiter::new(),
            dispatcher: EventDispatcher::new(),
            middleware: Vec::new(),
            validators: Vec::new(),
            compressor: None,
            content_type: Arc::new(default_content_type),
            fs: Arc::new(TokioFileSystem),
        }
    }

    /// Bind address override
    #[must_use]
    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.config.address = addr;
        self
    }

    /// Register an HTTP route
    pub fn http(&self, route: Route) -> Arc<Route> {
        self.registry
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .add_http(route)
    }

    /// Register a WebSocket route
    pub fn ws(&self, route: WsRoute) -> Arc<WsRoute> {
        self.registry
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .add_ws(route)
    }

    /// Mount a directory of static files under a path prefix
    pub fn mount(&self, mount: StaticMount) -> Arc<StaticMount> {
        self.registry
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .add_mount(mount)
    }

    /// Remove HTTP routes; returns how many were dropped
    pub fn remove_http(&self, selector: RouteSelector<'_>) -> usize {
        self.registry
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove_http(selector)
    }

    /// Remove WebSocket routes; returns how many were dropped
    pub fn remove_ws(&self, selector: WsRouteSelector<'_>) -> usize {
        self.registry
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove_ws(selector)
    }

    /// Remove a static mount by its prefix
    pub fn remove_mount(&self, prefix: &str) -> usize {
        self.registry
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove_mount(prefix)
    }

    /// Append a middleware link, run in registration order
    pub fn middleware(&mut self, middleware: Middleware) {
        self.middleware.push(middleware);
    }

    /// Append a global validator, run before any route's own
    pub fn validator(&mut self, validator: Validator) {
        self.validators.push(validator);
    }

    /// Register a lifecycle event handler, replacing any existing one
    pub fn on_event(&mut self, kind: EventKind, handler: EventHandler) {
        self.dispatcher.on(kind, handler);
    }

    /// Install the compression codec collaborator
    pub fn with_compressor(&mut self, compressor: Compressor) {
        self.compressor = Some(compressor);
    }

    /// Replace the content-type guesser used for static files
    pub fn with_content_type(&mut self, guess: ContentTypeGuess) {
        self.content_type = guess;
    }

    /// Replace the filesystem collaborator (virtual assets, test fixtures)
    pub fn with_filesystem(&mut self, fs: Arc<dyn FileSystem>) {
        self.fs = fs;
    }

    /// Snapshot the shared state one serve loop (or test request) runs on
    fn engine(&self) -> Arc<Engine> {
        Arc::new(Engine {
            config: self.config.clone(),
            registry: Arc::clone(&self.registry),
            resolve_cache: Arc::clone(&self.resolve_cache),
            file_cache: Arc::clone(&self.file_cache),
            limiter: self.limiter.clone(),
            dispatcher: self.dispatcher.clone(),
            middleware: self.middleware.clone(),
            validators: self.validators.clone(),
            compressor: self.compressor.clone(),
            content_type: Arc::clone(&self.content_type),
            fs: Arc::clone(&self.fs),
        })
    }

    /// Start the server with graceful shutdown
    pub async fn serve(&self) -> Result<()> {
        let addr = self.config.address;

        let socket = tokio::net::TcpSocket::new_v4().map_err(|e| Error::Bind {
            address: addr.to_string(),
            source: e,
        })?;
        socket.set_reuseaddr(true).map_err(|e| Error::Bind {
            address: addr.to_string(),
            source: e,
        })?;
        socket.bind(addr).map_err(|e| Error::Bind {
            address: addr.to_string(),
            source: e,
        })?;
        let listener = socket.listen(1024).map_err(|e| Error::Bind {
            address: addr.to_string(),
            source: e,
        })?;

        info!("Server listening on http://{}", addr);

        let engine = self.engine();
        let active = Arc::new(AtomicUsize::new(0));
        let keep_alive = self.config.keep_alive;

        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    let (stream, remote_addr) = accept_result.map_err(Error::Io)?;
                    let io = TokioIo::new(stream);

                    let engine = Arc::clone(&engine);
                    let active = Arc::clone(&active);

                    tokio::task::spawn(async move {
                        active.fetch_add(1, Ordering::Relaxed);

                        let service = service_fn(move |req| {
                            let engine = Arc::clone(&engine);
                            async move {
                                Ok::<_, hyper::Error>(handle_request(engine, req, remote_addr).await)
                            }
                        });
                        if let Err(err) = http1::Builder::new()
                            .keep_alive(keep_alive)
                            .serve_connection(io, service)
                            .with_upgrades()
                            .await
                        {
                            error!("Error serving connection: {:?}", err);
                        }
                        active.fetch_sub(1, Ordering::Relaxed);
                    });
                }
                () = shutdown_signal() => {
                    info!("Shutdown signal received, stopping server...");
                    break;
                }
            }
        }

        let timeout = self.config.shutdown_timeout();
        let drain = async {
            while active.load(Ordering::Relaxed) != 0 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        };
        let _ = tokio::time::timeout(timeout, drain).await;
        Ok(())
    }

    /// Execute a request directly without the network stack
    ///
    /// Runs the identical lifecycle a socket request would and returns the
    /// finished draft for inspection.
    pub async fn test_request(
        &self,
        method: Method,
        target: &str,
        headers: HashMap<String, String>,
        body: Option<Bytes>,
    ) -> ResponseDraft {
        let engine = self.engine();

        if let Some(bytes) = body.as_ref() {
            if bytes.len() > self.config.body.max_size {
                let err = Error::PayloadTooLarge {
                    limit: self.config.body.max_size,
                    actual: bytes.len(),
                };
                let mut draft = ResponseDraft::default();
                draft.status = 413;
                draft
                    .headers
                    .insert("content-type".into(), "text/plain".into());
                draft.body = format!("{err}\n").into_bytes();
                return draft;
            }
        }

        let mut header_map = HeaderMap::new();
        for (name, value) in headers {
            if let (Ok(name), Ok(value)) = (name.parse::<hyper::header::HeaderName>(), value.parse())
            {
                header_map.insert(name, value);
            }
        }

        let mut ctx = Context::new(
            Transport::Http,
            method,
            target,
            header_map,
            "127.0.0.1".parse().unwrap_or(IpAddr::V4(std::net::Ipv4Addr::LOCALHOST)),
            &ContextSeed::None,
            Arc::clone(&engine.fs),
        );
        ctx.body = body;
        engine.run_http(&mut ctx).await;
        std::mem::take(&mut ctx.response)
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to install CTRL+C signal handler: {}", e);
        std::future::pending::<()>().await;
    }
}

/// Client identity: the configured proxy header when trusted, otherwise the
/// socket peer address.
fn client_ip(engine: &Engine, headers: &HeaderMap, remote: SocketAddr) -> IpAddr {
    if engine.config.proxy.enabled {
        let forwarded = headers
            .get(engine.config.proxy.header.as_str())
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .and_then(|v| v.trim().parse::<IpAddr>().ok());
        if let Some(ip) = forwarded {
            return ip;
        }
    }
    remote.ip()
}

fn plain_response(status: StatusCode, text: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(text.as_bytes())));
    *response.status_mut() = status;
    response
}

/// Per-request entry point for the accept loop
async fn handle_request(
    engine: Arc<Engine>,
    req: Request<Incoming>,
    remote_addr: SocketAddr,
) -> Response<Full<Bytes>> {
    let ip = client_ip(&engine, req.headers(), remote_addr);

    if ws::is_upgrade_request(req.headers()) {
        return ws::handle_upgrade(engine, req, ip).await;
    }

    let method = Method::from_hyper(req.method());
    let target = req
        .uri()
        .path_and_query()
        .map_or_else(|| req.uri().path().to_string(), ToString::to_string);
    let version = format!("{:?}", req.version());
    let headers = req.headers().clone();

    let body = match Limited::new(req.into_body(), engine.config.body.max_size)
        .collect()
        .await
    {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            if e.downcast_ref::<hyper::Error>().is_some() {
                warn!("Failed to read request body: {}", e);
                return plain_response(StatusCode::BAD_REQUEST, "Bad Request\n");
            }
            // Chunked uploads carry no declared length; the body just says so.
            let text = headers
                .get(hyper::header::CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<usize>().ok())
                .map_or_else(
                    || "Payload Too Large\n".to_string(),
                    |actual| {
                        format!(
                            "{}\n",
                            Error::PayloadTooLarge {
                                limit: engine.config.body.max_size,
                                actual,
                            }
                        )
                    },
                );
            let mut response = Response::new(Full::new(Bytes::from(text)));
            *response.status_mut() = StatusCode::PAYLOAD_TOO_LARGE;
            return response;
        }
    };

    let mut ctx = Context::new(
        Transport::Http,
        method,
        &target,
        headers,
        ip,
        &ContextSeed::None,
        Arc::clone(&engine.fs),
    );
    if !body.is_empty() {
        ctx.body = Some(body);
    }
    if ctx.header("x-request-id").is_none() {
        let request_id = generate_request_id();
        ctx.set_request_header("x-request-id", &request_id);
    }

    engine.run_http(&mut ctx).await;

    if let Some(request_id) = ctx.header("x-request-id").map(str::to_owned) {
        ctx.response.headers.insert("x-request-id".into(), request_id);
    }
    let response = engine.emit(&mut ctx);

    info!(
        "    {} - \"{} {} {}\" {}",
        remote_addr,
        method,
        ctx.path,
        version,
        response.status()
    );
    response
}

static REQUEST_COUNTER: AtomicUsize = AtomicUsize::new(1);

fn generate_request_id() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let counter = REQUEST_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{:x}-{:x}", now.as_nanos(), counter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::TaskPhase;
    use crate::events::event_handler;
    use crate::route::{handler, middleware_fn, validator_fn, Flow, StaticOptions};
    use serde_json::json;

    fn no_headers() -> HashMap<String, String> {
        HashMap::new()
    }

    #[tokio::test]
    async fn test_full_lifecycle_order() {
        let mut server = Server::new();
        server.middleware(middleware_fn(|ctx| {
            Box::pin(async move {
                ctx.set_header("x-served-by", "portico");
                Ok(Flow::Continue)
            })
        }));
        server.validator(validator_fn(|ctx| {
            Box::pin(async move {
                if ctx.header("x-api-key").is_some() {
                    Ok(Flow::Continue)
                } else {
                    ctx.set_status(401);
                    Ok(Flow::Continue)
                }
            })
        }));
        server.http(
            Route::new(
                Method::Get,
                "/greet/{name}",
                handler(|ctx| {
                    Box::pin(async move {
                        let name = ctx.param("name").unwrap_or("world").to_string();
                        ctx.set_header("content-type", "application/json");
                        ctx.print(json!({ "greeting": name }).to_string());
                        Ok(())
                    })
                }),
            )
            .unwrap(),
        );

        let mut headers = no_headers();
        headers.insert("x-api-key".into(), "secret".into());
        let draft = server
            .test_request(Method::Get, "/greet/ada", headers, None)
            .await;
        assert_eq!(draft.status, 200);
        assert_eq!(draft.headers["x-served-by"], "portico");
        assert_eq!(draft.headers["content-type"], "application/json");
        assert_eq!(draft.body_str(), Some(r#"{"greeting":"ada"}"#));

        let rejected = server
            .test_request(Method::Get, "/greet/ada", no_headers(), None)
            .await;
        assert_eq!(rejected.status, 401);
        assert!(rejected.body.is_empty());
    }

    #[tokio::test]
    async fn test_deferred_headers_run_before_body_tasks() {
        let server = Server::new();
        server.http(
            Route::new(
                Method::Get,
                "/ordered",
                handler(|ctx| {
                    Box::pin(async move {
                        ctx.print("first");
                        ctx.defer_header("x-late", async { Ok("computed".to_string()) });
                        ctx.print(" second");
                        Ok(())
                    })
                }),
            )
            .unwrap(),
        );

        let draft = server
            .test_request(Method::Get, "/ordered", no_headers(), None)
            .await;
        assert_eq!(draft.headers["x-late"], "computed");
        assert_eq!(draft.body_str(), Some("first second"));
    }

    #[tokio::test]
    async fn test_not_found_lists_routes() {
        let server = Server::new();
        server.http(
            Route::new(Method::Get, "/a", handler(|_ctx| Box::pin(async { Ok(()) }))).unwrap(),
        );
        server.http(
            Route::new(Method::Post, "/b", handler(|_ctx| Box::pin(async { Ok(()) }))).unwrap(),
        );

        let draft = server
            .test_request(Method::Get, "/missing", no_headers(), None)
            .await;
        assert_eq!(draft.status, 404);
        let body = draft.body_str().unwrap();
        assert!(body.contains("GET /a"));
        assert!(body.contains("POST /b"));
    }

    #[tokio::test]
    async fn test_oversized_body_rejected_before_lifecycle() {
        let mut config = ServerConfig::default();
        config.body.max_size = 8;
        let server = Server::with_config(config);
        server.http(
            Route::new(Method::Post, "/upload", handler(|_ctx| Box::pin(async { Ok(()) })))
                .unwrap(),
        );

        let draft = server
            .test_request(
                Method::Post,
                "/upload",
                no_headers(),
                Some(Bytes::from_static(b"way more than eight bytes")),
            )
            .await;
        assert_eq!(draft.status, 413);
        let body = draft.body_str().unwrap();
        assert!(body.contains("limit=8"));
        assert!(body.contains("received=25"));
    }

    #[tokio::test]
    async fn test_static_mount_serves_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("app.js"), "console.log(1);").unwrap();

        let server = Server::new();
        server.mount(StaticMount::new(
            "/assets",
            dir.path(),
            StaticOptions {
                auto_content_type: true,
                strip_html: false,
            },
        ));

        let draft = server
            .test_request(Method::Get, "/assets/app.js", no_headers(), None)
            .await;
        assert_eq!(draft.status, 200);
        assert_eq!(draft.headers["content-type"], "text/javascript");
        assert_eq!(draft.body_str(), Some("console.log(1);"));
    }

    #[tokio::test]
    async fn test_route_removal_invalidates_cache() {
        let server = Server::new();
        server.http(
            Route::new(
                Method::Get,
                "/volatile",
                handler(|ctx| {
                    Box::pin(async move {
                        ctx.print("here");
                        Ok(())
                    })
                }),
            )
            .unwrap(),
        );

        let first = server
            .test_request(Method::Get, "/volatile", no_headers(), None)
            .await;
        assert_eq!(first.status, 200);

        let removed = server.remove_http(RouteSelector::Pattern("/volatile"));
        assert_eq!(removed, 1);

        let second = server
            .test_request(Method::Get, "/volatile", no_headers(), None)
            .await;
        assert_eq!(second.status, 404);
    }

    #[tokio::test]
    async fn test_custom_error_event_handler() {
        let mut server = Server::new();
        server.on_event(
            EventKind::HandlerError,
            event_handler(|ctx, payload| {
                Box::pin(async move {
                    let detail = payload
                        .cause()
                        .map_or_else(String::new, ToString::to_string);
                    ctx.set_status(500);
                    ctx.print(json!({ "error": detail }).to_string());
                    Ok(())
                })
            }),
        );
        server.http(
            Route::new(
                Method::Get,
                "/broken",
                handler(|_ctx| Box::pin(async { Err(Error::handler("kaput")) })),
            )
            .unwrap(),
        );

        let draft = server
            .test_request(Method::Get, "/broken", no_headers(), None)
            .await;
        assert_eq!(draft.status, 500);
        assert!(draft.body_str().unwrap().contains("kaput"));
    }

    #[tokio::test]
    async fn test_deferred_failure_uses_error_event() {
        let server = Server::new();
        server.http(
            Route::new(
                Method::Get,
                "/late-fail",
                handler(|ctx| {
                    Box::pin(async move {
                        ctx.print("will be discarded");
                        ctx.defer(TaskPhase::Body, |_| {
                            Box::pin(async { Err(Error::handler("deferred blew up")) })
                        });
                        ctx.print("never reached");
                        Ok(())
                    })
                }),
            )
            .unwrap(),
        );

        let draft = server
            .test_request(Method::Get, "/late-fail", no_headers(), None)
            .await;
        assert_eq!(draft.status, 500);
        assert!(draft.body_str().unwrap().contains("deferred blew up"));
    }
}
