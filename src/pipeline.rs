//! # Request Lifecycle
//!
//! Drives a request from arrival to a finished response draft: CORS
//! short-circuit, rate limiting, target resolution (cache → static mounts →
//! route scan), middleware, validators, the handler, and finally the deferred
//! task queue. Every failure branch funnels through the event dispatcher so
//! user-registered handlers (or the built-in fallbacks) shape the response.
//!
//! The [`Engine`] bundles the shared state one server instance owns; request
//! tasks hold it behind an `Arc`.

use crate::cache::BoundedCache;
use crate::config::ServerConfig;
use crate::context::Context;
use crate::encoding::{negotiate, Compressor, ContentEncoding};
use crate::error::Error;
use crate::events::{EventDispatcher, EventKind, EventPayload};
use crate::matcher::{split_segments, Params};
use crate::ratelimit::{RateKey, RateLimiter, Transport};
use crate::registry::RouteRegistry;
use crate::route::{Flow, Method, Middleware, Route, Validator, WsRoute};
use crate::static_files::{self, ContentTypeGuess, FileSystem, ResolvedFile};
use http_body_util::Full;
use hyper::body::Bytes;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, warn};

/// Key for the resolution cache: transport, method, normalized path
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct ResolveKey(pub Transport, pub Method, pub String);

/// A cached dispatch target
#[derive(Clone)]
pub(crate) enum Resolution {
    /// An HTTP route with its bound path parameters
    Http {
        route: Arc<Route>,
        params: Params,
    },
    /// A file under a static mount
    File(ResolvedFile),
    /// A WebSocket route with its bound path parameters
    Ws {
        route: Arc<WsRoute>,
        params: Params,
    },
}

/// Shared per-server state consumed by every request task
pub(crate) struct Engine {
    pub(crate) config: ServerConfig,
    pub(crate) registry: Arc<RwLock<RouteRegistry>>,
    pub(crate) resolve_cache: Arc<Mutex<BoundedCache<ResolveKey, Resolution>>>,
    pub(crate) file_cache: Arc<Mutex<BoundedCache<PathBuf, Bytes>>>,
    pub(crate) limiter: RateLimiter,
    pub(crate) dispatcher: EventDispatcher,
    pub(crate) middleware: Vec<Middleware>,
    pub(crate) validators: Vec<Validator>,
    pub(crate) compressor: Option<Compressor>,
    pub(crate) content_type: ContentTypeGuess,
    pub(crate) fs: Arc<dyn FileSystem>,
}

impl Engine {
    /// Run the full HTTP lifecycle, leaving the finished response on
    /// `ctx.response`.
    pub(crate) async fn run_http(&self, ctx: &mut Context) {
        self.run_phases(ctx).await;
        self.drain(ctx).await;
    }

    /// Everything before the deferred-task drain
    async fn run_phases(&self, ctx: &mut Context) {
        if self.config.cors.enabled {
            self.apply_cors(ctx);
            if ctx.method == Method::Options {
                ctx.set_status(204);
                return;
            }
        }

        if !self.admit(ctx).await {
            return;
        }

        let Some(resolution) = self.resolve(ctx).await else {
            let listing = self
                .registry
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .listing();
            debug!(method = %ctx.method, path = %ctx.path, "no route matched");
            self.dispatcher
                .dispatch(EventKind::NotFound, ctx, EventPayload::Listing(&listing))
                .await;
            return;
        };

        match resolution {
            Resolution::Http { route, params } => {
                ctx.params = params;
                ctx.apply_seed(&route.seed);
                for (name, value) in &route.headers {
                    ctx.response.headers.insert(name.clone(), value.clone());
                }
                if !self.run_middleware(ctx).await {
                    return;
                }
                if !self.run_validators(ctx, &route.validators).await {
                    return;
                }
                if let Err(e) = (route.handler)(ctx).await {
                    warn!(method = %ctx.method, path = %ctx.path, error = %e, "handler failed");
                    self.dispatcher
                        .dispatch(EventKind::HandlerError, ctx, EventPayload::Cause(&e))
                        .await;
                }
            }
            Resolution::File(resolved) => {
                if !self.run_middleware(ctx).await {
                    return;
                }
                if !self.run_validators(ctx, &[]).await {
                    return;
                }
                if let Err(e) = self.serve_file(ctx, &resolved).await {
                    warn!(path = %ctx.path, error = %e, "static file read failed");
                    self.dispatcher
                        .dispatch(EventKind::HandlerError, ctx, EventPayload::Cause(&e))
                        .await;
                }
            }
            // WebSocket targets never reach the HTTP lifecycle: the upgrade
            // path resolves them before calling in here.
            Resolution::Ws { .. } => {
                let listing = self
                    .registry
                    .read()
                    .unwrap_or_else(|e| e.into_inner())
                    .listing();
                self.dispatcher
                    .dispatch(EventKind::NotFound, ctx, EventPayload::Listing(&listing))
                    .await;
            }
        }
    }

    /// Drain the deferred queue; a failing task routes through the
    /// handler-error event, whose own queued output gets one more drain.
    pub(crate) async fn drain(&self, ctx: &mut Context) {
        if let Err(e) = ctx.drain_deferred().await {
            warn!(path = %ctx.path, error = %e, "deferred task failed");
            self.dispatcher
                .dispatch(EventKind::HandlerError, ctx, EventPayload::Cause(&e))
                .await;
            if let Err(e2) = ctx.drain_deferred().await {
                self.dispatcher
                    .dispatch(EventKind::HandlerError, ctx, EventPayload::Cause(&e2))
                    .await;
            }
        }
    }

    fn apply_cors(&self, ctx: &mut Context) {
        let cors = &self.config.cors;
        let headers = &mut ctx.response.headers;
        headers.insert(
            "access-control-allow-origin".into(),
            cors.allow_origin.clone(),
        );
        headers.insert(
            "access-control-allow-methods".into(),
            cors.allow_methods.clone(),
        );
        headers.insert(
            "access-control-allow-headers".into(),
            cors.allow_headers.clone(),
        );
    }

    /// Count this request against every configured rule. Rejection by any
    /// rule dispatches the rate-limited event and stops the pipeline.
    pub(crate) async fn admit(&self, ctx: &mut Context) -> bool {
        if self.config.rate_limits.is_empty() {
            return true;
        }
        ctx.limiter = Some(self.limiter.clone());

        for rule in &self.config.rate_limits {
            let key = RateKey {
                transport: ctx.transport,
                ip: ctx.client_ip,
                rule: rule.id.clone(),
            };
            let decision = self.limiter.check(&key, rule);
            ctx.rate_keys.push(key.clone());

            let headers = &mut ctx.response.headers;
            headers.insert("x-ratelimit-limit".into(), decision.limit.to_string());
            headers.insert(
                "x-ratelimit-remaining".into(),
                decision.remaining.to_string(),
            );
            headers.insert(
                "x-ratelimit-reset".into(),
                decision.reset_in.as_secs().to_string(),
            );

            if !decision.admitted {
                debug!(key = %key, "rate limit exceeded");
                let cause = Error::RateLimited {
                    key: key.to_string(),
                    rule: rule.id.clone(),
                };
                self.dispatcher
                    .dispatch(EventKind::RateLimited, ctx, EventPayload::Cause(&cause))
                    .await;
                return false;
            }
        }
        true
    }

    /// Resolve the dispatch target, consulting the cache first. Only
    /// positive resolutions are cached; misses are re-scanned every time so
    /// newly registered routes take effect immediately.
    pub(crate) async fn resolve(&self, ctx: &Context) -> Option<Resolution> {
        let key = ResolveKey(ctx.transport, ctx.method, ctx.path.clone());
        if self.config.cache.enabled {
            let cache = self.resolve_cache.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(hit) = cache.get(&key) {
                return Some(hit.clone());
            }
        }

        let table = self
            .registry
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .snapshot();
        let segments = split_segments(&ctx.path);

        let resolution = match ctx.transport {
            Transport::Ws => table.ws.iter().find_map(|route| {
                route.matches(&ctx.path, &segments).map(|params| Resolution::Ws {
                    route: Arc::clone(route),
                    params,
                })
            }),
            Transport::Http => {
                let mut found = None;
                if matches!(ctx.method, Method::Get | Method::Head) {
                    found = static_files::resolve(self.fs.as_ref(), &table.mounts, &ctx.path)
                        .await
                        .map(Resolution::File);
                }
                found.or_else(|| {
                    table.http.iter().find_map(|route| {
                        route
                            .matches(ctx.method, &ctx.path, &segments)
                            .map(|params| Resolution::Http {
                                route: Arc::clone(route),
                                params,
                            })
                    })
                })
            }
        }?;

        if self.config.cache.enabled {
            self.resolve_cache
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .set(key, resolution.clone());
        }
        Some(resolution)
    }

    /// Run the middleware chain. Returns `false` when a link ended the
    /// pipeline or failed; queued tasks still drain afterwards.
    pub(crate) async fn run_middleware(&self, ctx: &mut Context) -> bool {
        for link in &self.middleware {
            match link(ctx).await {
                Ok(Flow::Continue) => {}
                Ok(Flow::End) => {
                    debug!(path = %ctx.path, "middleware ended pipeline");
                    return false;
                }
                Err(e) => {
                    let cause = match e {
                        Error::Middleware(_) => e,
                        other => Error::Middleware(other.to_string()),
                    };
                    warn!(path = %ctx.path, error = %cause, "middleware failed");
                    self.dispatcher
                        .dispatch(EventKind::MiddlewareError, ctx, EventPayload::Cause(&cause))
                        .await;
                    return false;
                }
            }
        }
        true
    }

    /// Run global validators then the route's own. A validator rejects
    /// either by erroring or by leaving a non-2xx status on the draft; the
    /// latter counts as handled and raises no event.
    pub(crate) async fn run_validators(&self, ctx: &mut Context, own: &[Validator]) -> bool {
        for validator in self.validators.iter().chain(own) {
            match validator(ctx).await {
                Ok(Flow::Continue) => {
                    if !ctx.response.is_success() {
                        debug!(path = %ctx.path, status = ctx.response.status, "validator rejected");
                        return false;
                    }
                }
                Ok(Flow::End) => return false,
                Err(e) => {
                    let cause = match e {
                        Error::Validator(_) => e,
                        other => Error::Validator(other.to_string()),
                    };
                    warn!(path = %ctx.path, error = %cause, "validator failed");
                    self.dispatcher
                        .dispatch(EventKind::ValidatorError, ctx, EventPayload::Cause(&cause))
                        .await;
                    return false;
                }
            }
        }
        true
    }

    /// Read a resolved file into the response body, through the byte cache
    /// when caching is on.
    async fn serve_file(&self, ctx: &mut Context, resolved: &ResolvedFile) -> crate::Result<()> {
        let bytes = if self.config.cache.enabled {
            let cached = {
                let cache = self.file_cache.lock().unwrap_or_else(|e| e.into_inner());
                cache.get(&resolved.file).cloned()
            };
            match cached {
                Some(bytes) => bytes,
                None => {
                    let bytes = self.read_file(resolved).await?;
                    self.file_cache
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .set(resolved.file.clone(), bytes.clone());
                    bytes
                }
            }
        } else {
            self.read_file(resolved).await?
        };

        if resolved.mount.options.auto_content_type
            && !ctx.response.headers.contains_key("content-type")
        {
            if let Some(mime) = (self.content_type)(&resolved.file) {
                ctx.response
                    .headers
                    .insert("content-type".into(), mime.to_string());
            }
        }
        ctx.response.body.extend_from_slice(&bytes);
        Ok(())
    }

    async fn read_file(&self, resolved: &ResolvedFile) -> crate::Result<Bytes> {
        self.fs
            .read(&resolved.file)
            .await
            .map_err(|e| Error::Handler(format!("read {}: {e}", resolved.file.display())))
    }

    /// Convert the finished draft into a wire response, applying content
    /// negotiation when a compressor collaborator is installed.
    pub(crate) fn emit(&self, ctx: &mut Context) -> hyper::Response<Full<Bytes>> {
        let draft = std::mem::take(&mut ctx.response);
        let mut body = draft.body;
        let mut headers = draft.headers;

        if !body.is_empty() && !headers.contains_key("content-type") {
            headers.insert("content-type".into(), "text/plain; charset=utf-8".into());
        }

        if let Some(compressor) = &self.compressor {
            if !body.is_empty() && !headers.contains_key("content-encoding") {
                let disabled: Vec<ContentEncoding> = self
                    .config
                    .compression
                    .disabled
                    .iter()
                    .filter_map(|t| ContentEncoding::from_token(t))
                    .collect();
                if let Some(encoding) = ctx
                    .header("accept-encoding")
                    .and_then(|accept| negotiate(accept, &disabled))
                {
                    body = compressor(encoding, &body);
                    headers.insert("content-encoding".into(), encoding.token().into());
                    headers.insert("vary".into(), "accept-encoding".into());
                }
            }
        }

        let status =
            hyper::StatusCode::from_u16(draft.status).unwrap_or(hyper::StatusCode::INTERNAL_SERVER_ERROR);
        let mut builder = hyper::Response::builder().status(status);
        for (name, value) in headers {
            builder = builder.header(name, value);
        }
        for cookie in draft.cookies {
            builder = builder.header(hyper::header::SET_COOKIE, cookie);
        }
        builder.body(Full::new(Bytes::from(body))).unwrap_or_else(|e| {
            warn!(error = %e, "response assembly failed");
            let mut fallback = hyper::Response::new(Full::new(Bytes::new()));
            *fallback.status_mut() = hyper::StatusCode::INTERNAL_SERVER_ERROR;
            fallback
        })
    }

    /// Drop every cached resolution and file. Wired to registry changes.
    pub(crate) fn invalidate_caches(&self) {
        self.resolve_cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear(&[]);
        self.file_cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear(&[]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::context::TaskPhase;
    use crate::events::event_handler;
    use crate::ratelimit::RateRule;
    use crate::route::{handler, middleware_fn, validator_fn};
    use crate::static_files::{default_content_type, TokioFileSystem};

    fn test_engine() -> Engine {
        Engine {
            config: ServerConfig::default(),
            registry: Arc::new(RwLock::new(RouteRegistry::new())),
            resolve_cache: Arc::new(Mutex::new(BoundedCache::new(Some(64)))),
            file_cache: Arc::new(Mutex::new(BoundedCache::new(Some(64)))),
            limiter: RateLimiter::new(),
            dispatcher: EventDispatcher::new(),
            middleware: Vec::new(),
            validators: Vec::new(),
            compressor: None,
            content_type: Arc::new(default_content_type),
            fs: Arc::new(TokioFileSystem),
        }
    }

    fn add_route(engine: &Engine, route: Route) {
        engine.registry.write().unwrap().add_http(route);
    }

    #[tokio::test]
    async fn test_dispatch_writes_body_and_params() {
        let engine = test_engine();
        add_route(
            &engine,
            Route::new(
                Method::Get,
                "/users/{id}",
                handler(|ctx| {
                    Box::pin(async move {
                        let id = ctx.param("id").unwrap_or_default().to_string();
                        ctx.print(format!("user {id}"));
                        Ok(())
                    })
                }),
            )
            .unwrap(),
        );

        let mut ctx = Context::test(Method::Get, "/users/42");
        engine.run_http(&mut ctx).await;
        assert_eq!(ctx.response.status, 200);
        assert_eq!(ctx.response.body_str(), Some("user 42"));
    }

    #[tokio::test]
    async fn test_unmatched_path_gets_builtin_listing() {
        let engine = test_engine();
        add_route(
            &engine,
            Route::new(Method::Get, "/only", handler(|_ctx| Box::pin(async { Ok(()) }))).unwrap(),
        );

        let mut ctx = Context::test(Method::Get, "/missing");
        engine.run_http(&mut ctx).await;
        assert_eq!(ctx.response.status, 404);
        assert!(ctx.response.body_str().unwrap().contains("GET /only"));
    }

    #[tokio::test]
    async fn test_middleware_end_skips_handler_but_flushes_queue() {
        let engine = {
            let mut e = test_engine();
            e.middleware.push(middleware_fn(|ctx| {
                Box::pin(async move {
                    ctx.print("from middleware");
                    Ok(Flow::End)
                })
            }));
            e
        };
        add_route(
            &engine,
            Route::new(
                Method::Get,
                "/short",
                handler(|ctx| {
                    Box::pin(async move {
                        ctx.print("handler ran");
                        Ok(())
                    })
                }),
            )
            .unwrap(),
        );

        let mut ctx = Context::test(Method::Get, "/short");
        engine.run_http(&mut ctx).await;
        assert_eq!(ctx.response.body_str(), Some("from middleware"));
    }

    #[tokio::test]
    async fn test_middleware_error_falls_back_to_500() {
        let engine = {
            let mut e = test_engine();
            e.middleware.push(middleware_fn(|_ctx| {
                Box::pin(async { Err(Error::middleware("boom")) })
            }));
            e
        };
        add_route(
            &engine,
            Route::new(Method::Get, "/x", handler(|_ctx| Box::pin(async { Ok(()) }))).unwrap(),
        );

        let mut ctx = Context::test(Method::Get, "/x");
        engine.run_http(&mut ctx).await;
        assert_eq!(ctx.response.status, 500);
        assert!(ctx.response.body_str().unwrap().contains("boom"));
    }

    #[tokio::test]
    async fn test_validator_status_rejection_raises_no_event() {
        let engine = {
            let mut e = test_engine();
            e.validators.push(validator_fn(|ctx| {
                Box::pin(async move {
                    ctx.set_status(403);
                    Ok(Flow::Continue)
                })
            }));
            e
        };
        add_route(
            &engine,
            Route::new(
                Method::Get,
                "/secure",
                handler(|ctx| {
                    Box::pin(async move {
                        ctx.print("never");
                        Ok(())
                    })
                }),
            )
            .unwrap(),
        );

        let mut ctx = Context::test(Method::Get, "/secure");
        engine.run_http(&mut ctx).await;
        assert_eq!(ctx.response.status, 403);
        assert!(ctx.response.body.is_empty());
    }

    #[tokio::test]
    async fn test_rate_limit_rejection_sets_headers() {
        let engine = {
            let mut e = test_engine();
            e.config.rate_limits.push(RateRule {
                id: "api".into(),
                max_hits: 1,
                window_ms: 60_000,
                penalty_ms: 0,
            });
            e
        };
        add_route(
            &engine,
            Route::new(Method::Get, "/limited", handler(|_ctx| Box::pin(async { Ok(()) }))).unwrap(),
        );

        let mut ok = Context::test(Method::Get, "/limited");
        engine.run_http(&mut ok).await;
        assert_eq!(ok.response.status, 200);
        assert_eq!(ok.response.headers["x-ratelimit-remaining"], "0");

        let mut rejected = Context::test(Method::Get, "/limited");
        engine.run_http(&mut rejected).await;
        assert_eq!(rejected.response.status, 429);
        assert_eq!(rejected.response.headers["x-ratelimit-limit"], "1");
    }

    #[tokio::test]
    async fn test_custom_not_found_handler_runs() {
        let engine = {
            let mut e = test_engine();
            e.dispatcher.on(
                EventKind::NotFound,
                event_handler(|ctx, _| {
                    Box::pin(async move {
                        ctx.set_status(404);
                        ctx.defer(TaskPhase::Body, |ctx| {
                            Box::pin(async move {
                                ctx.response.body.extend_from_slice(b"custom miss");
                                Ok(())
                            })
                        });
                        Ok(())
                    })
                }),
            );
            e
        };

        let mut ctx = Context::test(Method::Get, "/nowhere");
        engine.run_http(&mut ctx).await;
        assert_eq!(ctx.response.status, 404);
        assert_eq!(ctx.response.body_str(), Some("custom miss"));
    }

    #[tokio::test]
    async fn test_resolution_cache_survives_silent_removal() {
        let engine = {
            let mut e = test_engine();
            e.config.cache = CacheConfig {
                enabled: true,
                limit: 16,
            };
            e
        };
        add_route(
            &engine,
            Route::new(
                Method::Get,
                "/kept",
                handler(|ctx| {
                    Box::pin(async move {
                        ctx.print("hit");
                        Ok(())
                    })
                }),
            )
            .unwrap(),
        );

        let mut first = Context::test(Method::Get, "/kept");
        engine.run_http(&mut first).await;
        assert_eq!(first.response.body_str(), Some("hit"));

        // Empty the table without invalidating; the cached target still serves.
        *engine.registry.write().unwrap() = RouteRegistry::new();
        let mut second = Context::test(Method::Get, "/kept");
        engine.run_http(&mut second).await;
        assert_eq!(second.response.body_str(), Some("hit"));

        engine.invalidate_caches();
        let mut third = Context::test(Method::Get, "/kept");
        engine.run_http(&mut third).await;
        assert_eq!(third.response.status, 404);
    }

    #[tokio::test]
    async fn test_emit_applies_negotiated_compression() {
        let engine = {
            let mut e = test_engine();
            e.compressor = Some(Arc::new(|encoding, body: &[u8]| {
                let mut out = format!("{}:", encoding.token()).into_bytes();
                out.extend_from_slice(body);
                out
            }));
            e
        };

        let mut headers = hyper::HeaderMap::new();
        headers.insert("accept-encoding", "gzip, deflate".parse().unwrap());
        let mut ctx = Context::new(
            Transport::Http,
            Method::Get,
            "/",
            headers,
            "127.0.0.1".parse().unwrap(),
            &crate::route::ContextSeed::None,
            Arc::new(TokioFileSystem),
        );
        ctx.response.body = b"payload".to_vec();

        let response = engine.emit(&mut ctx);
        assert_eq!(response.headers()["content-encoding"], "gzip");
        let body = http_body_util::BodyExt::collect(response.into_body())
            .await
            .unwrap()
            .to_bytes();
        assert_eq!(&body[..], b"gzip:payload");
    }

    #[tokio::test]
    async fn test_cors_preflight_short_circuits() {
        let engine = {
            let mut e = test_engine();
            e.config.cors.enabled = true;
            e
        };

        let mut ctx = Context::test(Method::Options, "/anything");
        engine.run_http(&mut ctx).await;
        assert_eq!(ctx.response.status, 204);
        assert_eq!(ctx.response.headers["access-control-allow-origin"], "*");
    }
}
