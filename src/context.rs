//! # Request/Connection Context
//!
//! One [`Context`] exists per HTTP request or per WebSocket connection. It
//! carries the parsed request, the response draft, the deferred task queue,
//! the active lifecycle event and the abort flag through every pipeline
//! stage.
//!
//! Mutation contract: each stage receives `&mut Context` and only writes the
//! fields it owns — resolution fills `params`, middleware/validators/handlers
//! write the draft and the queue, the dispatcher owns `event`. For WebSocket
//! connections the same instance is reused across open, every message and
//! close; it is created at upgrade time and destroyed when close finishes.

use crate::error::{Error, Result};
use crate::events::EventKind;
use crate::matcher::{self, Params};
use crate::ratelimit::Transport;
use crate::route::{ContextSeed, HandlerFuture};
use crate::static_files::FileSystem;
use hyper::body::Bytes;
use hyper::HeaderMap;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// Which deferred bucket a task belongs to
///
/// Header tasks always fully drain before any body task runs, because
/// header values may need asynchronous serialization before the status
/// line can be emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskPhase {
    /// Context-affecting work (header/cookie serialization)
    Headers,
    /// Execution-affecting work (body writes, file streaming)
    Body,
}

/// A deferred response-affecting task
///
/// `Sync` is required so a queue-holding `Context` can be shared across the
/// request task's await points.
pub type Task = Box<dyn for<'a> FnOnce(&'a mut Context) -> HandlerFuture<'a> + Send + Sync>;

#[derive(Default)]
pub(crate) struct TaskQueue {
    headers: VecDeque<Task>,
    body: VecDeque<Task>,
}

impl TaskQueue {
    fn push(&mut self, phase: TaskPhase, task: Task) {
        match phase {
            TaskPhase::Headers => self.headers.push_back(task),
            TaskPhase::Body => self.body.push_back(task),
        }
    }

    fn pop(&mut self) -> Option<Task> {
        self.headers.pop_front().or_else(|| self.body.pop_front())
    }

    fn discard(&mut self) {
        self.headers.clear();
        self.body.clear();
    }

    fn len(&self) -> usize {
        self.headers.len() + self.body.len()
    }
}

/// The response under construction
///
/// Nothing here touches the transport until emission; handlers mutate the
/// draft (directly or through deferred tasks) and the server serializes it
/// once the queue has drained.
#[derive(Debug, Clone)]
pub struct ResponseDraft {
    /// HTTP status code
    pub status: u16,
    /// Response headers
    pub headers: HashMap<String, String>,
    /// `Set-Cookie` values, one per entry
    pub cookies: Vec<String>,
    /// Response body bytes
    pub body: Vec<u8>,
}

impl Default for ResponseDraft {
    fn default() -> Self {
        Self {
            status: 200,
            headers: HashMap::new(),
            cookies: Vec::new(),
            body: Vec::new(),
        }
    }
}

impl ResponseDraft {
    /// Whether the drafted status is in the 2xx range
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Body as UTF-8 text, if it is valid
    #[must_use]
    pub fn body_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }
}

/// Custom per-route context value
#[derive(Debug, Clone)]
enum CustomState {
    Owned(Value),
    Shared(Arc<Mutex<Value>>),
}

impl CustomState {
    fn from_seed(seed: &ContextSeed) -> Self {
        match seed {
            ContextSeed::None => Self::Owned(Value::Null),
            ContextSeed::PerCall(value) => Self::Owned(value.clone()),
            ContextSeed::Shared(shared) => Self::Shared(Arc::clone(shared)),
        }
    }
}

/// Per-request / per-connection context
pub struct Context {
    /// Transport the context belongs to
    pub transport: Transport,
    /// Request method
    pub method: crate::route::Method,
    /// Normalized request path (query stripped)
    pub path: String,
    /// Raw query string, if any
    pub query_string: Option<String>,
    /// Extracted path parameters, filled at route resolution
    pub params: Params,
    /// Client identity used for rate-limit keys
    pub client_ip: IpAddr,
    /// Accumulated request body
    pub body: Option<Bytes>,
    /// The response draft
    pub response: ResponseDraft,
    /// Active lifecycle event, set by the dispatcher
    pub event: Option<EventKind>,
    query_params: HashMap<String, String>,
    headers: HeaderMap,
    cookies: HashMap<String, String>,
    queue: TaskQueue,
    abort: CancellationToken,
    custom: CustomState,
    pub(crate) fs: Arc<dyn FileSystem>,
    pub(crate) limiter: Option<crate::ratelimit::RateLimiter>,
    pub(crate) rate_keys: Vec<crate::ratelimit::RateKey>,
}

impl Context {
    /// Build a context from parsed request parts
    ///
    /// `target` is the request target (path plus optional `?query`).
    pub(crate) fn new(
        transport: Transport,
        method: crate::route::Method,
        target: &str,
        headers: HeaderMap,
        client_ip: IpAddr,
        seed: &ContextSeed,
        fs: Arc<dyn FileSystem>,
    ) -> Self {
        let (raw_path, query_string) = match target.split_once('?') {
            Some((p, q)) => (p, Some(q.to_string())),
            None => (target, None),
        };

        let query_params = parse_query_string(query_string.as_deref());
        let cookies = parse_cookies(&headers);

        Self {
            transport,
            method,
            path: matcher::normalize_path(raw_path),
            query_string,
            params: Params::new(),
            client_ip,
            body: None,
            response: ResponseDraft::default(),
            event: None,
            query_params,
            headers,
            cookies,
            queue: TaskQueue::default(),
            abort: CancellationToken::new(),
            custom: CustomState::from_seed(seed),
            fs,
            limiter: None,
            rate_keys: Vec::new(),
        }
    }

    /// Replace the custom context value with a route's initial seed.
    pub(crate) fn apply_seed(&mut self, seed: &ContextSeed) {
        if !matches!(seed, ContextSeed::None) {
            self.custom = CustomState::from_seed(seed);
        }
    }

    /// Undo the rate-limit hits recorded for this request so it does not
    /// count against any window.
    pub fn skip_rate_limit(&self) {
        if let Some(limiter) = &self.limiter {
            for key in &self.rate_keys {
                limiter.skip(key);
            }
        }
    }

    /// Reset every rate-limit window this request touched.
    pub fn clear_rate_limit(&self) {
        if let Some(limiter) = &self.limiter {
            for key in &self.rate_keys {
                limiter.clear(key);
            }
        }
    }

    /// Get a request header value by name (case-insensitive)
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Set or override a request header
    pub fn set_request_header(&mut self, name: &str, value: &str) {
        if let (Ok(n), Ok(v)) = (
            hyper::header::HeaderName::from_bytes(name.as_bytes()),
            hyper::header::HeaderValue::from_str(value),
        ) {
            self.headers.insert(n, v);
        }
    }

    /// Get a cookie value by name
    #[must_use]
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }

    /// Get a query parameter by name
    #[must_use]
    pub fn query(&self, name: &str) -> Option<&str> {
        self.query_params.get(name).map(String::as_str)
    }

    /// All query parameters
    #[must_use]
    pub fn query_map(&self) -> &HashMap<String, String> {
        &self.query_params
    }

    /// Get an extracted path parameter by name
    #[must_use]
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    /// Request body as UTF-8 text
    #[must_use]
    pub fn body_str(&self) -> Option<&str> {
        self.body
            .as_ref()
            .and_then(|b| std::str::from_utf8(b).ok())
    }

    /// Set the drafted response status (takes effect immediately, so
    /// validators can mark the pipeline handled)
    pub fn set_status(&mut self, status: u16) {
        self.response.status = status;
    }

    /// Enqueue a deferred task into the given bucket
    pub fn defer<F>(&mut self, phase: TaskPhase, task: F)
    where
        F: for<'a> FnOnce(&'a mut Context) -> HandlerFuture<'a> + Send + Sync + 'static,
    {
        self.queue.push(phase, Box::new(task));
    }

    /// Queue a response header write
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        self.defer(TaskPhase::Headers, move |ctx| {
            Box::pin(async move {
                ctx.response.headers.insert(name, value);
                Ok(())
            })
        });
    }

    /// Queue a response header whose value needs asynchronous serialization
    pub fn defer_header<F>(&mut self, name: impl Into<String>, value: F)
    where
        F: Future<Output = Result<String>> + Send + Sync + 'static,
    {
        let name = name.into();
        self.defer(TaskPhase::Headers, move |ctx| {
            Box::pin(async move {
                let value = value.await?;
                ctx.response.headers.insert(name, value);
                Ok(())
            })
        });
    }

    /// Queue a `Set-Cookie` write
    pub fn set_cookie(&mut self, name: &str, value: &str) {
        let line = format!("{name}={value}");
        self.defer(TaskPhase::Headers, move |ctx| {
            Box::pin(async move {
                ctx.response.cookies.push(line);
                Ok(())
            })
        });
    }

    /// Queue a body write
    pub fn print(&mut self, text: impl Into<String>) {
        let text = text.into();
        self.defer(TaskPhase::Body, move |ctx| {
            Box::pin(async move {
                ctx.response.body.extend_from_slice(text.as_bytes());
                Ok(())
            })
        });
    }

    /// Queue a raw body write
    pub fn print_bytes(&mut self, bytes: Vec<u8>) {
        self.defer(TaskPhase::Body, move |ctx| {
            Box::pin(async move {
                ctx.response.body.extend_from_slice(&bytes);
                Ok(())
            })
        });
    }

    /// Queue a file's contents into the body, read through the filesystem
    /// collaborator when the queue drains
    pub fn print_file(&mut self, path: impl Into<PathBuf>) {
        let path = path.into();
        self.defer(TaskPhase::Body, move |ctx| {
            Box::pin(async move {
                let fs = Arc::clone(&ctx.fs);
                let bytes = fs
                    .read(&path)
                    .await
                    .map_err(|e| Error::Handler(format!("print_file {}: {e}", path.display())))?;
                ctx.response.body.extend_from_slice(&bytes);
                Ok(())
            })
        });
    }

    /// Abort token for this connection; long-lived handlers register on it
    /// and release their resources when it fires
    #[must_use]
    pub fn abort_signal(&self) -> CancellationToken {
        self.abort.clone()
    }

    /// Whether the transport went away
    #[must_use]
    pub fn aborted(&self) -> bool {
        self.abort.is_cancelled()
    }

    /// Mark the transport as gone; suppresses further queue draining
    pub(crate) fn abort(&self) {
        self.abort.cancel();
    }

    /// Snapshot of the custom context value
    #[must_use]
    pub fn state(&self) -> Value {
        match &self.custom {
            CustomState::Owned(value) => value.clone(),
            CustomState::Shared(shared) => {
                shared.lock().unwrap_or_else(|e| e.into_inner()).clone()
            }
        }
    }

    /// Mutate the custom context value in place
    pub fn with_state<R>(&mut self, f: impl FnOnce(&mut Value) -> R) -> R {
        match &mut self.custom {
            CustomState::Owned(value) => f(value),
            CustomState::Shared(shared) => {
                f(&mut shared.lock().unwrap_or_else(|e| e.into_inner()))
            }
        }
    }

    /// Number of queued deferred tasks
    #[must_use]
    pub fn pending_tasks(&self) -> usize {
        self.queue.len()
    }

    /// Drop the queued tasks for a fresh per-message queue
    pub(crate) fn reset_queue(&mut self) {
        self.queue.discard();
    }

    /// Drain the deferred queue: header bucket fully first, then body.
    ///
    /// Stops at the first failing task; the remainder is discarded
    /// (at-most-once: a partially written body is terminal). Draining also
    /// stops silently once the transport is aborted.
    pub(crate) async fn drain_deferred(&mut self) -> Result<()> {
        while let Some(task) = self.queue.pop() {
            if self.aborted() {
                self.queue.discard();
                return Ok(());
            }
            if let Err(e) = task(self).await {
                self.queue.discard();
                return Err(e);
            }
        }
        Ok(())
    }

    /// Bare context for unit tests
    #[cfg(test)]
    pub(crate) fn test(method: crate::route::Method, target: &str) -> Self {
        Self::new(
            Transport::Http,
            method,
            target,
            HeaderMap::new(),
            "127.0.0.1".parse().unwrap(),
            &ContextSeed::None,
            Arc::new(crate::static_files::TokioFileSystem),
        )
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("transport", &self.transport)
            .field("method", &self.method)
            .field("path", &self.path)
            .field("params", &self.params)
            .field("client_ip", &self.client_ip)
            .field("status", &self.response.status)
            .field("event", &self.event)
            .field("pending_tasks", &self.queue.len())
            .finish_non_exhaustive()
    }
}

/// Parse a query string into a map (URL-decoded, last value wins)
fn parse_query_string(query: Option<&str>) -> HashMap<String, String> {
    query
        .map(|q| {
            q.split('&')
                .filter_map(|pair| {
                    let mut parts = pair.splitn(2, '=');
                    let key = parts.next()?;
                    let value = parts.next().unwrap_or("");
                    Some((matcher::url_decode(key), matcher::url_decode(value)))
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Parse the `Cookie` header into a map
fn parse_cookies(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .get(hyper::header::COOKIE)
        .and_then(|v| v.to_str().ok())
        .map(|raw| {
            raw.split(';')
                .filter_map(|pair| {
                    let (name, value) = pair.trim().split_once('=')?;
                    Some((name.to_string(), value.to_string()))
                })
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::Method;

    #[test]
    fn test_context_shareable_across_tasks() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Context>();
    }

    #[test]
    fn test_query_parsing() {
        let ctx = Context::test(Method::Get, "/search?q=hello+world&page=2&city=Z%C3%BCrich");
        assert_eq!(ctx.path, "/search");
        assert_eq!(ctx.query("q"), Some("hello world"));
        assert_eq!(ctx.query("page"), Some("2"));
        assert_eq!(ctx.query("city"), Some("Zürich"));
        assert_eq!(ctx.query("missing"), None);
    }

    #[test]
    fn test_cookie_parsing() {
        let mut headers = HeaderMap::new();
        headers.insert(
            hyper::header::COOKIE,
            "session=abc123; theme=dark".parse().unwrap(),
        );
        let cookies = parse_cookies(&headers);
        assert_eq!(cookies.get("session"), Some(&"abc123".to_string()));
        assert_eq!(cookies.get("theme"), Some(&"dark".to_string()));
    }

    #[tokio::test]
    async fn test_header_bucket_drains_before_body() {
        let mut ctx = Context::test(Method::Get, "/");
        ctx.print("body");
        ctx.set_header("x-order", "first");
        ctx.drain_deferred().await.unwrap();

        assert_eq!(ctx.response.headers.get("x-order").unwrap(), "first");
        assert_eq!(ctx.response.body_str(), Some("body"));
    }

    #[tokio::test]
    async fn test_failing_task_discards_remainder() {
        let mut ctx = Context::test(Method::Get, "/");
        ctx.print("kept");
        ctx.defer(TaskPhase::Body, |_ctx| {
            Box::pin(async { Err(Error::handler("boom")) })
        });
        ctx.print("discarded");

        let err = ctx.drain_deferred().await.unwrap_err();
        assert!(matches!(err, Error::Handler(_)));
        assert_eq!(ctx.response.body_str(), Some("kept"));
        assert_eq!(ctx.pending_tasks(), 0);
    }

    #[tokio::test]
    async fn test_abort_suppresses_draining() {
        let mut ctx = Context::test(Method::Get, "/");
        ctx.print("never written");
        ctx.abort();
        ctx.drain_deferred().await.unwrap();
        assert!(ctx.response.body.is_empty());
    }

    #[tokio::test]
    async fn test_deferred_header_serialization() {
        let mut ctx = Context::test(Method::Get, "/");
        ctx.defer_header("etag", async { Ok("\"abc\"".to_string()) });
        ctx.drain_deferred().await.unwrap();
        assert_eq!(ctx.response.headers.get("etag").unwrap(), "\"abc\"");
    }

    #[test]
    fn test_custom_state_owned() {
        let mut ctx = Context::test(Method::Get, "/");
        ctx.with_state(|v| *v = serde_json::json!({"count": 1}));
        assert_eq!(ctx.state()["count"], 1);
    }

    #[test]
    fn test_custom_state_shared_across_contexts() {
        let shared = Arc::new(Mutex::new(serde_json::json!({"hits": 0})));
        let seed = ContextSeed::Shared(Arc::clone(&shared));

        let mut a = Context::new(
            Transport::Http,
            Method::Get,
            "/",
            HeaderMap::new(),
            "127.0.0.1".parse().unwrap(),
            &seed,
            Arc::new(crate::static_files::TokioFileSystem),
        );
        a.with_state(|v| v["hits"] = serde_json::json!(5));

        let b = Context::new(
            Transport::Http,
            Method::Get,
            "/",
            HeaderMap::new(),
            "127.0.0.1".parse().unwrap(),
            &seed,
            Arc::new(crate::static_files::TokioFileSystem),
        );
        assert_eq!(b.state()["hits"], 5);
    }
}
