//! # Event/Error Dispatcher
//!
//! Central mapping from abstract lifecycle events (404, rate-limited,
//! per-phase errors) to either a user-registered handler or a built-in
//! fallback response.
//!
//! Every failure path in the lifecycle controller funnels through
//! [`EventDispatcher::dispatch`], which is the single place where "no user
//! handler registered" falls back to a plain-text response. A user handler
//! that itself fails is never re-entered for the same event kind; the
//! dispatcher logs and answers with the fixed fallback instead.

use crate::context::Context;
use crate::error::Error;
use crate::route::HandlerFuture;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{error, warn};

/// Closed set of lifecycle events the dispatcher understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// No route matched the request
    NotFound,
    /// A rate-limit counter exceeded its maximum
    RateLimited,
    /// A middleware failed
    MiddlewareError,
    /// A validator failed
    ValidatorError,
    /// The handler or a deferred response task failed
    HandlerError,
    /// The WebSocket upgrade gate refused the handshake
    UpgradeError,
}

impl EventKind {
    /// Status code of the built-in fallback response
    #[must_use]
    pub fn fallback_status(self) -> u16 {
        match self {
            Self::NotFound => 404,
            Self::RateLimited => 429,
            Self::UpgradeError => 403,
            Self::MiddlewareError | Self::ValidatorError | Self::HandlerError => 500,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NotFound => "not-found",
            Self::RateLimited => "rate-limited",
            Self::MiddlewareError => "middleware-error",
            Self::ValidatorError => "validator-error",
            Self::HandlerError => "handler-error",
            Self::UpgradeError => "upgrade-error",
        };
        write!(f, "{name}")
    }
}

/// Extra data accompanying a dispatched event
#[derive(Clone, Copy, Default)]
pub enum EventPayload<'a> {
    /// Nothing beyond the context
    #[default]
    None,
    /// The causing error, for diagnostic rendering
    Cause(&'a Error),
    /// Registered `METHOD /path` pairs, for the 404 listing
    Listing(&'a [String]),
}

impl EventPayload<'_> {
    /// The causing error, when present
    #[must_use]
    pub fn cause(&self) -> Option<&Error> {
        match self {
            Self::Cause(e) => Some(e),
            _ => None,
        }
    }
}

/// User-registered event handler
pub type EventHandler = Arc<
    dyn for<'a> Fn(&'a mut Context, EventPayload<'a>) -> HandlerFuture<'a> + Send + Sync,
>;

/// Wrap a closure as an [`EventHandler`]
pub fn event_handler<F>(f: F) -> EventHandler
where
    F: for<'a> Fn(&'a mut Context, EventPayload<'a>) -> HandlerFuture<'a> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Central lifecycle event dispatcher
#[derive(Clone, Default)]
pub struct EventDispatcher {
    handlers: HashMap<EventKind, EventHandler>,
}

impl EventDispatcher {
    /// Create a dispatcher with no user handlers
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a user handler for an event kind (replaces any previous one)
    pub fn on(&mut self, kind: EventKind, handler: EventHandler) {
        self.handlers.insert(kind, handler);
    }

    /// Whether a user handler is registered for `kind`
    #[must_use]
    pub fn has_handler(&self, kind: EventKind) -> bool {
        self.handlers.contains_key(&kind)
    }

    /// Route an event to its handler or the built-in fallback
    pub async fn dispatch(&self, kind: EventKind, ctx: &mut Context, payload: EventPayload<'_>) {
        if ctx.event == Some(kind) {
            // a failure while handling the same kind must not loop
            warn!(event = %kind, path = %ctx.path, "Recursive event suppressed");
            Self::built_in(kind, ctx, payload);
            return;
        }
        ctx.event = Some(kind);

        if let Some(cause) = payload.cause() {
            warn!(event = %kind, path = %ctx.path, error = %cause, "Lifecycle event");
        }

        match self.handlers.get(&kind) {
            Some(handler) => {
                if let Err(e) = handler(ctx, payload).await {
                    error!(event = %kind, error = %e, "Event handler failed, using fallback");
                    Self::built_in(kind, ctx, payload);
                }
            }
            None => Self::built_in(kind, ctx, payload),
        }
    }

    /// Fixed fallback response, written straight onto the draft
    fn built_in(kind: EventKind, ctx: &mut Context, payload: EventPayload<'_>) {
        ctx.response.status = kind.fallback_status();
        ctx.response
            .headers
            .insert("content-type".to_string(), "text/plain".to_string());

        let body = match (kind, payload) {
            (EventKind::NotFound, EventPayload::Listing(routes)) => {
                let mut text = format!("Not Found: {} {}\n\nRegistered routes:\n", ctx.method, ctx.path);
                for route in routes {
                    text.push_str(route);
                    text.push('\n');
                }
                text
            }
            (EventKind::NotFound, _) => format!("Not Found: {} {}\n", ctx.method, ctx.path),
            (EventKind::RateLimited, _) => "Too Many Requests\n".to_string(),
            (EventKind::UpgradeError, _) => "WebSocket upgrade refused\n".to_string(),
            (_, EventPayload::Cause(cause)) => format!("Internal Server Error\n\n{cause}\n"),
            _ => "Internal Server Error\n".to_string(),
        };
        ctx.response.body = body.into_bytes();
    }
}

impl fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::Method;

    #[tokio::test]
    async fn test_builtin_not_found_lists_routes() {
        let dispatcher = EventDispatcher::new();
        let mut ctx = Context::test(Method::Get, "/missing");
        let listing = vec!["GET /users/{id}".to_string(), "POST /users".to_string()];

        dispatcher
            .dispatch(EventKind::NotFound, &mut ctx, EventPayload::Listing(&listing))
            .await;

        assert_eq!(ctx.response.status, 404);
        let body = ctx.response.body_str().unwrap();
        assert!(body.contains("GET /users/{id}"));
        assert!(body.contains("POST /users"));
    }

    #[tokio::test]
    async fn test_builtin_statuses() {
        let dispatcher = EventDispatcher::new();

        let mut ctx = Context::test(Method::Get, "/");
        dispatcher
            .dispatch(EventKind::RateLimited, &mut ctx, EventPayload::None)
            .await;
        assert_eq!(ctx.response.status, 429);

        let mut ctx = Context::test(Method::Get, "/");
        let cause = Error::handler("boom");
        dispatcher
            .dispatch(EventKind::HandlerError, &mut ctx, EventPayload::Cause(&cause))
            .await;
        assert_eq!(ctx.response.status, 500);
        assert!(ctx.response.body_str().unwrap().contains("boom"));
    }

    #[tokio::test]
    async fn test_user_handler_overrides_builtin() {
        let mut dispatcher = EventDispatcher::new();
        dispatcher.on(
            EventKind::NotFound,
            event_handler(|ctx, _payload| {
                Box::pin(async move {
                    ctx.set_status(404);
                    ctx.response.body = b"custom page".to_vec();
                    Ok(())
                })
            }),
        );

        let mut ctx = Context::test(Method::Get, "/missing");
        dispatcher
            .dispatch(EventKind::NotFound, &mut ctx, EventPayload::None)
            .await;
        assert_eq!(ctx.response.body_str(), Some("custom page"));
    }

    #[tokio::test]
    async fn test_failing_handler_falls_back_without_recursion() {
        let mut dispatcher = EventDispatcher::new();
        dispatcher.on(
            EventKind::HandlerError,
            event_handler(|_ctx, _payload| {
                Box::pin(async { Err(Error::handler("error page also broke")) })
            }),
        );

        let mut ctx = Context::test(Method::Get, "/");
        let cause = Error::handler("original");
        dispatcher
            .dispatch(EventKind::HandlerError, &mut ctx, EventPayload::Cause(&cause))
            .await;

        assert_eq!(ctx.response.status, 500);
        assert!(ctx.response.body_str().unwrap().contains("original"));
    }

    #[tokio::test]
    async fn test_redispatch_same_kind_uses_builtin() {
        let mut dispatcher = EventDispatcher::new();
        dispatcher.on(
            EventKind::NotFound,
            event_handler(|ctx, _payload| {
                Box::pin(async move {
                    ctx.response.body = b"should not appear twice".to_vec();
                    Ok(())
                })
            }),
        );

        let mut ctx = Context::test(Method::Get, "/");
        ctx.event = Some(EventKind::NotFound);
        dispatcher
            .dispatch(EventKind::NotFound, &mut ctx, EventPayload::None)
            .await;

        // guard sends the second dispatch straight to the fallback
        assert!(ctx.response.body_str().unwrap().starts_with("Not Found"));
    }
}
