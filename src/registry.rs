//! # Route Registry
//!
//! Ordered collections of HTTP routes, WebSocket routes and static-file
//! mounts. Registration order is the tie-break policy: the dispatcher scans
//! in order and the first match wins, so callers control precedence by
//! registration order.
//!
//! A registered `on_change` callback fires synchronously on every add and
//! remove so dependent caches can be invalidated.

use crate::route::{Route, StaticMount, WsRoute};
use std::fmt;
use std::sync::Arc;

/// Selector for removing a previously registered route
#[derive(Clone, Copy)]
pub enum RouteSelector<'a> {
    /// Remove by normalized pattern equality
    Pattern(&'a str),
    /// Remove by identity of the originally registered value
    Instance(&'a Arc<Route>),
}

/// Selector for removing a WebSocket route
#[derive(Clone, Copy)]
pub enum WsRouteSelector<'a> {
    /// Remove by normalized pattern equality
    Pattern(&'a str),
    /// Remove by identity of the originally registered value
    Instance(&'a Arc<WsRoute>),
}

/// Immutable view of the registered routes, handed to the dispatcher
#[derive(Clone, Default)]
pub struct RouteTable {
    /// HTTP routes in registration order
    pub http: Vec<Arc<Route>>,
    /// WebSocket routes in registration order
    pub ws: Vec<Arc<WsRoute>>,
    /// Static mounts in registration order
    pub mounts: Vec<Arc<StaticMount>>,
}

impl fmt::Debug for RouteTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteTable")
            .field("http", &self.http.len())
            .field("ws", &self.ws.len())
            .field("mounts", &self.mounts.len())
            .finish()
    }
}

/// Ordered route collections with change notification
#[derive(Default)]
pub struct RouteRegistry {
    http: Vec<Arc<Route>>,
    ws: Vec<Arc<WsRoute>>,
    mounts: Vec<Arc<StaticMount>>,
    on_change: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl RouteRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the change callback (replaces any previous one)
    pub fn set_on_change(&mut self, callback: Arc<dyn Fn() + Send + Sync>) {
        self.on_change = Some(callback);
    }

    fn changed(&self) {
        if let Some(cb) = &self.on_change {
            cb();
        }
    }

    /// Register an HTTP route; returns the shared handle used for
    /// identity-based removal
    pub fn add_http(&mut self, route: Route) -> Arc<Route> {
        let route = Arc::new(route);
        self.http.push(Arc::clone(&route));
        self.changed();
        route
    }

    /// Register a WebSocket route
    pub fn add_ws(&mut self, route: WsRoute) -> Arc<WsRoute> {
        let route = Arc::new(route);
        self.ws.push(Arc::clone(&route));
        self.changed();
        route
    }

    /// Register a static mount
    pub fn add_mount(&mut self, mount: StaticMount) -> Arc<StaticMount> {
        let mount = Arc::new(mount);
        self.mounts.push(Arc::clone(&mount));
        self.changed();
        mount
    }

    /// Remove HTTP routes matching the selector; returns how many were
    /// removed
    pub fn remove_http(&mut self, selector: RouteSelector<'_>) -> usize {
        let before = self.http.len();
        self.http.retain(|route| match selector {
            RouteSelector::Pattern(pattern) => {
                route.path.pattern() != crate::matcher::normalize_path(pattern)
            }
            RouteSelector::Instance(instance) => !Arc::ptr_eq(route, instance),
        });
        let removed = before - self.http.len();
        if removed > 0 {
            self.changed();
        }
        removed
    }

    /// Remove WebSocket routes matching the selector
    pub fn remove_ws(&mut self, selector: WsRouteSelector<'_>) -> usize {
        let before = self.ws.len();
        self.ws.retain(|route| match selector {
            WsRouteSelector::Pattern(pattern) => {
                route.path.pattern() != crate::matcher::normalize_path(pattern)
            }
            WsRouteSelector::Instance(instance) => !Arc::ptr_eq(route, instance),
        });
        let removed = before - self.ws.len();
        if removed > 0 {
            self.changed();
        }
        removed
    }

    /// Remove a static mount by prefix; returns how many were removed
    pub fn remove_mount(&mut self, prefix: &str) -> usize {
        let normalized = crate::matcher::normalize_path(prefix);
        let before = self.mounts.len();
        self.mounts.retain(|mount| mount.prefix != normalized);
        let removed = before - self.mounts.len();
        if removed > 0 {
            self.changed();
        }
        removed
    }

    /// Snapshot the current collections for the dispatcher
    #[must_use]
    pub fn snapshot(&self) -> RouteTable {
        RouteTable {
            http: self.http.clone(),
            ws: self.ws.clone(),
            mounts: self.mounts.clone(),
        }
    }

    /// `METHOD /pattern` pairs of every registered route, for the built-in
    /// 404 listing
    #[must_use]
    pub fn listing(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .http
            .iter()
            .map(|r| format!("{} {}", r.method, r.path.pattern()))
            .collect();
        out.extend(self.ws.iter().map(|r| format!("WS {}", r.path.pattern())));
        out
    }

    /// Number of registered HTTP routes
    #[must_use]
    pub fn len(&self) -> usize {
        self.http.len() + self.ws.len() + self.mounts.len()
    }

    /// Whether nothing is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for RouteRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteRegistry")
            .field("http", &self.http.len())
            .field("ws", &self.ws.len())
            .field("mounts", &self.mounts.len())
            .field("on_change", &self.on_change.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::{handler, Handler, Method, StaticOptions};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn noop() -> Handler {
        handler(|_ctx| Box::pin(async { Ok(()) }))
    }

    #[test]
    fn test_registration_order_preserved() {
        let mut registry = RouteRegistry::new();
        registry.add_http(Route::new(Method::Get, "/a", noop()).unwrap());
        registry.add_http(Route::new(Method::Get, "/b", noop()).unwrap());
        registry.add_http(Route::new(Method::Get, "/c", noop()).unwrap());

        let table = registry.snapshot();
        let patterns: Vec<&str> = table.http.iter().map(|r| r.path.pattern()).collect();
        assert_eq!(patterns, vec!["/a", "/b", "/c"]);
    }

    #[test]
    fn test_remove_by_pattern() {
        let mut registry = RouteRegistry::new();
        registry.add_http(Route::new(Method::Get, "/users/{id}", noop()).unwrap());
        registry.add_http(Route::new(Method::Get, "/other", noop()).unwrap());

        // un-normalized input still matches the stored pattern
        assert_eq!(registry.remove_http(RouteSelector::Pattern("/users/{id}/")), 1);
        assert_eq!(registry.snapshot().http.len(), 1);
    }

    #[test]
    fn test_remove_by_identity() {
        let mut registry = RouteRegistry::new();
        let first = registry.add_http(Route::new(Method::Get, "/same", noop()).unwrap());
        registry.add_http(Route::new(Method::Get, "/same", noop()).unwrap());

        assert_eq!(registry.remove_http(RouteSelector::Instance(&first)), 1);
        let table = registry.snapshot();
        assert_eq!(table.http.len(), 1);
        assert!(!Arc::ptr_eq(&table.http[0], &first));
    }

    #[test]
    fn test_on_change_fires_on_add_and_remove() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);

        let mut registry = RouteRegistry::new();
        registry.set_on_change(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        registry.add_http(Route::new(Method::Get, "/a", noop()).unwrap());
        registry.add_mount(StaticMount::new("/static", "/srv", StaticOptions::default()));
        registry.remove_http(RouteSelector::Pattern("/a"));
        assert_eq!(count.load(Ordering::SeqCst), 3);

        // removing nothing does not notify
        registry.remove_http(RouteSelector::Pattern("/a"));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_listing_includes_ws_routes() {
        let mut registry = RouteRegistry::new();
        registry.add_http(Route::new(Method::Post, "/users", noop()).unwrap());
        registry.add_ws(WsRoute::new("/live").unwrap());

        let listing = registry.listing();
        assert!(listing.contains(&"POST /users".to_string()));
        assert!(listing.contains(&"WS /live".to_string()));
    }
}
