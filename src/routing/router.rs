//! Route table construction and lookup.
//!
//! # Responsibilities
//! - Collect routes and groups at startup
//! - Freeze them into an immutable `Router`
//! - Resolve `method + path` to the ordered handler list
//!
//! # Design Decisions
//! - Immutable after `build()` (thread-safe without locks)
//! - O(1) lookup via HashMap keyed by `METHOD::path`
//! - Group handlers are copied into each route at registration time, so
//!   lookup never walks a group chain
//! - Registering the same key twice replaces the earlier route

use std::collections::HashMap;

use crate::routing::{DefaultHandlers, Handler};

/// Add a leading slash, drop one trailing slash, fold case.
///
/// The root path normalizes to the empty string.
pub fn normalize_path(path: &str) -> String {
    let mut normalized = String::with_capacity(path.len() + 1);
    if !path.starts_with('/') {
        normalized.push('/');
    }
    normalized.push_str(path);
    if normalized.ends_with('/') {
        normalized.pop();
    }
    normalized.to_ascii_lowercase()
}

/// Lookup key for a route.
pub fn route_key(method: &str, path: &str) -> String {
    format!("{}::{}", method.to_ascii_uppercase(), normalize_path(path))
}

#[derive(Clone)]
struct Route {
    method: String,
    path: String,
    handlers: Vec<Handler>,
}

/// Mutable route table used during startup.
#[derive(Default)]
pub struct RouterBuilder {
    routes: HashMap<String, Route>,
    defaults: DefaultHandlers,
}

impl RouterBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handlers` for `method path`; they run in the given order.
    pub fn register(
        &mut self,
        method: &str,
        path: &str,
        handlers: impl IntoIterator<Item = Handler>,
    ) -> &mut Self {
        self.insert(method, &normalize_path(path), handlers.into_iter().collect());
        self
    }

    /// Open a group: every route registered through it gets `prefix`
    /// prepended and `handlers` run before its own.
    pub fn group(&mut self, prefix: &str, handlers: impl IntoIterator<Item = Handler>) -> Group<'_> {
        Group {
            builder: self,
            prefix: normalize_path(prefix),
            handlers: handlers.into_iter().collect(),
        }
    }

    /// Override the built-in handler for `status`.
    pub fn default_handler(&mut self, status: u16, handler: Handler) -> &mut Self {
        self.defaults.set(status, handler);
        self
    }

    fn insert(&mut self, method: &str, path: &str, handlers: Vec<Handler>) {
        let method = method.to_ascii_uppercase();
        let key = format!("{}::{}", method, path);
        let route = Route {
            method,
            path: path.to_string(),
            handlers,
        };
        if self.routes.insert(key, route).is_some() {
            tracing::warn!(path = %path, "Route registered twice, keeping the latest");
        }
    }

    /// Freeze the table.
    pub fn build(self) -> Router {
        Router {
            routes: self.routes,
            defaults: self.defaults,
        }
    }
}

/// Registration scope sharing a path prefix and leading handlers.
pub struct Group<'a> {
    builder: &'a mut RouterBuilder,
    prefix: String,
    handlers: Vec<Handler>,
}

impl Group<'_> {
    pub fn register(
        &mut self,
        method: &str,
        path: &str,
        handlers: impl IntoIterator<Item = Handler>,
    ) -> &mut Self {
        let path = format!("{}{}", self.prefix, normalize_path(path));
        let chain = self.handlers.iter().cloned().chain(handlers).collect();
        self.builder.insert(method, &path, chain);
        self
    }

    /// Nested group; ancestor handlers run first, root to leaf.
    pub fn group(&mut self, prefix: &str, handlers: impl IntoIterator<Item = Handler>) -> Group<'_> {
        Group {
            prefix: format!("{}{}", self.prefix, normalize_path(prefix)),
            handlers: self.handlers.iter().cloned().chain(handlers).collect(),
            builder: &mut *self.builder,
        }
    }
}

/// Immutable route table.
pub struct Router {
    routes: HashMap<String, Route>,
    defaults: DefaultHandlers,
}

impl Router {
    pub fn builder() -> RouterBuilder {
        RouterBuilder::new()
    }

    /// Ordered handlers for a request, if a route matches.
    pub fn lookup(&self, method: &str, path: &str) -> Option<&[Handler]> {
        self.routes
            .get(&route_key(method, path))
            .map(|route| route.handlers.as_slice())
    }

    pub fn defaults(&self) -> &DefaultHandlers {
        &self.defaults
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// `(method, path, handler count)` for every route, sorted by path.
    pub fn routes(&self) -> Vec<(&str, &str, usize)> {
        let mut routes: Vec<_> = self
            .routes
            .values()
            .map(|r| (r.method.as_str(), r.path.as_str(), r.handlers.len()))
            .collect();
        routes.sort_by(|a, b| a.1.cmp(b.1).then(a.0.cmp(b.0)));
        routes
    }

    /// Log the route table at startup.
    pub fn log_routes(&self) {
        for (method, path, handlers) in self.routes() {
            let path = if path.is_empty() { "/" } else { path };
            tracing::info!(method = %method, path = %path, handlers, "Route registered");
        }
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("routes", &self.routes.len())
            .finish_non_exhaustive()
    }
}
