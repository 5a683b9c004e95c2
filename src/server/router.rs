//! The route table.
//!
//! Routes are keyed on the literal method and path. There is no pattern
//! matching of any kind: `/login`, `/Login` and `/login/` are three different
//! routes, and a request whose method differs from the registered one misses
//! just like an unknown path does.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;

use log::{error, info};

use crate::parser::{HttpRequest, Method};
use crate::server::handler::{boxed, HandlerFn};
use crate::server::{Error, HttpResponse, StatusCode};

/// A (method, path) pair identifying a registered handler.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RouteKey {
    pub method: String,
    pub path: String,
}

impl RouteKey {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
        }
    }
}

impl fmt::Display for RouteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.path)
    }
}

/// Maps route keys to handlers.
///
/// The table is filled before the server starts. [`crate::HttpServer::start`]
/// takes a snapshot behind an `Arc`, so later registrations never race with
/// dispatch.
#[derive(Clone, Default)]
pub struct Router {
    routes: HashMap<RouteKey, HandlerFn>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for the exact `method` and `path`.
    ///
    /// A second registration for the same pair replaces the first.
    pub fn register<F, Fut>(&mut self, method: impl Into<String>, path: impl Into<String>, handler: F)
    where
        F: Fn(HttpRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<HttpResponse, Error>> + Send + 'static,
    {
        let key = RouteKey::new(method, path);
        info!("add route {key}");
        self.routes.insert(key, boxed(handler));
    }

    pub fn get<F, Fut>(&mut self, path: impl Into<String>, handler: F)
    where
        F: Fn(HttpRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<HttpResponse, Error>> + Send + 'static,
    {
        self.register(Method::GET.as_str(), path, handler);
    }

    pub fn post<F, Fut>(&mut self, path: impl Into<String>, handler: F)
    where
        F: Fn(HttpRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<HttpResponse, Error>> + Send + 'static,
    {
        self.register(Method::POST.as_str(), path, handler);
    }

    pub fn delete<F, Fut>(&mut self, path: impl Into<String>, handler: F)
    where
        F: Fn(HttpRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<HttpResponse, Error>> + Send + 'static,
    {
        self.register(Method::DELETE.as_str(), path, handler);
    }

    /// Look up the handler for an exact (method, path) pair.
    pub fn dispatch(&self, method: &str, path: &str) -> Option<&HandlerFn> {
        // HashMap<RouteKey, _> can't be queried by borrowed parts, so build the key
        self.routes.get(&RouteKey::new(method, path))
    }

    /// Run the matching handler, or produce the 404 response on a miss.
    ///
    /// A handler that returns `Err` is answered with a 500.
    pub async fn handle(&self, request: HttpRequest) -> HttpResponse {
        let Some(handler) = self.dispatch(&request.method, &request.path) else {
            return HttpResponse::not_found();
        };

        let key = format!("{} {}", request.method, request.path);
        match handler(request).await {
            Ok(response) => response,
            Err(e) => {
                error!("handler for {key} failed: {e}");
                HttpResponse::text(StatusCode::InternalServerError, format!("Internal server error: {e}"))
            }
        }
    }

    pub fn contains(&self, method: &str, path: &str) -> bool {
        self.dispatch(method, path).is_some()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Registered keys, sorted by path then method.
    pub fn routes(&self) -> Vec<&RouteKey> {
        let mut keys: Vec<&RouteKey> = self.routes.keys().collect();
        keys.sort_by(|a, b| a.path.cmp(&b.path).then_with(|| a.method.cmp(&b.method)));
        keys
    }
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router").field("routes", &self.routes()).finish()
    }
}
