//! Method + path router.
//!
//! # Responsibilities
//! - Store routes in registration order
//! - Resolve a request to the first matching route's handler
//! - Hand out pooled parameter buffers and take them back
//!
//! # Design Decisions
//! - O(n) scan over routes (acceptable for typical route counts)
//! - A path that matches only under another method yields 405, not 404
//! - Routes without parameters never hold on to a buffer

use axum::http::{Method, StatusCode};

use super::matcher::{Pattern, PatternError};
use super::Router;
use crate::error::Error;
use crate::http::Request;
use crate::middleware::{handler_fn, Handler};
use crate::pool::ParamValuesPool;

struct Route {
    method: Option<Method>,
    pattern: Pattern,
    handler: Handler,
}

/// Router over `(method, pattern)` pairs.
pub struct PathRouter {
    routes: Vec<Route>,
    not_found: Handler,
    method_not_allowed: Handler,
    param_values: ParamValuesPool,
}

impl PathRouter {
    pub fn new() -> Self {
        Self {
            routes: Vec::new(),
            not_found: handler_fn(|_req, res| {
                Box::pin(async move {
                    res.set_status(StatusCode::NOT_FOUND);
                    Err(Error::not_found())
                })
            }),
            method_not_allowed: handler_fn(|_req, res| {
                Box::pin(async move {
                    res.set_status(StatusCode::METHOD_NOT_ALLOWED);
                    Err(Error::status(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed"))
                })
            }),
            param_values: ParamValuesPool::default(),
        }
    }

    /// Register `handler` for `method` requests matching `pattern`.
    pub fn add(&mut self, method: Method, pattern: &str, handler: Handler) -> Result<(), PatternError> {
        self.push(Some(method), pattern, handler)
    }

    /// Register `handler` for every method.
    pub fn any(&mut self, pattern: &str, handler: Handler) -> Result<(), PatternError> {
        self.push(None, pattern, handler)
    }

    pub fn get(&mut self, pattern: &str, handler: Handler) -> Result<(), PatternError> {
        self.add(Method::GET, pattern, handler)
    }

    pub fn post(&mut self, pattern: &str, handler: Handler) -> Result<(), PatternError> {
        self.add(Method::POST, pattern, handler)
    }

    pub fn put(&mut self, pattern: &str, handler: Handler) -> Result<(), PatternError> {
        self.add(Method::PUT, pattern, handler)
    }

    pub fn delete(&mut self, pattern: &str, handler: Handler) -> Result<(), PatternError> {
        self.add(Method::DELETE, pattern, handler)
    }

    /// Replace the handler used when nothing matches.
    pub fn set_not_found(&mut self, handler: Handler) {
        self.not_found = handler;
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    fn push(&mut self, method: Option<Method>, pattern: &str, handler: Handler) -> Result<(), PatternError> {
        let pattern = Pattern::parse(pattern)?;
        tracing::debug!(
            method = method.as_ref().map(Method::as_str).unwrap_or("*"),
            pattern = pattern.as_str(),
            "Route registered"
        );
        self.routes.push(Route {
            method,
            pattern,
            handler,
        });
        Ok(())
    }
}

impl Default for PathRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl Router for PathRouter {
    fn route(&self, req: &mut Request) -> Handler {
        let mut values = self.param_values.get();
        let mut path_matched = false;

        for route in &self.routes {
            if !route.pattern.matches_into(req.path(), &mut values) {
                continue;
            }
            if route.method.as_ref().is_some_and(|m| m != req.method()) {
                path_matched = true;
                continue;
            }

            if route.pattern.names().is_empty() {
                self.param_values.put(values);
            } else {
                req.set_route_params(route.pattern.names().clone(), values);
            }
            return route.handler.clone();
        }

        self.param_values.put(values);
        if path_matched {
            self.method_not_allowed.clone()
        } else {
            self.not_found.clone()
        }
    }

    fn recycle_param_values(&self, values: Vec<String>) {
        self.param_values.put(values);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::engine::Engine;
    use crate::http::Response;
    use crate::pool::ExchangePool;
    use axum::body::Body;

    fn text(body: &'static str) -> Handler {
        handler_fn(move |_req, res| {
            Box::pin(async move {
                res.write_string(body);
                Ok(())
            })
        })
    }

    fn echo_param(name: &'static str) -> Handler {
        handler_fn(move |req, res| {
            Box::pin(async move {
                let value = req.route_param(name).unwrap_or("-").to_string();
                res.write_string(&value);
                Ok(())
            })
        })
    }

    async fn dispatch(router: &PathRouter, method: Method, uri: &str) -> (Result<(), Error>, Box<Response>) {
        let engine = Engine::new(EngineConfig::default());
        let pool = ExchangePool::new(1);
        let (mut req, mut res) = pool.acquire(&engine);
        let (parts, body) = axum::http::Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
            .into_parts();
        req.reset(&engine, parts, body);
        res.reset(req.id());

        let handler = router.route(&mut req);
        let result = handler(&mut *req, &mut *res).await;
        if let Some(values) = req.take_route_param_values() {
            router.recycle_param_values(values);
        }
        (result, res)
    }

    #[tokio::test]
    async fn first_match_wins() {
        let mut router = PathRouter::new();
        router.get("/users/me", text("me")).unwrap();
        router.get("/users/:id", echo_param("id")).unwrap();

        let (_, res) = dispatch(&router, Method::GET, "/users/me").await;
        assert_eq!(res.body(), b"me");
        let (_, res) = dispatch(&router, Method::GET, "/users/42").await;
        assert_eq!(res.body(), b"42");
    }

    #[tokio::test]
    async fn unmatched_path_is_not_found() {
        let mut router = PathRouter::new();
        router.get("/", text("root")).unwrap();

        let (result, res) = dispatch(&router, Method::GET, "/missing").await;
        assert_eq!(result.unwrap_err().status_code(), StatusCode::NOT_FOUND);
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
        assert!(!res.is_written());
    }

    #[tokio::test]
    async fn other_method_is_not_allowed() {
        let mut router = PathRouter::new();
        router.post("/items", text("created")).unwrap();
        router.any("/anything", text("any")).unwrap();

        let (result, res) = dispatch(&router, Method::GET, "/items").await;
        assert!(result.is_err());
        assert_eq!(res.status(), StatusCode::METHOD_NOT_ALLOWED);

        let (_, res) = dispatch(&router, Method::DELETE, "/anything").await;
        assert_eq!(res.body(), b"any");
    }

    #[tokio::test]
    async fn param_buffers_return_to_pool() {
        let mut router = PathRouter::new();
        router.get("/files/*", echo_param("*")).unwrap();

        let (_, res) = dispatch(&router, Method::GET, "/files/a/b.txt").await;
        assert_eq!(res.body(), b"a/b.txt");
        assert_eq!(router.param_values.idle(), 1);
    }

    #[tokio::test]
    async fn custom_not_found() {
        let mut router = PathRouter::new();
        router.set_not_found(text("nothing here"));
        let (result, res) = dispatch(&router, Method::GET, "/x").await;
        assert!(result.is_ok());
        assert_eq!(res.body(), b"nothing here");
    }
}
