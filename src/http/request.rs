//! Pooled request state.
//!
//! A `Request` is created once per pool slot and rewired at the start of
//! every exchange. Buffers (`params`, `values`) are truncated, never
//! reallocated, and per-exchange derived state is modelled as a
//! [`LazyState`] that is put back to `NotComputed` on reset.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::ConnectInfo;
use axum::http::{header, request::Parts, HeaderMap, Method, Uri, Version};
use url::form_urlencoded;
use uuid::Uuid;

use crate::engine::Engine;
use crate::error::Error;
use crate::i18n::Localizer;

/// Derived per-exchange value that is computed on first access.
#[derive(Debug)]
pub enum LazyState<T> {
    NotComputed,
    Computed(T),
}

impl<T> LazyState<T> {
    pub fn is_computed(&self) -> bool {
        matches!(self, LazyState::Computed(_))
    }
}

/// A request parameter, from the matched route or the query string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestParam {
    pub name: String,
    pub value: String,
}

/// The request half of an exchange.
pub struct Request {
    engine: Arc<Engine>,
    id: Uuid,
    method: Method,
    uri: Uri,
    version: Version,
    headers: HeaderMap,
    remote_addr: Option<SocketAddr>,
    body: Option<Body>,
    params: Vec<RequestParam>,
    params_parsed: bool,
    route_param_names: Option<Arc<[String]>>,
    route_param_values: Option<Vec<String>>,
    values: HashMap<String, serde_json::Value>,
    localizer: LazyState<Localizer>,
}

impl Request {
    pub(crate) fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            id: Uuid::nil(),
            method: Method::GET,
            uri: Uri::default(),
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            remote_addr: None,
            body: None,
            params: Vec::new(),
            params_parsed: false,
            route_param_names: None,
            route_param_values: None,
            values: HashMap::new(),
            localizer: LazyState::NotComputed,
        }
    }

    /// Wire a platform request into this slot and clear exchange-scoped state.
    pub(crate) fn reset(&mut self, engine: &Arc<Engine>, parts: Parts, body: Body) {
        if !Arc::ptr_eq(&self.engine, engine) {
            self.engine = Arc::clone(engine);
        }
        self.id = Uuid::new_v4();
        self.remote_addr = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);
        self.method = parts.method;
        self.uri = parts.uri;
        self.version = parts.version;
        self.headers = parts.headers;
        self.body = Some(body);
        self.params.clear();
        self.params_parsed = false;
        self.route_param_names = None;
        self.route_param_values = None;
        self.values.clear();
        self.localizer = LazyState::NotComputed;
    }

    /// The engine serving this exchange.
    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Unique id of the current exchange.
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn path(&self) -> &str {
        self.uri.path()
    }

    pub fn query(&self) -> Option<&str> {
        self.uri.query()
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// First value of header `name`, if it is valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Host from the `Host` header, or the URI authority for HTTP/2.
    pub fn host(&self) -> Option<&str> {
        self.headers
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .or_else(|| self.uri.authority().map(|a| a.as_str()))
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Read the whole body, at most `limit` bytes. The body can be read once;
    /// later calls return an empty buffer.
    pub async fn body_bytes(&mut self, limit: usize) -> Result<Bytes, Error> {
        match self.body.take() {
            Some(body) => Ok(axum::body::to_bytes(body, limit).await?),
            None => Ok(Bytes::new()),
        }
    }

    /// Attach the parameters of the matched route.
    ///
    /// `values` is expected to come from the router's buffer pool; it is
    /// handed back to the router when the exchange is released.
    pub fn set_route_params(&mut self, names: Arc<[String]>, values: Vec<String>) {
        self.route_param_names = Some(names);
        self.route_param_values = Some(values);
        self.params.clear();
        self.params_parsed = false;
    }

    /// Value of route parameter `name`.
    pub fn route_param(&self, name: &str) -> Option<&str> {
        let names = self.route_param_names.as_deref()?;
        let values = self.route_param_values.as_deref()?;
        names
            .iter()
            .position(|n| n == name)
            .and_then(|i| values.get(i))
            .map(String::as_str)
    }

    pub(crate) fn take_route_param_values(&mut self) -> Option<Vec<String>> {
        self.route_param_values.take()
    }

    /// First query-string value for `name`.
    pub fn query_param(&self, name: &str) -> Option<String> {
        let query = self.uri.query()?;
        form_urlencoded::parse(query.as_bytes())
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
    }

    /// Route parameters followed by query parameters.
    pub fn params(&mut self) -> &[RequestParam] {
        self.parse_params();
        &self.params
    }

    /// Value of parameter `name`; route parameters shadow query ones.
    pub fn param(&mut self, name: &str) -> Option<&str> {
        self.parse_params();
        self.params
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.value.as_str())
    }

    fn parse_params(&mut self) {
        if self.params_parsed {
            return;
        }
        self.params_parsed = true;

        if let (Some(names), Some(values)) = (&self.route_param_names, &self.route_param_values) {
            for (name, value) in names.iter().zip(values) {
                self.params.push(RequestParam {
                    name: name.clone(),
                    value: value.clone(),
                });
            }
        }

        if let Some(query) = self.uri.query() {
            for (name, value) in form_urlencoded::parse(query.as_bytes()) {
                self.params.push(RequestParam {
                    name: name.into_owned(),
                    value: value.into_owned(),
                });
            }
        }
    }

    /// Store an exchange-scoped value, e.g. decoded token claims.
    pub fn set_value(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.values.insert(key.into(), value);
    }

    pub fn value(&self, key: &str) -> Option<&serde_json::Value> {
        self.values.get(key)
    }

    /// Translate `key` for the locale negotiated from `Accept-Language`.
    ///
    /// Falls back to the base locale and then to `key` itself.
    pub fn localized_string(&mut self, key: &str) -> String {
        if let LazyState::NotComputed = self.localizer {
            let localizer = self.engine.i18n().localizer(&self.headers);
            self.localizer = LazyState::Computed(localizer);
        }
        match &self.localizer {
            LazyState::Computed(localizer) => localizer.get(key),
            LazyState::NotComputed => key.to_string(),
        }
    }

    pub fn is_localized(&self) -> bool {
        self.localizer.is_computed()
    }
}
