//! Pooled response state.
//!
//! Handlers write into an in-memory buffer; the buffer becomes the wire body
//! once the middleware chain and deferred callbacks have run. `written` is
//! monotonic within an exchange: once set, the status can no longer change.

use axum::body::{Body, Bytes};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use bytes::BytesMut;
use serde::Serialize;
use uuid::Uuid;

use crate::error::Error;

/// Buffers larger than this are not kept when a slot is recycled.
const MAX_POOLED_BODY: usize = 64 * 1024;

type Deferred = Box<dyn FnOnce() + Send>;

/// The response half of an exchange.
pub struct Response {
    request_id: Uuid,
    status: StatusCode,
    headers: HeaderMap,
    content_length: i64,
    written: bool,
    minified: bool,
    gzipped: bool,
    body: BytesMut,
    deferred: Vec<Deferred>,
}

impl Response {
    pub(crate) fn new() -> Self {
        Self {
            request_id: Uuid::nil(),
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            content_length: -1,
            written: false,
            minified: false,
            gzipped: false,
            body: BytesMut::new(),
            deferred: Vec::new(),
        }
    }

    /// Pair this slot with `request_id` and clear exchange-scoped state.
    pub(crate) fn reset(&mut self, request_id: Uuid) {
        self.request_id = request_id;
        self.status = StatusCode::OK;
        self.headers.clear();
        self.content_length = -1;
        self.written = false;
        self.minified = false;
        self.gzipped = false;
        if self.body.capacity() > MAX_POOLED_BODY {
            self.body = BytesMut::new();
        } else {
            self.body.clear();
        }
        self.deferred.clear();
    }

    /// Id of the request this response answers.
    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Set the status. Ignored once the response has been written.
    pub fn set_status(&mut self, status: StatusCode) {
        if self.written {
            tracing::warn!(
                request_id = %self.request_id,
                current = %self.status,
                ignored = %status,
                "Status change after response was written"
            );
            return;
        }
        self.status = status;
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Declared body length, `-1` while unknown.
    pub fn content_length(&self) -> i64 {
        self.content_length
    }

    pub fn is_written(&self) -> bool {
        self.written
    }

    pub fn is_minified(&self) -> bool {
        self.minified
    }

    pub fn set_minified(&mut self, minified: bool) {
        self.minified = minified;
    }

    pub fn is_gzipped(&self) -> bool {
        self.gzipped
    }

    pub fn set_gzipped(&mut self, gzipped: bool) {
        self.gzipped = gzipped;
    }

    /// Body written so far.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Append raw bytes to the body and commit the status.
    pub fn write(&mut self, bytes: impl AsRef<[u8]>) {
        self.written = true;
        self.body.extend_from_slice(bytes.as_ref());
        self.content_length = self.body.len() as i64;
    }

    fn default_content_type(&mut self, value: &'static str) {
        self.headers
            .entry(header::CONTENT_TYPE)
            .or_insert(HeaderValue::from_static(value));
    }

    pub fn write_string(&mut self, s: &str) {
        self.default_content_type("text/plain; charset=utf-8");
        self.write(s);
    }

    pub fn write_html(&mut self, html: &str) {
        self.default_content_type("text/html; charset=utf-8");
        self.write(html);
    }

    pub fn write_json<T: Serialize>(&mut self, value: &T) -> Result<(), Error> {
        let bytes = serde_json::to_vec(value)?;
        self.default_content_type("application/json");
        self.write(bytes);
        Ok(())
    }

    /// Redirect to `location`. Statuses outside 3xx become `302 Found`.
    pub fn redirect(&mut self, location: &str) -> Result<(), Error> {
        let value = HeaderValue::from_str(location)
            .map_err(|_| Error::internal(format!("invalid redirect location {:?}", location)))?;
        if !self.status.is_redirection() {
            self.set_status(StatusCode::FOUND);
        }
        self.headers.insert(header::LOCATION, value);
        self.written = true;
        Ok(())
    }

    /// Register `f` to run after the exchange, last registered first.
    ///
    /// Deferred callbacks run exactly once, whether or not the handler chain
    /// returned an error.
    pub fn defer(&mut self, f: impl FnOnce() + Send + 'static) {
        self.deferred.push(Box::new(f));
    }

    pub(crate) fn run_deferred(&mut self) {
        while let Some(f) = self.deferred.pop() {
            f();
        }
    }

    /// Build the wire response. The pooled buffer is copied so its capacity
    /// survives for the next exchange.
    pub(crate) fn to_http(&mut self) -> axum::response::Response {
        let body = if self.body.is_empty() {
            Body::empty()
        } else {
            Body::from(Bytes::copy_from_slice(&self.body))
        };
        let mut response = axum::response::Response::new(body);
        *response.status_mut() = self.status;
        *response.headers_mut() = std::mem::take(&mut self.headers);
        response
    }
}

impl Drop for Response {
    // An exchange whose future was dropped mid-flight still runs its
    // deferred callbacks exactly once.
    fn drop(&mut self) {
        self.run_deferred();
    }
}
