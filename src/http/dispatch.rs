//! Per-exchange entry point.
//!
//! # Data Flow
//! ```text
//! platform request
//!     → Acquired   (pair from the pool)
//!     → Reset      (wire request in, clear exchange state)
//!     → Chained    (pregas/gas snapshots + router)
//!     → Executing  (run chain; on error force 500, call error handler)
//!     → Cleanup    (deferred callbacks, last first; build wire response)
//!     → Released   (param buffer to router, pair to pool)
//! ```
//!
//! # Design Decisions
//! - One exchange runs entirely inside the connection's task
//! - A failed exchange only affects its own response
//! - The pool lives here, not in the engine (requests point at the engine)

use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::http::StatusCode;
use tracing::Instrument;

use crate::engine::Engine;
use crate::middleware::chain;
use crate::observability::metrics;
use crate::pool::ExchangePool;

/// Runs exchanges against an engine.
pub struct Dispatcher {
    engine: Arc<Engine>,
    pool: ExchangePool,
}

impl Dispatcher {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self::with_pool(engine, ExchangePool::default())
    }

    pub fn with_pool(engine: Arc<Engine>, pool: ExchangePool) -> Self {
        Self { engine, pool }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn pool(&self) -> &ExchangePool {
        &self.pool
    }

    /// Handle one exchange. Never fails: handler errors end up in the
    /// response via the engine's error handler.
    pub async fn dispatch(&self, request: axum::http::Request<Body>) -> axum::response::Response {
        let start = Instant::now();

        let (mut req, mut res) = self.pool.acquire(&self.engine);

        let (parts, body) = request.into_parts();
        req.reset(&self.engine, parts, body);
        res.reset(req.id());

        let handler = chain(
            Arc::clone(self.engine.router()),
            &self.engine.pregases(),
            self.engine.gases(),
        );

        let span = tracing::debug_span!(
            "exchange",
            request_id = %req.id(),
            method = %req.method(),
            path = %req.path(),
        );
        let result = handler(&mut *req, &mut *res).instrument(span.clone()).await;

        if let Err(err) = result {
            let _entered = span.enter();
            if !res.is_written() && res.status().as_u16() < 400 {
                res.set_status(StatusCode::INTERNAL_SERVER_ERROR);
            }
            if res.status().is_server_error() {
                tracing::error!(error = %err, status = %res.status(), "Exchange failed");
            } else {
                tracing::debug!(error = %err, status = %res.status(), "Exchange failed");
            }
            let on_error = self.engine.error_handler();
            on_error(&err, &mut *req, &mut *res);
        }

        res.run_deferred();
        let response = res.to_http();
        metrics::record_exchange(req.method().as_str(), response.status().as_u16(), start);

        if let Some(values) = req.take_route_param_values() {
            self.engine.router().recycle_param_values(values);
        }
        self.pool.release(req, res);

        response
    }
}
