//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! Exchange (inside the pregas layer)
//!     → Router::route(req)            (never fails)
//!     → matched route handler, with route params attached to the request
//!       or the not-found / method-not-allowed handler
//!
//! Released exchange
//!     → Router::recycle_param_values  (param buffer back to its pool)
//! ```
//!
//! # Design Decisions
//! - The engine only depends on the `Router` trait; `PathRouter` is one
//!   implementation of it
//! - Routes are registered before the engine is built and immutable after
//! - First registered match wins
//! - No regex in the hot path (segment comparison only)

pub mod matcher;
pub mod router;

pub use matcher::{Pattern, PatternError};
pub use router::PathRouter;

use crate::http::Request;
use crate::middleware::Handler;

/// Picks the handler for an exchange.
pub trait Router: Send + Sync {
    /// Resolve `req` to a handler. An unmatched request gets a handler that
    /// produces the not-found outcome itself.
    fn route(&self, req: &mut Request) -> Handler;

    /// Take back a route-parameter buffer handed out by [`Router::route`].
    fn recycle_param_values(&self, values: Vec<String>) {
        drop(values);
    }
}
