//! Pooled object store for exchange state.
//!
//! # Responsibilities
//! - Hand out a `Request`/`Response` pair per exchange without blocking
//! - Take pairs back once the exchange has been released
//! - Recycle route-parameter value buffers for the router
//!
//! # Design Decisions
//! - Bounded lock-free free lists (`ArrayQueue`), no global mutex
//! - Empty pool → allocate; full pool → drop. Pooling never fails
//! - Pooled objects are lent out as `&mut` for one exchange only. Nothing
//!   may keep a reference past the exchange: the next one overwrites them.

use std::sync::Arc;

use crossbeam_queue::ArrayQueue;

use crate::engine::Engine;
use crate::http::{Request, Response};

/// Default number of idle pairs kept per pool.
pub const DEFAULT_POOL_CAPACITY: usize = 1024;

/// Free lists of requests and responses.
pub struct ExchangePool {
    requests: ArrayQueue<Box<Request>>,
    responses: ArrayQueue<Box<Response>>,
}

impl ExchangePool {
    /// Create a pool that keeps at most `capacity` idle pairs.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            requests: ArrayQueue::new(capacity),
            responses: ArrayQueue::new(capacity),
        }
    }

    /// Take a pair from the pool, allocating when it is empty.
    ///
    /// The pair still carries the previous exchange's state; callers must
    /// reset both halves before use.
    pub fn acquire(&self, engine: &Arc<Engine>) -> (Box<Request>, Box<Response>) {
        let req = self
            .requests
            .pop()
            .unwrap_or_else(|| Box::new(Request::new(Arc::clone(engine))));
        let res = self
            .responses
            .pop()
            .unwrap_or_else(|| Box::new(Response::new()));
        (req, res)
    }

    /// Return a pair after its exchange completed.
    pub fn release(&self, req: Box<Request>, res: Box<Response>) {
        // A full free list just lets the extra pair drop.
        let _ = self.requests.push(req);
        let _ = self.responses.push(res);
    }

    /// Number of idle requests and responses.
    pub fn idle(&self) -> (usize, usize) {
        (self.requests.len(), self.responses.len())
    }
}

impl Default for ExchangePool {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_CAPACITY)
    }
}

/// Free list of route-parameter value buffers.
pub struct ParamValuesPool {
    free: ArrayQueue<Vec<String>>,
}

impl ParamValuesPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            free: ArrayQueue::new(capacity.max(1)),
        }
    }

    /// An empty buffer, reused when one is available.
    pub fn get(&self) -> Vec<String> {
        self.free.pop().unwrap_or_default()
    }

    /// Truncate `values` and keep it for reuse. Buffers that never
    /// allocated are not worth pooling.
    pub fn put(&self, mut values: Vec<String>) {
        if values.capacity() == 0 {
            return;
        }
        values.clear();
        let _ = self.free.push(values);
    }

    pub fn idle(&self) -> usize {
        self.free.len()
    }
}

impl Default for ParamValuesPool {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_CAPACITY)
    }
}
