//! Handlers, gases and chain composition.
//!
//! # Data Flow
//! ```text
//! pregas 1 → … → pregas n        (every request, before routing)
//!     → router.route(req)        (picks the handler)
//!     → gas 1 → … → gas m        (know which route matched)
//!     → route handler
//! ```
//!
//! # Design Decisions
//! - A gas is a plain `Handler → Handler` transformer
//! - The chain is rebuilt per exchange from snapshots of the gas lists, so
//!   registration changes only affect later exchanges
//! - Errors travel back up unmodified; a layer may swallow one by returning
//!   `Ok(())`

pub mod jwt;

use std::sync::Arc;

use futures_util::future::BoxFuture;

use crate::error::Error;
use crate::http::{Request, Response};
use crate::routing::Router;

/// Future returned by a [`Handler`].
pub type HandlerFuture<'a> = BoxFuture<'a, Result<(), Error>>;

/// Handles one exchange.
pub type Handler =
    Arc<dyn for<'a> Fn(&'a mut Request, &'a mut Response) -> HandlerFuture<'a> + Send + Sync>;

/// Middleware: wraps the next handler. Pregases share this type.
pub type Gas = Arc<dyn Fn(Handler) -> Handler + Send + Sync>;

/// Box a closure as a [`Handler`].
///
/// ```ignore
/// let hello = handler_fn(|_req, res| Box::pin(async move {
///     res.write_string("hello");
///     Ok(())
/// }));
/// ```
pub fn handler_fn<F>(f: F) -> Handler
where
    F: for<'a> Fn(&'a mut Request, &'a mut Response) -> HandlerFuture<'a> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Box a closure as a [`Gas`].
pub fn gas_fn<F>(f: F) -> Gas
where
    F: Fn(Handler) -> Handler + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Wrap `handler` so that `layers[0]` runs first.
pub fn wrap(handler: Handler, layers: &[Gas]) -> Handler {
    layers.iter().rev().fold(handler, |next, gas| gas(next))
}

/// Compose `P1(…Pn(route → G1(…Gm(handler))))`.
///
/// Gases are applied after the router picked the handler, so they only see
/// requests that reached routing and may stop them before the route runs.
pub fn chain(router: Arc<dyn Router>, pregases: &[Gas], gases: Arc<Vec<Gas>>) -> Handler {
    let routed = handler_fn(move |req, res| {
        let handler = wrap(router.route(req), &gases);
        handler(req, res)
    });
    wrap(routed, pregases)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::engine::Engine;
    use crate::pool::ExchangePool;
    use axum::http::StatusCode;
    use std::sync::Mutex;

    type Trace = Arc<Mutex<Vec<String>>>;

    fn tracing_gas(name: &'static str, trace: Trace) -> Gas {
        gas_fn(move |next| {
            let trace = trace.clone();
            handler_fn(move |req, res| {
                let next = next.clone();
                let trace = trace.clone();
                Box::pin(async move {
                    trace.lock().unwrap().push(format!("{}>", name));
                    let result = next(req, res).await;
                    trace.lock().unwrap().push(format!("<{}", name));
                    result
                })
            })
        })
    }

    struct Fixed(Handler);

    impl Router for Fixed {
        fn route(&self, _req: &mut Request) -> Handler {
            self.0.clone()
        }
    }

    fn terminal(trace: Trace) -> Handler {
        handler_fn(move |_req, res| {
            let trace = trace.clone();
            Box::pin(async move {
                trace.lock().unwrap().push("H".to_string());
                res.write_string("done");
                Ok(())
            })
        })
    }

    async fn run(handler: Handler) -> (Result<(), Error>, Box<Response>) {
        let engine = Engine::new(EngineConfig::default());
        let pool = ExchangePool::new(1);
        let (mut req, mut res) = pool.acquire(&engine);
        let result = handler(&mut *req, &mut *res).await;
        (result, res)
    }

    #[tokio::test]
    async fn pregases_wrap_gases_wrap_handler() {
        let trace: Trace = Arc::default();
        let router: Arc<dyn Router> = Arc::new(Fixed(terminal(trace.clone())));
        let pregases = vec![tracing_gas("p1", trace.clone()), tracing_gas("p2", trace.clone())];
        let gases = Arc::new(vec![tracing_gas("g1", trace.clone()), tracing_gas("g2", trace.clone())]);

        let (result, _) = run(chain(router, &pregases, gases)).await;
        assert!(result.is_ok());
        assert_eq!(
            *trace.lock().unwrap(),
            vec!["p1>", "p2>", "g1>", "g2>", "H", "<g2", "<g1", "<p2", "<p1"]
        );
    }

    #[tokio::test]
    async fn short_circuit_stops_downstream() {
        let trace: Trace = Arc::default();
        let router: Arc<dyn Router> = Arc::new(Fixed(terminal(trace.clone())));
        let stop = gas_fn(|_next| {
            handler_fn(|_req, res| {
                Box::pin(async move {
                    res.set_status(StatusCode::FORBIDDEN);
                    res.write_string("stopped");
                    Ok(())
                })
            })
        });
        let gases = Arc::new(vec![stop, tracing_gas("g2", trace.clone())]);

        let (result, res) = run(chain(router, &[], gases)).await;
        assert!(result.is_ok());
        assert!(trace.lock().unwrap().is_empty());
        assert_eq!(res.status(), StatusCode::FORBIDDEN);
        assert_eq!(res.body(), b"stopped");
    }

    #[tokio::test]
    async fn errors_propagate_unless_swallowed() {
        let failing = handler_fn(|_req, _res| Box::pin(async { Err(Error::internal("boom")) }));
        let router: Arc<dyn Router> = Arc::new(Fixed(failing));

        let (result, _) = run(chain(router.clone(), &[], Arc::default())).await;
        assert_eq!(result.unwrap_err().to_string(), "boom");

        let recover = gas_fn(|next| {
            handler_fn(move |req, res| {
                let next = next.clone();
                Box::pin(async move {
                    if next(req, res).await.is_err() {
                        res.write_string("recovered");
                    }
                    Ok(())
                })
            })
        });
        let (result, res) = run(chain(router, &[recover], Arc::default())).await;
        assert!(result.is_ok());
        assert_eq!(res.body(), b"recovered");
    }
}
