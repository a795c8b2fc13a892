//! Explicit engine context.
//!
//! Everything an exchange needs from "the server" lives here: configuration,
//! router, gas lists, error handler and the locale manager. The context is
//! passed to the dispatcher and the server by `Arc`, never through a global,
//! so several engines can coexist in one process.
//!
//! # Design Decisions
//! - Gas lists sit behind `ArcSwap`; each exchange takes an immutable
//!   snapshot, writers swap in a whole new list
//! - The engine does not own the exchange pool. Pooled requests hold an
//!   `Arc<Engine>`, so the pool lives in the dispatcher to avoid a cycle

use std::sync::Arc;

use arc_swap::ArcSwap;
use axum::http::StatusCode;

use crate::config::EngineConfig;
use crate::error::Error;
use crate::http::{Request, Response};
use crate::i18n::I18n;
use crate::middleware::Gas;
use crate::routing::{PathRouter, Router};

/// Reports an unhandled exchange error to the client.
pub type ErrorHandler = Arc<dyn Fn(&Error, &mut Request, &mut Response) + Send + Sync>;

/// Shared engine state.
pub struct Engine {
    config: EngineConfig,
    router: Arc<dyn Router>,
    pregases: ArcSwap<Vec<Gas>>,
    gases: ArcSwap<Vec<Gas>>,
    error_handler: ArcSwap<ErrorHandler>,
    i18n: Arc<I18n>,
}

impl Engine {
    /// Engine with an empty path router and the default error handler.
    pub fn new(config: EngineConfig) -> Arc<Self> {
        Self::builder(config).build()
    }

    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder {
            config,
            router: None,
            pregases: Vec::new(),
            gases: Vec::new(),
            error_handler: None,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn router(&self) -> &Arc<dyn Router> {
        &self.router
    }

    /// Append a pregas. Applies to exchanges that start afterwards.
    pub fn add_pregas(&self, gas: Gas) {
        self.pregases.rcu(|current| {
            let mut next = Vec::clone(current);
            next.push(gas.clone());
            next
        });
    }

    /// Replace the whole pregas list.
    pub fn set_pregases(&self, gases: Vec<Gas>) {
        self.pregases.store(Arc::new(gases));
    }

    /// Append a gas. Applies to exchanges that start afterwards.
    pub fn add_gas(&self, gas: Gas) {
        self.gases.rcu(|current| {
            let mut next = Vec::clone(current);
            next.push(gas.clone());
            next
        });
    }

    /// Replace the whole gas list.
    pub fn set_gases(&self, gases: Vec<Gas>) {
        self.gases.store(Arc::new(gases));
    }

    /// Snapshot of the current pregas list.
    pub fn pregases(&self) -> Arc<Vec<Gas>> {
        self.pregases.load_full()
    }

    /// Snapshot of the current gas list.
    pub fn gases(&self) -> Arc<Vec<Gas>> {
        self.gases.load_full()
    }

    pub fn set_error_handler(&self, handler: ErrorHandler) {
        self.error_handler.store(Arc::new(handler));
    }

    pub fn error_handler(&self) -> ErrorHandler {
        ErrorHandler::clone(&self.error_handler.load())
    }

    pub fn i18n(&self) -> &Arc<I18n> {
        &self.i18n
    }
}

/// Builder returned by [`Engine::builder`].
pub struct EngineBuilder {
    config: EngineConfig,
    router: Option<Arc<dyn Router>>,
    pregases: Vec<Gas>,
    gases: Vec<Gas>,
    error_handler: Option<ErrorHandler>,
}

impl EngineBuilder {
    pub fn router(mut self, router: impl Router + 'static) -> Self {
        self.router = Some(Arc::new(router));
        self
    }

    pub fn pregas(mut self, gas: Gas) -> Self {
        self.pregases.push(gas);
        self
    }

    pub fn gas(mut self, gas: Gas) -> Self {
        self.gases.push(gas);
        self
    }

    pub fn error_handler(mut self, handler: ErrorHandler) -> Self {
        self.error_handler = Some(handler);
        self
    }

    pub fn build(self) -> Arc<Engine> {
        let i18n = Arc::new(I18n::new(self.config.i18n.clone()));
        Arc::new(Engine {
            router: self
                .router
                .unwrap_or_else(|| Arc::new(PathRouter::new())),
            pregases: ArcSwap::from_pointee(self.pregases),
            gases: ArcSwap::from_pointee(self.gases),
            error_handler: ArcSwap::from_pointee(
                self.error_handler
                    .unwrap_or_else(|| Arc::new(default_error_handler)),
            ),
            i18n,
            config: self.config,
        })
    }
}

/// Writes the error for the client unless a response was already written.
///
/// In debug mode, or for client errors, the error message becomes the body.
/// Server errors otherwise get the canonical reason phrase only.
pub fn default_error_handler(err: &Error, req: &mut Request, res: &mut Response) {
    if res.is_written() {
        return;
    }

    let mut status = res.status();
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        if let Error::Status { status: own, .. } = err {
            status = *own;
            res.set_status(status);
        }
    }

    let body = if req.engine().config().debug_mode || status.as_u16() < 500 {
        err.to_string()
    } else {
        status.canonical_reason().unwrap_or("Internal Server Error").to_string()
    };
    res.write_string(&body);
}
