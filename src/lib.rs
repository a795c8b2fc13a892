//! Embeddable HTTP server engine.
//!
//! Connections are terminated by [`Server`] (static TLS, ACME or cleartext
//! HTTP/2), every exchange runs through [`Dispatcher`] with pooled
//! [`Request`]/[`Response`] pairs, and behaviour is added with pregases and
//! gases around a [`Router`].

pub mod config;
pub mod engine;
pub mod error;
pub mod http;
pub mod i18n;
pub mod lifecycle;
pub mod middleware;
pub mod net;
pub mod observability;
pub mod pool;
pub mod routing;

pub use config::EngineConfig;
pub use engine::{default_error_handler, Engine, EngineBuilder, ErrorHandler};
pub use error::{Error, Result};
pub use http::{Dispatcher, Request, Response, Server, ServerError};
pub use middleware::{gas_fn, handler_fn, Gas, Handler};
pub use routing::{PathRouter, Router};
