//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP/TLS connection
//!     → server.rs (transport mode, hyper limits, tower layers)
//!     → dispatch.rs (pooled request/response, middleware chain)
//!     → request.rs / response.rs (exchange state seen by handlers)
//!     → Send to client
//!
//! Cleartext HTTP/1.1 request with Upgrade: h2c
//!     → h2c.rs (101, then HTTP/2 on the same connection)
//!
//! Plain-HTTP enforcement listener
//!     → redirect.rs (HTTP-01 challenges, else 301 to the HTTPS listener)
//! ```

pub mod dispatch;
mod h2c;
pub mod redirect;
pub mod request;
pub mod response;
pub mod server;

pub use dispatch::Dispatcher;
pub use request::{LazyState, Request, RequestParam};
pub use response::Response;
pub use server::{Server, ServerError, TransportMode, TransportPlan};
