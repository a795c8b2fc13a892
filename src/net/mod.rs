//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! "host:port" from config
//!     → listener.rs (split, bind, non-blocking socket)
//!     → idle.rs (per-connection idle deadline)
//!     → tls.rs / acme.rs (optional: static certificate or per-SNI ACME)
//!     → Hand off to HTTP layer (http::server)
//! ```
//!
//! # Design Decisions
//! - Binding happens before serving so startup errors surface synchronously
//! - TLS is optional and handled transparently by the acceptor

pub mod acme;
pub mod idle;
pub mod listener;
pub mod tls;

pub use acme::{AcmeAcceptor, AcmeError, CertManager};
pub use idle::IdleAcceptor;
pub use listener::{join_host_port, split_host_port, Listener, ListenerError};
