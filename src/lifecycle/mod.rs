//! Process lifecycle.
//!
//! # Data Flow
//! ```text
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → shutdown_signal() resolves
//!     → Server::shutdown(deadline): stop accept, drain, force-close
//! ```
//!
//! # Design Decisions
//! - Shutdown has a deadline: remaining connections are closed after it

pub mod signals;

pub use signals::shutdown_signal;
