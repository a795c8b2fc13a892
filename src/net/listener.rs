//! TCP listener construction.
//!
//! # Responsibilities
//! - Split and validate `host:port` addresses
//! - Bind to the configured address
//! - Hand a non-blocking socket to the HTTP server
//!
//! Accepting, per-connection tasks and connection draining are done by the
//! server built on top of the socket.

use std::net::SocketAddr;

use tokio::net::TcpListener;

/// Error type for listener operations.
#[derive(Debug)]
pub enum ListenerError {
    /// The address is not in `host:port` form.
    Address(String),
    /// Failed to bind to address.
    Bind(std::io::Error),
}

impl std::fmt::Display for ListenerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ListenerError::Address(e) => write!(f, "Invalid address: {}", e),
            ListenerError::Bind(e) => write!(f, "Failed to bind: {}", e),
        }
    }
}

impl std::error::Error for ListenerError {}

/// Split `address` into host and port.
///
/// Accepts `host:port`, `:port` and `[v6]:port`. The port must be numeric.
pub fn split_host_port(address: &str) -> Result<(&str, &str), ListenerError> {
    let invalid = |why: &str| ListenerError::Address(format!("{}: {}", address, why));

    let (host, port) = if let Some(rest) = address.strip_prefix('[') {
        let (host, tail) = rest.split_once(']').ok_or_else(|| invalid("missing ']'"))?;
        let port = tail.strip_prefix(':').ok_or_else(|| invalid("missing port"))?;
        (host, port)
    } else {
        let (host, port) = address.rsplit_once(':').ok_or_else(|| invalid("missing port"))?;
        if host.contains(':') {
            return Err(invalid("too many colons"));
        }
        (host, port)
    };

    if port.parse::<u16>().is_err() {
        return Err(invalid("invalid port"));
    }

    Ok((host, port))
}

/// Inverse of [`split_host_port`].
pub fn join_host_port(host: &str, port: &str) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// A bound, not yet serving, TCP socket.
#[derive(Debug)]
pub struct Listener {
    inner: std::net::TcpListener,
    local_addr: SocketAddr,
}

impl Listener {
    /// Bind to `address`. An empty host binds every interface.
    pub async fn bind(address: &str) -> Result<Self, ListenerError> {
        let (host, port) = split_host_port(address)?;
        let host = if host.is_empty() { "0.0.0.0" } else { host };
        let port: u16 = port
            .parse()
            .map_err(|_| ListenerError::Address(address.to_string()))?;

        let listener = TcpListener::bind((host, port))
            .await
            .map_err(ListenerError::Bind)?;

        let local_addr = listener.local_addr().map_err(ListenerError::Bind)?;

        // tokio hands the socket back in non-blocking mode.
        let inner = listener.into_std().map_err(ListenerError::Bind)?;

        tracing::info!(address = %local_addr, "Listener bound");

        Ok(Self { inner, local_addr })
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn into_std(self) -> std::net::TcpListener {
        self.inner
    }
}
