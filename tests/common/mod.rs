//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use airway::{handler_fn, Engine, EngineConfig, Handler, Server};

/// Debug-mode, cleartext config bound to an ephemeral local port.
pub fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.debug_mode = true;
    config.server.address = "127.0.0.1:0".to_string();
    config
}

/// Start serving `engine` in the background and wait until it is bound.
pub async fn start(engine: Arc<Engine>) -> (Arc<Server>, SocketAddr) {
    let server = Arc::new(Server::new(engine));
    let serving = server.clone();
    tokio::spawn(async move {
        if let Err(e) = serving.serve().await {
            panic!("server failed: {}", e);
        }
    });
    let addr = server.local_addr().await.expect("server did not start");
    (server, addr)
}

/// Client that neither follows redirects nor uses system proxies.
pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .pool_max_idle_per_host(0)
        .no_proxy()
        .build()
        .unwrap()
}

/// Handler writing a fixed text body.
pub fn text(body: &'static str) -> Handler {
    handler_fn(move |_req, res| {
        Box::pin(async move {
            res.write_string(body);
            Ok(())
        })
    })
}
