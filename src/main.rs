//! `airway` server binary.
//!
//! Loads a TOML configuration, installs logging and metrics, serves a small
//! demo application and shuts down gracefully on Ctrl+C / SIGTERM.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use airway::config::{load_config, EngineConfig};
use airway::lifecycle::shutdown_signal;
use airway::middleware::jwt::{jwt_with_config, JwtConfig};
use airway::observability::{logging::init_logging, metrics::init_metrics};
use airway::{handler_fn, Engine, PathRouter, Request, Server};

/// In-flight exchanges get this long to finish after a shutdown signal.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "airway")]
#[command(about = "Embeddable HTTP server engine", long_about = None)]
struct Cli {
    /// Configuration file (TOML). Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Force debug mode on.
    #[arg(long)]
    debug: bool,

    /// Require a bearer token signed with this HMAC secret on `/me`.
    #[arg(long, env = "AIRWAY_JWT_SECRET")]
    jwt_secret: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => EngineConfig::default(),
    };
    if cli.debug {
        config.debug_mode = true;
    }

    init_logging(&config.log)?;
    tracing::info!(
        app = %config.app_name,
        address = %config.server.address,
        debug = config.debug_mode,
        "Configuration loaded"
    );

    if config.metrics.enabled {
        let addr: SocketAddr = config.metrics.address.parse()?;
        init_metrics(addr)?;
    }

    let mut router = PathRouter::new();
    router.get(
        "/",
        handler_fn(|req, res| {
            Box::pin(async move {
                let greeting = req.localized_string("hello");
                res.write_string(&greeting);
                Ok(())
            })
        }),
    )?;
    router.get(
        "/users/:id",
        handler_fn(|req, res| {
            Box::pin(async move {
                let id = req.route_param("id").unwrap_or_default().to_string();
                res.write_json(&serde_json::json!({ "id": id, "request_id": req.id() }))
            })
        }),
    )?;

    let mut engine = Engine::builder(config);
    if let Some(secret) = cli.jwt_secret {
        router.get(
            "/me",
            handler_fn(|req, res| {
                Box::pin(async move {
                    let claims = req.value("user").cloned().unwrap_or_default();
                    res.write_json(&claims)
                })
            }),
        )?;
        let protect = jwt_with_config(JwtConfig {
            signing_key: secret.into_bytes(),
            skipper: Some(Arc::new(|req: &Request| req.path() != "/me")),
            ..JwtConfig::default()
        })?;
        engine = engine.gas(protect);
    }
    let engine = engine.router(router).build();

    let server = Server::new(engine);
    let serve = server.serve();
    tokio::pin!(serve);

    tokio::select! {
        result = &mut serve => {
            result?;
            return Ok(());
        }
        _ = shutdown_signal() => {}
    }

    let (_, result) = tokio::join!(server.shutdown(SHUTDOWN_DEADLINE), &mut serve);
    result?;

    tracing::info!("Shutdown complete");
    Ok(())
}
