//! Transport negotiation and server lifecycle.
//!
//! # Responsibilities
//! - Pick the serving mode once per start (static TLS, ACME, cleartext)
//! - Bind the main listener, and the HTTPS-enforcement listener when needed
//! - Forward timeouts and header limits to hyper and tower layers
//! - Dispatch every request through the engine
//! - Immediate and graceful shutdown
//!
//! # Design Decisions
//! - Listeners are bound before serving, so address and bind errors are
//!   returned from `serve` instead of being logged
//! - Cleartext mode speaks HTTP/1.1, prior-knowledge HTTP/2 and
//!   `Upgrade: h2c` on one port
//! - The redirect server lives and dies with the main server, and answers
//!   ACME HTTP-01 challenges in ACME mode
//! - Every listener, the redirect one included, gets the same idle, body
//!   and write deadlines
//! - An exceeded write deadline answers `408 Request Timeout` and keeps the
//!   connection; the handler's future is dropped, the socket is not

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Router;
use axum_server::tls_rustls::RustlsAcceptor;
use axum_server::Handle;
use hyper_util::rt::TokioTimer;
use thiserror::Error;
use tokio::sync::watch;
use tower_http::{
    catch_panic::CatchPanicLayer,
    timeout::{RequestBodyTimeoutLayer, TimeoutLayer},
    trace::TraceLayer,
};

use super::dispatch::Dispatcher;
use super::h2c::{upgrade_h2c, H2cUpgrade, UpgradedConnections};
use super::redirect::redirect_app;
use crate::config::{EngineConfig, ServerConfig};
use crate::engine::Engine;
use crate::net::acme::{AcmeAcceptor, AcmeError, CertManager};
use crate::net::idle::IdleAcceptor;
use crate::net::tls::load_tls_config;
use crate::net::{join_host_port, split_host_port, Listener, ListenerError};

/// hyper refuses read buffers smaller than this.
const MIN_HEADER_BUFFER: usize = 8192;

/// Startup and transport errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("listener error: {0}")]
    Listener(#[from] ListenerError),

    #[error("failed to load TLS key pair: {0}")]
    Tls(#[source] std::io::Error),

    #[error("ACME setup failed: {0}")]
    Acme(#[from] AcmeError),

    #[error("server I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("server already started or closed")]
    AlreadyStarted,
}

/// How connections are terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    /// Certificate and key files from configuration.
    StaticTls,
    /// Certificates issued and renewed by an ACME certificate manager.
    Acme,
    /// No TLS. HTTP/1.1 and HTTP/2 over cleartext.
    Cleartext,
}

/// Serving decision derived from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportPlan {
    pub mode: TransportMode,
    /// Whether the plain-HTTP redirect server runs next to the main one.
    pub https_enforced: bool,
}

impl TransportPlan {
    /// Static files win over ACME; ACME is ignored in debug mode and always
    /// enforces HTTPS.
    pub fn select(config: &EngineConfig) -> Self {
        if config.tls.is_configured() {
            Self {
                mode: TransportMode::StaticTls,
                https_enforced: config.https_enforcement.enabled,
            }
        } else if !config.debug_mode && config.acme.enabled {
            Self {
                mode: TransportMode::Acme,
                https_enforced: true,
            }
        } else {
            Self {
                mode: TransportMode::Cleartext,
                https_enforced: false,
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServeState {
    Idle,
    Starting,
    Serving {
        local: SocketAddr,
        redirect: Option<SocketAddr>,
    },
    Stopped,
}

/// HTTP server for an engine.
pub struct Server {
    engine: Arc<Engine>,
    dispatcher: Arc<Dispatcher>,
    handle: Handle,
    redirect_handle: Handle,
    upgraded: Arc<UpgradedConnections>,
    state: watch::Sender<ServeState>,
}

impl Server {
    pub fn new(engine: Arc<Engine>) -> Self {
        let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&engine)));
        Self::with_dispatcher(engine, dispatcher)
    }

    pub fn with_dispatcher(engine: Arc<Engine>, dispatcher: Arc<Dispatcher>) -> Self {
        let (state, _) = watch::channel(ServeState::Idle);
        Self {
            engine,
            dispatcher,
            handle: Handle::new(),
            redirect_handle: Handle::new(),
            upgraded: Arc::new(UpgradedConnections::new()),
            state,
        }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Serve until [`Server::close`] or [`Server::shutdown`] is called.
    ///
    /// Address, key pair and bind failures are returned before any request
    /// is accepted. A server serves at most once.
    pub async fn serve(&self) -> Result<(), ServerError> {
        let claimed = self.state.send_if_modified(|state| {
            if *state == ServeState::Idle {
                *state = ServeState::Starting;
                true
            } else {
                false
            }
        });
        if !claimed {
            return Err(ServerError::AlreadyStarted);
        }

        let result = self.run().await;
        self.redirect_handle.shutdown();
        self.state.send_replace(ServeState::Stopped);
        if let Err(e) = &result {
            tracing::error!(error = %e, "Server stopped with error");
        } else {
            tracing::info!(app = %self.engine.config().app_name, "Server stopped");
        }
        result
    }

    async fn run(&self) -> Result<(), ServerError> {
        let config = self.engine.config();
        let plan = TransportPlan::select(config);

        let listener = Listener::bind(&config.server.address).await?;
        let local = listener.local_addr();

        let redirect = if plan.https_enforced {
            let (host, _) = split_host_port(&config.server.address)?;
            let address = join_host_port(host, &config.https_enforcement.port);
            Some(Listener::bind(&address).await?)
        } else {
            None
        };

        if config.debug_mode {
            tracing::warn!("Debug mode is on: error details are sent to clients");
        }
        if config.i18n.enabled {
            if let Err(e) = self.engine.i18n().watch() {
                tracing::warn!(error = %e, "Locale hot reload disabled");
            }
        }

        let mut app = build_app(Arc::clone(&self.dispatcher), &config.server);
        if plan.mode == TransportMode::Cleartext {
            let upgrade = H2cUpgrade::new(app.clone(), Arc::clone(&self.upgraded), config.server.clone());
            app = app.layer(axum::middleware::from_fn_with_state(Arc::new(upgrade), upgrade_h2c));
        }
        let app = app.into_make_service_with_connect_info::<SocketAddr>();
        let idle = IdleAcceptor::new(config.server.idle_timeout());

        let tls_config = match plan.mode {
            TransportMode::StaticTls => {
                let cert = config.tls.cert_file.as_deref().unwrap_or_default();
                let key = config.tls.key_file.as_deref().unwrap_or_default();
                Some(
                    load_tls_config(Path::new(cert), Path::new(key))
                        .await
                        .map_err(ServerError::Tls)?,
                )
            }
            _ => None,
        };
        let acme = match plan.mode {
            TransportMode::Acme => {
                let manager = CertManager::new(&config.acme)?;
                manager.spawn_renewal();
                tracing::info!(
                    hosts = ?config.acme.host_whitelist,
                    cert_root = %config.acme.cert_root,
                    directory = %config.acme.directory_url,
                    "Certificate manager started"
                );
                Some(manager)
            }
            _ => None,
        };

        let redirect_addr = redirect.as_ref().map(Listener::local_addr);
        if let Some(redirect) = redirect {
            self.spawn_redirect(redirect, local.port(), acme.clone());
        }

        self.state.send_replace(ServeState::Serving {
            local,
            redirect: redirect_addr,
        });
        tracing::info!(
            app = %config.app_name,
            address = %local,
            mode = ?plan.mode,
            https_enforced = plan.https_enforced,
            "Server starting"
        );

        let listener = listener.into_std();
        match (tls_config, acme) {
            (Some(tls), _) => {
                let acceptor = RustlsAcceptor::new(tls).acceptor(idle);
                let mut server = axum_server::from_tcp(listener).acceptor(acceptor);
                tune(server.http_builder(), &config.server);
                server.handle(self.handle.clone()).serve(app).await?;
            }
            (None, Some(manager)) => {
                let mut server = axum_server::from_tcp(listener).acceptor(AcmeAcceptor::new(manager, idle));
                tune(server.http_builder(), &config.server);
                server.handle(self.handle.clone()).serve(app).await?;
            }
            (None, None) => {
                let mut server = axum_server::from_tcp(listener).acceptor(idle);
                tune(server.http_builder(), &config.server);
                server.handle(self.handle.clone()).serve(app).await?;
            }
        }

        self.upgraded.wait_idle().await;
        Ok(())
    }

    fn spawn_redirect(&self, listener: Listener, tls_port: u16, acme: Option<Arc<CertManager>>) {
        let config = &self.engine.config().server;
        let address = listener.local_addr();
        let mut server =
            axum_server::from_tcp(listener.into_std()).acceptor(IdleAcceptor::new(config.idle_timeout()));
        tune(server.http_builder(), config);
        let server = server.handle(self.redirect_handle.clone());
        let app = with_timeouts(redirect_app(tls_port, acme), config);

        tracing::info!(address = %address, tls_port, "HTTPS redirect server starting");
        tokio::spawn(async move {
            if let Err(e) = server.serve(app.into_make_service()).await {
                tracing::error!(address = %address, error = %e, "HTTPS redirect server failed");
            }
        });
    }

    /// Address of the main listener, once bound. `None` if serving failed
    /// before binding or the server was closed first.
    ///
    /// Waits for [`Server::serve`] to bind; on a server that is never served
    /// it resolves only after [`Server::close`] or [`Server::shutdown`].
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        match self.started().await {
            ServeState::Serving { local, .. } => Some(local),
            _ => None,
        }
    }

    /// Address of the HTTPS-enforcement listener, if one runs. Waits like
    /// [`Server::local_addr`].
    pub async fn redirect_addr(&self) -> Option<SocketAddr> {
        match self.started().await {
            ServeState::Serving { redirect, .. } => redirect,
            _ => None,
        }
    }

    async fn started(&self) -> ServeState {
        let mut state = self.state.subscribe();
        let result = state
            .wait_for(|s| !matches!(s, ServeState::Idle | ServeState::Starting))
            .await
            .map(|s| *s);
        result.unwrap_or(ServeState::Stopped)
    }

    /// Close every listener and connection now. Idempotent.
    pub fn close(&self) {
        self.stop_idle();
        self.handle.shutdown();
        self.redirect_handle.shutdown();
        self.upgraded.close();
    }

    /// Stop accepting, let in-flight exchanges finish within `deadline`,
    /// then force-close what is left. Returns once serving has stopped.
    /// Idempotent.
    pub async fn shutdown(&self, deadline: Duration) {
        self.stop_idle();
        tracing::info!(deadline = ?deadline, "Graceful shutdown started");
        self.handle.graceful_shutdown(Some(deadline));
        self.redirect_handle.graceful_shutdown(Some(deadline));
        self.upgraded.graceful(deadline);

        let mut state = self.state.subscribe();
        let _ = state.wait_for(|s| *s == ServeState::Stopped).await;
    }

    fn stop_idle(&self) {
        self.state.send_if_modified(|state| {
            if *state == ServeState::Idle {
                *state = ServeState::Stopped;
                true
            } else {
                false
            }
        });
    }
}

/// Forward protocol limits to hyper. Idle connections are closed by
/// [`IdleAcceptor`] for both protocols.
fn tune(builder: &mut hyper_util::server::conn::auto::Builder<hyper_util::rt::TokioExecutor>, config: &ServerConfig) {
    let mut http1 = builder.http1();
    http1
        .timer(TokioTimer::new())
        .max_buf_size(config.max_header_bytes.max(MIN_HEADER_BUFFER));
    if let Some(timeout) = config.read_header_timeout() {
        http1.header_read_timeout(timeout);
    }

    builder
        .http2()
        .timer(TokioTimer::new())
        .max_header_list_size(u32::try_from(config.max_header_bytes).unwrap_or(u32::MAX));
}

/// Axum app: every request goes to the dispatcher.
fn build_app(dispatcher: Arc<Dispatcher>, config: &ServerConfig) -> Router {
    let app = Router::new()
        .fallback(dispatch_exchange)
        .with_state(dispatcher);

    with_timeouts(app, config)
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
}

/// Body read deadline and whole-response deadline.
fn with_timeouts(mut app: Router, config: &ServerConfig) -> Router {
    if let Some(timeout) = config.read_timeout() {
        app = app.layer(RequestBodyTimeoutLayer::new(timeout));
    }
    if let Some(timeout) = config.write_timeout() {
        app = app.layer(TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, timeout));
    }
    app
}

async fn dispatch_exchange(
    State(dispatcher): State<Arc<Dispatcher>>,
    request: axum::extract::Request,
) -> axum::response::Response {
    dispatcher.dispatch(request).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_files_take_priority() {
        let mut config = EngineConfig::default();
        config.tls.cert_file = Some("cert.pem".to_string());
        config.tls.key_file = Some("key.pem".to_string());
        config.acme.enabled = true;

        let plan = TransportPlan::select(&config);
        assert_eq!(plan.mode, TransportMode::StaticTls);
        assert!(!plan.https_enforced);

        config.https_enforcement.enabled = true;
        assert!(TransportPlan::select(&config).https_enforced);
    }

    #[test]
    fn acme_forces_https_enforcement() {
        let mut config = EngineConfig::default();
        config.acme.enabled = true;
        config.https_enforcement.enabled = false;

        let plan = TransportPlan::select(&config);
        assert_eq!(plan.mode, TransportMode::Acme);
        assert!(plan.https_enforced);
    }

    #[test]
    fn debug_mode_skips_acme() {
        let mut config = EngineConfig::default();
        config.acme.enabled = true;
        config.debug_mode = true;
        config.https_enforcement.enabled = true;

        let plan = TransportPlan::select(&config);
        assert_eq!(plan.mode, TransportMode::Cleartext);
        assert!(!plan.https_enforced);
    }

    #[test]
    fn nothing_configured_is_cleartext() {
        let plan = TransportPlan::select(&EngineConfig::default());
        assert_eq!(plan.mode, TransportMode::Cleartext);
    }

    #[tokio::test]
    async fn invalid_address_is_a_startup_error() {
        let mut config = EngineConfig::default();
        config.server.address = "no-port".to_string();
        let server = Server::new(Engine::new(config));

        assert!(matches!(server.serve().await, Err(ServerError::Listener(_))));
        assert_eq!(server.local_addr().await, None);
        assert!(matches!(server.serve().await, Err(ServerError::AlreadyStarted)));
    }

    #[tokio::test]
    async fn missing_key_pair_is_a_startup_error() {
        let mut config = EngineConfig::default();
        config.server.address = "127.0.0.1:0".to_string();
        config.tls.cert_file = Some("/nonexistent/cert.pem".to_string());
        config.tls.key_file = Some("/nonexistent/key.pem".to_string());
        let server = Server::new(Engine::new(config));

        assert!(matches!(server.serve().await, Err(ServerError::Tls(_))));
    }

    #[tokio::test]
    async fn close_releases_address_waiters() {
        let server = Arc::new(Server::new(Engine::new(EngineConfig::default())));
        let waiter = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.local_addr().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        server.close();
        let addr = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(addr, None);
        assert_eq!(
            tokio::time::timeout(Duration::from_secs(1), server.redirect_addr())
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn write_deadline_answers_request_timeout() {
        use tower::ServiceExt;

        let config = ServerConfig {
            write_timeout_ms: 50,
            ..ServerConfig::default()
        };
        let slow = Router::new().route(
            "/",
            axum::routing::get(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                "late"
            }),
        );
        let response = with_timeouts(slow, &config)
            .oneshot(
                axum::http::Request::builder()
                    .uri("/")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::REQUEST_TIMEOUT);
    }

    #[tokio::test]
    async fn acme_mode_needs_a_usable_cert_root() {
        let mut config = EngineConfig::default();
        config.server.address = "127.0.0.1:0".to_string();
        config.https_enforcement.port = "0".to_string();
        config.acme.enabled = true;
        config.acme.cert_root = "/proc/airway-acme".to_string();
        let server = Server::new(Engine::new(config));

        assert!(matches!(server.serve().await, Err(ServerError::Acme(_))));
    }

    #[tokio::test]
    async fn close_before_serve_is_idempotent() {
        let server = Server::new(Engine::new(EngineConfig::default()));
        server.close();
        server.close();
        server.shutdown(Duration::from_millis(10)).await;
        assert!(matches!(server.serve().await, Err(ServerError::AlreadyStarted)));
    }
}
