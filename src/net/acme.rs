//! ACME certificate manager answering HTTP-01 challenges.
//!
//! # Data Flow
//! ```text
//! TLS ClientHello (SNI)
//!     → AcmeAcceptor
//!     → CertManager::server_config(name)
//!         memory cache → <cert_root>/<name>.pem → new order
//!     → handshake with the per-name ServerConfig
//!
//! ACME server → GET /.well-known/acme-challenge/<token> on the plain-HTTP
//!     listener → CertManager::challenge_response(token)
//! ```
//!
//! # Design Decisions
//! - Certificates are obtained on demand, the first time a name is seen
//! - Without a host whitelist any DNS name may be issued; IP literals and
//!   missing SNI are always refused
//! - One issuance runs at a time; concurrent handshakes for the same name
//!   wait for it and then use the cached result
//! - A background task renews certificates expiring within 30 days

use std::collections::HashMap;
use std::io::{self, BufReader};
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum_server::accept::Accept;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use futures_util::future::BoxFuture;
use rcgen::{CertificateParams, DistinguishedName, KeyPair, PKCS_ECDSA_P256_SHA256};
use ring::signature::KeyPair as _;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::ServerName;
use rustls::server::Acceptor;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use rustls_acme::acme::{Account, AuthStatus, ChallengeType, Directory, OrderStatus};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::server::TlsStream;
use tokio_rustls::LazyConfigAcceptor;

use crate::config::AcmeConfig;
use crate::net::tls::install_crypto_provider;

const ACCOUNT_KEY_FILE: &str = "account.der";
const RENEW_BEFORE: Duration = Duration::from_secs(30 * 24 * 60 * 60);
const RENEW_CHECK_INTERVAL: Duration = Duration::from_secs(12 * 60 * 60);
const POLL_INTERVAL: Duration = Duration::from_secs(2);
const POLL_ATTEMPTS: u32 = 30;
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum AcmeError {
    #[error("missing or invalid server name {0:?}")]
    InvalidHost(String),

    #[error("host {0:?} is not in acme.host_whitelist")]
    HostNotAllowed(String),

    #[error("ACME protocol error: {0}")]
    Protocol(#[from] rustls_acme::acme::AcmeError),

    #[error("no http-01 challenge offered for {0}")]
    NoHttp01Challenge(String),

    #[error("authorization for {domain} ended as {status}")]
    Authorization { domain: String, status: String },

    #[error("order for {0} is invalid")]
    OrderInvalid(String),

    #[error("order for {0} did not complete in time")]
    Timeout(String),

    #[error("certificate request: {0}")]
    Csr(#[from] rcgen::Error),

    #[error("certificate bundle for {0} is unusable")]
    BadBundle(String),

    #[error("TLS configuration: {0}")]
    Tls(#[from] rustls::Error),

    #[error("certificate cache: {0}")]
    Io(#[from] io::Error),
}

/// A certificate ready to serve.
struct Issued {
    config: Arc<ServerConfig>,
    not_after: i64,
}

impl Issued {
    fn is_valid(&self, now: i64) -> bool {
        self.not_after > now
    }

    fn renewal_due(&self, now: i64) -> bool {
        self.not_after - now < RENEW_BEFORE.as_secs() as i64
    }
}

/// Issues, caches and renews certificates for the names clients ask for.
pub struct CertManager {
    directory_url: String,
    cert_root: PathBuf,
    contact: Vec<String>,
    allowed: Option<Vec<String>>,
    client: Arc<ClientConfig>,
    provider: Arc<CryptoProvider>,
    challenges: RwLock<HashMap<String, String>>,
    certs: RwLock<HashMap<String, Arc<Issued>>>,
    account: tokio::sync::Mutex<Option<Arc<Account>>>,
    issuing: tokio::sync::Mutex<()>,
}

impl CertManager {
    /// Prepare a manager for `config`. No request reaches the ACME server
    /// until a certificate is needed.
    pub fn new(config: &AcmeConfig) -> Result<Arc<Self>, AcmeError> {
        install_crypto_provider();
        let provider = Arc::new(rustls::crypto::ring::default_provider());

        let roots = RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };
        let client = ClientConfig::builder_with_provider(Arc::clone(&provider))
            .with_safe_default_protocol_versions()?
            .with_root_certificates(roots)
            .with_no_client_auth();

        std::fs::create_dir_all(&config.cert_root)?;

        let allowed = config
            .host_whitelist
            .as_ref()
            .map(|hosts| hosts.iter().map(|h| h.trim().to_ascii_lowercase()).collect());

        Ok(Arc::new(Self {
            directory_url: config.directory_url.clone(),
            cert_root: PathBuf::from(&config.cert_root),
            contact: config
                .maintainer_email
                .iter()
                .map(|email| format!("mailto:{}", email))
                .collect(),
            allowed,
            client: Arc::new(client),
            provider,
            challenges: RwLock::new(HashMap::new()),
            certs: RwLock::new(HashMap::new()),
            account: tokio::sync::Mutex::new(None),
            issuing: tokio::sync::Mutex::new(()),
        }))
    }

    /// Normalized name if the policy allows issuing for it.
    pub fn check_host(&self, name: &str) -> Result<String, AcmeError> {
        let name = name.trim_end_matches('.').to_ascii_lowercase();
        match ServerName::try_from(name.as_str()) {
            Ok(ServerName::DnsName(_)) => {}
            _ => return Err(AcmeError::InvalidHost(name)),
        }
        match &self.allowed {
            Some(hosts) if !hosts.iter().any(|h| *h == name) => Err(AcmeError::HostNotAllowed(name)),
            _ => Ok(name),
        }
    }

    /// Key authorization for a pending HTTP-01 challenge.
    pub fn challenge_response(&self, token: &str) -> Option<String> {
        self.challenges
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(token)
            .cloned()
    }

    pub(crate) fn insert_challenge(&self, token: &str, key_authorization: &str) {
        self.challenges
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(token.to_string(), key_authorization.to_string());
    }

    fn remove_challenge(&self, token: &str) {
        self.challenges
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(token);
    }

    /// TLS configuration for `name`, issuing a certificate if none is cached.
    pub async fn server_config(&self, name: &str) -> Result<Arc<ServerConfig>, AcmeError> {
        let name = self.check_host(name)?;
        if let Some(config) = self.serving(&name) {
            return Ok(config);
        }

        let _issuing = self.issuing.lock().await;
        if let Some(config) = self.serving(&name) {
            return Ok(config);
        }

        match self.load_cached(&name).await {
            Ok(Some(issued)) if issued.is_valid(unix_now()) => {
                tracing::info!(domain = %name, "Loaded cached certificate");
                return Ok(self.store(&name, issued));
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(domain = %name, error = %e, "Ignoring cached certificate"),
        }

        let issued = self.issue(&name).await?;
        Ok(self.store(&name, issued))
    }

    /// Start the renewal loop. It stops once the manager is dropped.
    pub fn spawn_renewal(self: &Arc<Self>) {
        let manager = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(RENEW_CHECK_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(manager) = Weak::upgrade(&manager) else {
                    return;
                };
                manager.renew_due().await;
            }
        });
    }

    async fn renew_due(&self) {
        let now = unix_now();
        let due: Vec<String> = self
            .certs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, issued)| issued.renewal_due(now))
            .map(|(name, _)| name.clone())
            .collect();

        for name in due {
            let _issuing = self.issuing.lock().await;
            match self.issue(&name).await {
                Ok(issued) => {
                    self.store(&name, issued);
                }
                Err(e) => tracing::error!(domain = %name, error = %e, "Certificate renewal failed"),
            }
        }
    }

    fn serving(&self, name: &str) -> Option<Arc<ServerConfig>> {
        let certs = self.certs.read().unwrap_or_else(PoisonError::into_inner);
        certs
            .get(name)
            .filter(|issued| issued.is_valid(unix_now()))
            .map(|issued| Arc::clone(&issued.config))
    }

    fn store(&self, name: &str, issued: Issued) -> Arc<ServerConfig> {
        let config = Arc::clone(&issued.config);
        self.certs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), Arc::new(issued));
        config
    }

    fn bundle_path(&self, name: &str) -> PathBuf {
        self.cert_root.join(format!("{}.pem", name))
    }

    async fn load_cached(&self, name: &str) -> Result<Option<Issued>, AcmeError> {
        match tokio::fs::read(self.bundle_path(name)).await {
            Ok(pem) => self.parse_bundle(name, &pem).map(Some),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Key and chain from one PEM file, key first.
    fn parse_bundle(&self, name: &str, pem: &[u8]) -> Result<Issued, AcmeError> {
        let key = rustls_pemfile::private_key(&mut BufReader::new(pem))?
            .ok_or_else(|| AcmeError::BadBundle(name.to_string()))?;
        let chain = rustls_pemfile::certs(&mut BufReader::new(pem)).collect::<Result<Vec<_>, _>>()?;
        let leaf = chain.first().ok_or_else(|| AcmeError::BadBundle(name.to_string()))?;
        let (_, cert) = x509_parser::parse_x509_certificate(leaf.as_ref())
            .map_err(|_| AcmeError::BadBundle(name.to_string()))?;
        let not_after = cert.validity().not_after.timestamp();

        let mut config = ServerConfig::builder_with_provider(Arc::clone(&self.provider))
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(chain, key)?;
        config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

        Ok(Issued {
            config: Arc::new(config),
            not_after,
        })
    }

    async fn account(&self) -> Result<Arc<Account>, AcmeError> {
        let mut slot = self.account.lock().await;
        if let Some(account) = slot.as_ref() {
            return Ok(Arc::clone(account));
        }

        let key_path = self.cert_root.join(ACCOUNT_KEY_FILE);
        let key = match tokio::fs::read(&key_path).await {
            Ok(key) => key,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let key = Account::generate_key_pair();
                tokio::fs::write(&key_path, &key).await?;
                key
            }
            Err(e) => return Err(e.into()),
        };

        let directory = Directory::discover(&self.client, &self.directory_url).await?;
        let account = Arc::new(Account::create_with_keypair(&self.client, directory, &self.contact, &key).await?);
        tracing::info!(directory = %self.directory_url, "ACME account ready");
        *slot = Some(Arc::clone(&account));
        Ok(account)
    }

    async fn issue(&self, name: &str) -> Result<Issued, AcmeError> {
        tracing::info!(domain = %name, "Requesting certificate");
        let account = self.account().await?;

        let mut params = CertificateParams::new(vec![name.to_string()])?;
        params.distinguished_name = DistinguishedName::new();
        let key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;
        let csr = params.serialize_request(&key)?;

        let (order_url, mut order) = account.new_order(&self.client, vec![name.to_string()]).await?;
        for _ in 0..POLL_ATTEMPTS {
            match order.status {
                OrderStatus::Pending => {
                    for url in &order.authorizations {
                        self.authorize(&account, name, url).await?;
                    }
                    order = account.order(&self.client, &order_url).await?;
                }
                OrderStatus::Processing => {
                    tokio::time::sleep(POLL_INTERVAL).await;
                    order = account.order(&self.client, &order_url).await?;
                }
                OrderStatus::Ready => {
                    order = account.finalize(&self.client, &order.finalize, csr.der()).await?;
                }
                OrderStatus::Valid { certificate } => {
                    let chain = account.certificate(&self.client, certificate).await?;
                    let bundle = format!("{}\n{}", key.serialize_pem(), chain);
                    let issued = self.parse_bundle(name, bundle.as_bytes())?;
                    tokio::fs::write(self.bundle_path(name), bundle).await?;
                    tracing::info!(domain = %name, not_after = issued.not_after, "Certificate issued");
                    return Ok(issued);
                }
                OrderStatus::Invalid => return Err(AcmeError::OrderInvalid(name.to_string())),
            }
        }
        Err(AcmeError::Timeout(name.to_string()))
    }

    async fn authorize(&self, account: &Account, name: &str, url: &str) -> Result<(), AcmeError> {
        let auth = account.auth(&self.client, url).await?;
        match auth.status {
            AuthStatus::Valid => return Ok(()),
            AuthStatus::Pending => {}
            status => {
                return Err(AcmeError::Authorization {
                    domain: name.to_string(),
                    status: format!("{:?}", status),
                })
            }
        }

        let challenge = auth
            .challenges
            .iter()
            .find(|c| c.typ == ChallengeType::Http01)
            .ok_or_else(|| AcmeError::NoHttp01Challenge(name.to_string()))?;
        let response = key_authorization(&challenge.token, account.key_pair.public_key().as_ref());
        self.insert_challenge(&challenge.token, &response);

        let result = self.complete_challenge(account, name, url, &challenge.url).await;
        self.remove_challenge(&challenge.token);
        result
    }

    async fn complete_challenge(
        &self,
        account: &Account,
        name: &str,
        auth_url: &str,
        challenge_url: &str,
    ) -> Result<(), AcmeError> {
        account.challenge(&self.client, challenge_url).await?;
        for _ in 0..POLL_ATTEMPTS {
            tokio::time::sleep(POLL_INTERVAL).await;
            let auth = account.auth(&self.client, auth_url).await?;
            match auth.status {
                AuthStatus::Valid => return Ok(()),
                AuthStatus::Pending => {}
                status => {
                    return Err(AcmeError::Authorization {
                        domain: name.to_string(),
                        status: format!("{:?}", status),
                    })
                }
            }
        }
        Err(AcmeError::Timeout(name.to_string()))
    }
}

/// `token.thumbprint` for an account whose P-256 public point is `public_key`
/// (uncompressed SEC1 form).
fn key_authorization(token: &str, public_key: &[u8]) -> String {
    let point = public_key.get(1..).unwrap_or_default();
    let (x, y) = point.split_at(point.len() / 2);
    let jwk = format!(
        r#"{{"crv":"P-256","kty":"EC","x":"{}","y":"{}"}}"#,
        URL_SAFE_NO_PAD.encode(x),
        URL_SAFE_NO_PAD.encode(y)
    );
    let thumbprint = ring::digest::digest(&ring::digest::SHA256, jwk.as_bytes());
    format!("{}.{}", token, URL_SAFE_NO_PAD.encode(thumbprint))
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

/// TLS acceptor picking the certificate from the ClientHello's SNI.
#[derive(Clone)]
pub struct AcmeAcceptor<A> {
    manager: Arc<CertManager>,
    inner: A,
}

impl<A> AcmeAcceptor<A> {
    pub fn new(manager: Arc<CertManager>, inner: A) -> Self {
        Self { manager, inner }
    }
}

impl<I, S, A> Accept<I, S> for AcmeAcceptor<A>
where
    A: Accept<I, S>,
    A::Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    A::Service: Send + 'static,
    A::Future: Send + 'static,
{
    type Stream = TlsStream<A::Stream>;
    type Service = A::Service;
    type Future = BoxFuture<'static, io::Result<(Self::Stream, Self::Service)>>;

    fn accept(&self, stream: I, service: S) -> Self::Future {
        let inner = self.inner.accept(stream, service);
        let manager = Arc::clone(&self.manager);
        Box::pin(async move {
            let (stream, service) = inner.await?;
            let start = tokio::time::timeout(HANDSHAKE_TIMEOUT, LazyConfigAcceptor::new(Acceptor::default(), stream))
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "TLS handshake timed out"))??;

            let name = start.client_hello().server_name().unwrap_or_default().to_string();
            let config = manager.server_config(&name).await.map_err(|e| {
                tracing::warn!(server_name = %name, error = %e, "No certificate for handshake");
                io::Error::new(io::ErrorKind::InvalidData, e.to_string())
            })?;

            let stream = tokio::time::timeout(HANDSHAKE_TIMEOUT, start.into_stream(config))
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "TLS handshake timed out"))??;
            Ok((stream, service))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FIXTURE_POINT: &str = "04c46fa1ee753f805ca7e24e5edc19712eb7451f6a27a312849477d63c64ab5f42\
                                 3d6dc976fcc0a20b61c3a0e0c5baedeba4b297bca7b9a1e99af0bdd1fccb1eaa";

    fn manager(hosts: Option<&[&str]>) -> Arc<CertManager> {
        let root = std::env::temp_dir().join(format!("airway-acme-{}", uuid::Uuid::new_v4()));
        let config = AcmeConfig {
            enabled: true,
            cert_root: root.to_string_lossy().into_owned(),
            host_whitelist: hosts.map(|h| h.iter().map(|s| s.to_string()).collect()),
            ..AcmeConfig::default()
        };
        CertManager::new(&config).unwrap()
    }

    fn fixture_bundle() -> Vec<u8> {
        let dir = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures");
        let mut bundle = std::fs::read(format!("{}/key.pem", dir)).unwrap();
        bundle.extend(std::fs::read(format!("{}/cert.pem", dir)).unwrap());
        bundle
    }

    fn hex(s: &str) -> Vec<u8> {
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
            .collect()
    }

    #[test]
    fn whitelist_limits_issuance() {
        let manager = manager(Some(&["example.com", "WWW.example.com"]));
        assert_eq!(manager.check_host("example.com").unwrap(), "example.com");
        assert_eq!(manager.check_host("www.example.com.").unwrap(), "www.example.com");
        assert!(matches!(
            manager.check_host("evil.example"),
            Err(AcmeError::HostNotAllowed(_))
        ));
    }

    #[test]
    fn without_whitelist_any_dns_name_is_allowed() {
        let manager = manager(None);
        assert_eq!(manager.check_host("Shop.Example.org").unwrap(), "shop.example.org");
        assert!(matches!(manager.check_host(""), Err(AcmeError::InvalidHost(_))));
        assert!(matches!(manager.check_host("127.0.0.1"), Err(AcmeError::InvalidHost(_))));
        assert!(matches!(manager.check_host("a b"), Err(AcmeError::InvalidHost(_))));
    }

    #[test]
    fn key_authorization_uses_jwk_thumbprint() {
        let response = key_authorization("tok3n", &hex(FIXTURE_POINT));
        assert_eq!(response, "tok3n.tazHQjelPD7srZeP60wg5OVdpJiDZHUW_ScUWfcxvXs");
    }

    #[test]
    fn challenge_responses_are_looked_up_by_token() {
        let manager = manager(None);
        assert_eq!(manager.challenge_response("abc"), None);
        manager.insert_challenge("abc", "abc.thumb");
        assert_eq!(manager.challenge_response("abc").as_deref(), Some("abc.thumb"));
        manager.remove_challenge("abc");
        assert_eq!(manager.challenge_response("abc"), None);
    }

    #[tokio::test]
    async fn cached_bundle_is_served_without_issuing() {
        let manager = manager(Some(&["localhost"]));
        std::fs::write(manager.bundle_path("localhost"), fixture_bundle()).unwrap();

        let config = manager.server_config("localhost").await.unwrap();
        assert_eq!(config.alpn_protocols, vec![b"h2".to_vec(), b"http/1.1".to_vec()]);

        let issued = manager.load_cached("localhost").await.unwrap().unwrap();
        assert_eq!(issued.not_after, 4_946_015_092);
        assert!(issued.is_valid(unix_now()));
        assert!(!issued.renewal_due(unix_now()));
        assert!(issued.renewal_due(issued.not_after - 60));

        // Second lookup comes from memory.
        std::fs::remove_file(manager.bundle_path("localhost")).unwrap();
        assert!(manager.server_config("localhost").await.is_ok());
    }

    #[tokio::test]
    async fn broken_bundle_is_rejected() {
        let manager = manager(None);
        let err = manager.parse_bundle("example.com", b"not pem").err().unwrap();
        assert!(matches!(err, AcmeError::BadBundle(_)));
    }
}
