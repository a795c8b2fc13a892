//! TLS configuration from static certificate files. ACME-managed
//! certificates live in `acme.rs`.

use std::path::Path;

use axum_server::tls_rustls::RustlsConfig;

/// Load TLS configuration from certificate and key files.
pub async fn load_tls_config(cert_path: &Path, key_path: &Path) -> Result<RustlsConfig, std::io::Error> {
    if !cert_path.exists() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Certificate file not found: {:?}", cert_path),
        ));
    }
    if !key_path.exists() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Private key file not found: {:?}", key_path),
        ));
    }

    install_crypto_provider();

    // Advertises h2 and http/1.1 over ALPN.
    RustlsConfig::from_pem_file(cert_path, key_path).await
}

/// Make ring the process-wide rustls provider. More than one provider is
/// compiled in, so rustls cannot pick one by itself.
pub(crate) fn install_crypto_provider() {
    // Err only means a provider is already installed.
    let _ = rustls::crypto::ring::default_provider().install_default();
}
