//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the engine.
//! All types derive Serde traits for deserialization from config files.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration for an engine instance.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Name used in log lines.
    pub app_name: String,

    /// Debug mode: no ACME, cleartext HTTP/2 and verbose error bodies.
    pub debug_mode: bool,

    /// Listener address and protocol limits.
    pub server: ServerConfig,

    /// Static certificate files.
    pub tls: TlsConfig,

    /// Automatic certificate management.
    pub acme: AcmeConfig,

    /// Plain-HTTP redirect server.
    pub https_enforcement: HttpsEnforcementConfig,

    /// Locale manager.
    pub i18n: I18nConfig,

    /// Logging settings.
    pub log: LogConfig,

    /// Metrics exporter settings.
    pub metrics: MetricsConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            app_name: "airway".to_string(),
            debug_mode: false,
            server: ServerConfig::default(),
            tls: TlsConfig::default(),
            acme: AcmeConfig::default(),
            https_enforcement: HttpsEnforcementConfig::default(),
            i18n: I18nConfig::default(),
            log: LogConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

/// Listener configuration. A timeout of zero disables it.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address in `host:port` form. An empty host binds every interface.
    pub address: String,

    /// Deadline for reading the whole request body, in milliseconds.
    pub read_timeout_ms: u64,

    /// Deadline for reading the request head, in milliseconds.
    pub read_header_timeout_ms: u64,

    /// Deadline for producing the response, in milliseconds.
    pub write_timeout_ms: u64,

    /// Keep-alive idle deadline, in milliseconds.
    pub idle_timeout_ms: u64,

    /// Maximum bytes accepted for the request head.
    pub max_header_bytes: usize,
}

impl ServerConfig {
    pub fn read_timeout(&self) -> Option<Duration> {
        non_zero_ms(self.read_timeout_ms)
    }

    pub fn read_header_timeout(&self) -> Option<Duration> {
        non_zero_ms(self.read_header_timeout_ms)
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        non_zero_ms(self.write_timeout_ms)
    }

    /// Idle deadline, falling back to the read timeout when unset.
    pub fn idle_timeout(&self) -> Option<Duration> {
        non_zero_ms(self.idle_timeout_ms).or_else(|| self.read_timeout())
    }
}

fn non_zero_ms(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "localhost:8080".to_string(),
            read_timeout_ms: 0,
            read_header_timeout_ms: 0,
            write_timeout_ms: 0,
            idle_timeout_ms: 0,
            max_header_bytes: 1 << 20,
        }
    }
}

/// Static TLS certificate configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Path to certificate file (PEM).
    pub cert_file: Option<String>,

    /// Path to private key file (PEM).
    pub key_file: Option<String>,
}

impl TlsConfig {
    /// Both files are configured and non-empty.
    pub fn is_configured(&self) -> bool {
        matches!(
            (self.cert_file.as_deref(), self.key_file.as_deref()),
            (Some(c), Some(k)) if !c.is_empty() && !k.is_empty()
        )
    }
}

/// ACME (automatic certificate management) configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AcmeConfig {
    /// Enable ACME. Ignored in debug mode.
    pub enabled: bool,

    /// ACME directory URL.
    pub directory_url: String,

    /// Directory where issued certificates and account keys are cached.
    pub cert_root: String,

    /// Contact address registered with the ACME account.
    pub maintainer_email: Option<String>,

    /// Host names the manager may issue certificates for.
    pub host_whitelist: Option<Vec<String>>,
}

impl Default for AcmeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            directory_url: "https://acme-v02.api.letsencrypt.org/directory".to_string(),
            cert_root: "acme-certs".to_string(),
            maintainer_email: None,
            host_whitelist: None,
        }
    }
}

/// Redirect-to-HTTPS server configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HttpsEnforcementConfig {
    /// Start the redirect server next to a TLS listener.
    pub enabled: bool,

    /// Port the redirect server binds on the main host.
    pub port: String,
}

impl Default for HttpsEnforcementConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: "80".to_string(),
        }
    }
}

/// Locale manager configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct I18nConfig {
    /// Enable request localization.
    pub enabled: bool,

    /// Directory holding `<tag>.toml` locale files.
    pub locale_root: String,

    /// Locale consulted when the negotiated one lacks a key.
    pub locale_base: String,

    /// Severity used when reporting locale watcher errors.
    pub watcher_error_level: Severity,
}

impl Default for I18nConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            locale_root: "locales".to_string(),
            locale_base: "en-US".to_string(),
            watcher_error_level: Severity::Error,
        }
    }
}

/// Log severity selectable from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Off,
    Debug,
    Info,
    Warn,
    Error,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error).
    pub level: String,

    /// Output format.
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Metrics configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Enable the Prometheus endpoint.
    pub enabled: bool,

    /// Metrics endpoint bind address.
    pub address: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: "127.0.0.1:9090".to_string(),
        }
    }
}
