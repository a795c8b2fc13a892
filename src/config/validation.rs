//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate the listen address and the redirect port
//! - Reject half-configured certificate pairs and empty ACME entries
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: EngineConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::fmt;

use crate::config::schema::EngineConfig;
use crate::net::listener::split_host_port;

/// A single semantic problem found in a configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path of the offending field.
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Check `config` for semantic errors.
pub fn validate_config(config: &EngineConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if let Err(e) = split_host_port(&config.server.address) {
        errors.push(ValidationError::new("server.address", e.to_string()));
    }

    if config.server.max_header_bytes == 0 {
        errors.push(ValidationError::new("server.max_header_bytes", "must be greater than zero"));
    }

    let cert = config.tls.cert_file.as_deref().unwrap_or_default();
    let key = config.tls.key_file.as_deref().unwrap_or_default();
    if cert.is_empty() != key.is_empty() {
        errors.push(ValidationError::new(
            "tls",
            "cert_file and key_file must be set together",
        ));
    }

    if config.https_enforcement.port.parse::<u16>().is_err() {
        errors.push(ValidationError::new(
            "https_enforcement.port",
            format!("invalid port {:?}", config.https_enforcement.port),
        ));
    }

    if config.acme.enabled {
        if config.acme.cert_root.is_empty() {
            errors.push(ValidationError::new("acme.cert_root", "must not be empty"));
        }
        if config.acme.directory_url.is_empty() {
            errors.push(ValidationError::new("acme.directory_url", "must not be empty"));
        }
        // None allows any host; an empty list would allow none.
        if let Some(hosts) = &config.acme.host_whitelist {
            if hosts.is_empty() {
                errors.push(ValidationError::new(
                    "acme.host_whitelist",
                    "must name at least one host, or be omitted to allow any",
                ));
            } else if hosts.iter().any(|h| h.trim().is_empty()) {
                errors.push(ValidationError::new(
                    "acme.host_whitelist",
                    "entries must not be empty",
                ));
            }
        }
        if matches!(config.acme.maintainer_email.as_deref(), Some(e) if !e.contains('@')) {
            errors.push(ValidationError::new(
                "acme.maintainer_email",
                "must be an email address",
            ));
        }
    }

    if config.i18n.enabled && config.i18n.locale_base.is_empty() {
        errors.push(ValidationError::new("i18n.locale_base", "must not be empty"));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
