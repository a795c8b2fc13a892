//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → EngineConfig (validated, immutable)
//!     → owned by the Engine, shared via Arc
//! ```
//!
//! # Design Decisions
//! - Config is immutable once an engine is built
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::EngineConfig;
pub use schema::{
    AcmeConfig, HttpsEnforcementConfig, I18nConfig, LogConfig, LogFormat, MetricsConfig,
    ServerConfig, Severity, TlsConfig,
};
