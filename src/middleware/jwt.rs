//! Bearer-token (JWT) gas.
//!
//! Valid token → claims stored on the request under `context_key`, next runs.
//! Missing or malformed token → `400 Bad Request`.
//! Bad signature, wrong algorithm or expired token → `401 Unauthorized`.

use std::sync::Arc;

use axum::http::{HeaderName, StatusCode};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};

use super::{gas_fn, handler_fn, Gas};
use crate::error::Error;
use crate::http::Request;

const BEARER: &str = "Bearer ";

/// Decides per request whether the gas is bypassed.
pub type Skipper = Arc<dyn Fn(&Request) -> bool + Send + Sync>;

/// Configuration for [`jwt_with_config`].
#[derive(Clone)]
pub struct JwtConfig {
    /// Skip verification when this returns `true`.
    pub skipper: Option<Skipper>,

    /// HMAC secret used to verify signatures. Required.
    pub signing_key: Vec<u8>,

    /// Accepted signing algorithm (HS256, HS384 or HS512).
    pub algorithm: Algorithm,

    /// Request value key the decoded claims are stored under.
    pub context_key: String,

    /// `header:<name>` or `query:<name>`.
    pub token_lookup: String,
}

impl Default for JwtConfig {
    fn default() -> Self {
        Self {
            skipper: None,
            signing_key: Vec::new(),
            algorithm: Algorithm::HS256,
            context_key: "user".to_string(),
            token_lookup: "header:Authorization".to_string(),
        }
    }
}

enum TokenSource {
    Header(HeaderName),
    Query(String),
}

impl TokenSource {
    fn parse(lookup: &str) -> Result<Self, Error> {
        let invalid = || Error::internal(format!("invalid JWT token lookup {:?}", lookup));
        match lookup.split_once(':') {
            Some(("header", name)) => HeaderName::try_from(name)
                .map(TokenSource::Header)
                .map_err(|_| invalid()),
            Some(("query", name)) if !name.is_empty() => Ok(TokenSource::Query(name.to_string())),
            _ => Err(invalid()),
        }
    }

    fn extract(&self, req: &Request) -> Result<String, &'static str> {
        match self {
            TokenSource::Header(name) => req
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix(BEARER))
                .filter(|token| !token.is_empty())
                .map(str::to_string)
                .ok_or("empty or invalid JWT in request header"),
            TokenSource::Query(name) => req
                .query_param(name)
                .filter(|token| !token.is_empty())
                .ok_or("empty JWT in query param"),
        }
    }
}

struct JwtState {
    skipper: Option<Skipper>,
    context_key: String,
    source: TokenSource,
    key: DecodingKey,
    validation: Validation,
}

/// JWT gas with default settings and `key` as the HMAC secret.
pub fn jwt(key: impl Into<Vec<u8>>) -> Result<Gas, Error> {
    jwt_with_config(JwtConfig {
        signing_key: key.into(),
        ..JwtConfig::default()
    })
}

/// JWT gas from `config`.
pub fn jwt_with_config(config: JwtConfig) -> Result<Gas, Error> {
    if config.signing_key.is_empty() {
        return Err(Error::internal("JWT gas requires a signing key"));
    }
    if !matches!(config.algorithm, Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512) {
        return Err(Error::internal(format!(
            "unsupported JWT signing method {:?}",
            config.algorithm
        )));
    }

    let mut validation = Validation::new(config.algorithm);
    // Only `exp` is checked, and only when the token carries one.
    validation.required_spec_claims.clear();

    let state = Arc::new(JwtState {
        skipper: config.skipper,
        context_key: config.context_key,
        source: TokenSource::parse(&config.token_lookup)?,
        key: DecodingKey::from_secret(&config.signing_key),
        validation,
    });

    Ok(gas_fn(move |next| {
        let state = state.clone();
        handler_fn(move |req, res| {
            let next = next.clone();
            let state = state.clone();
            Box::pin(async move {
                if state.skipper.as_ref().is_some_and(|skip| skip(&*req)) {
                    return next(req, res).await;
                }

                let token = match state.source.extract(req) {
                    Ok(token) => token,
                    Err(reason) => {
                        res.set_status(StatusCode::BAD_REQUEST);
                        return Err(Error::bad_request(reason));
                    }
                };

                match decode::<serde_json::Value>(&token, &state.key, &state.validation) {
                    Ok(data) => {
                        req.set_value(state.context_key.clone(), data.claims);
                        next(req, res).await
                    }
                    Err(e) => {
                        tracing::debug!(request_id = %req.id(), error = %e, "JWT rejected");
                        res.set_status(StatusCode::UNAUTHORIZED);
                        Err(Error::unauthorized())
                    }
                }
            })
        })
    }))
}
