use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;

/// Minimum required key length (256 bits of base64)
pub const MIN_KEY_LENGTH: usize = 32;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum AuthConfigError {
    #[error("API key is too weak (length: {length}, minimum: 32); generate one with: openssl rand -base64 32")]
    WeakKey { length: usize },

    #[error("No API keys configured")]
    NoKeys,
}

/// Bearer keys accepted by the admin API. Never printed.
#[derive(Clone, Default, PartialEq)]
pub struct ApiKeys {
    keys: HashSet<String>,
}

impl std::fmt::Debug for ApiKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ApiKeys({} key(s))", self.keys.len())
    }
}

impl ApiKeys {
    /// Parse a comma-separated key list. Every key must be at least `MIN_KEY_LENGTH` long.
    pub fn parse(raw: &str) -> Result<Self, AuthConfigError> {
        let mut keys = HashSet::new();
        for key in raw.split(',').map(str::trim).filter(|k| !k.is_empty()) {
            if key.len() < MIN_KEY_LENGTH {
                return Err(AuthConfigError::WeakKey { length: key.len() });
            }
            keys.insert(key.to_string());
        }
        Ok(Self { keys })
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_valid(&self, key: &str) -> bool {
        self.keys.contains(key)
    }

    /// Refuse to serve the admin API without credentials
    pub fn require_configured(&self) -> Result<(), AuthConfigError> {
        if self.keys.is_empty() {
            Err(AuthConfigError::NoKeys)
        } else {
            Ok(())
        }
    }
}

/// Middleware to require authentication for protected endpoints
pub async fn require_auth(
    State(keys): State<Arc<ApiKeys>>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let auth_header = request
        .headers()
        .get("Authorization")
        .and_then(|v| v.to_str().ok());

    match auth_header.and_then(|auth| auth.strip_prefix("Bearer ")) {
        Some(key) if keys.is_valid(key) => Ok(next.run(request).await),
        Some(_) => {
            tracing::warn!("Invalid API key attempted");
            Err(StatusCode::UNAUTHORIZED)
        }
        None if auth_header.is_some() => {
            tracing::warn!("Invalid Authorization header format (expected Bearer token)");
            Err(StatusCode::UNAUTHORIZED)
        }
        None => {
            tracing::warn!("Missing Authorization header");
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}
