//! Pluggable request authentication.
//!
//! The deployment picks one scheme in configuration: `none` for development,
//! `api_key` (header `X-API-Key` checked against the configured key list) or
//! `jwt` (HS256 bearer tokens; issuance is external). `/health` stays open
//! for liveness probes regardless of the scheme.

use std::collections::HashSet;
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;

use super::dto::AppError;
use super::routes::AppState;
use crate::core::config::{ApiConfig, AuthMode};

const API_KEY_HEADER: &str = "x-api-key";
const BEARER_PREFIX: &str = "Bearer ";

#[derive(Debug, Deserialize)]
struct Claims {
    #[allow(dead_code)]
    sub: Option<String>,
    #[allow(dead_code)]
    exp: usize,
}

/// Immutable authenticator state derived from the API configuration.
#[derive(Clone)]
pub struct Authenticator {
    mode: AuthMode,
    api_keys: Arc<HashSet<String>>,
    jwt_key: Option<Arc<DecodingKey>>,
}

impl Authenticator {
    pub fn from_config(config: &ApiConfig) -> Self {
        Self {
            mode: config.auth,
            api_keys: Arc::new(config.api_keys.iter().cloned().collect()),
            jwt_key: config
                .jwt_secret
                .as_ref()
                .map(|secret| Arc::new(DecodingKey::from_secret(secret.as_bytes()))),
        }
    }

    /// Check one request's credentials.
    pub fn authorize(&self, request: &Request) -> Result<(), AppError> {
        match self.mode {
            AuthMode::None => Ok(()),
            AuthMode::ApiKey => {
                let presented = request
                    .headers()
                    .get(API_KEY_HEADER)
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| AppError::unauthorized("missing X-API-Key header"))?;
                if self.api_keys.contains(presented) {
                    Ok(())
                } else {
                    Err(AppError::unauthorized("invalid API key"))
                }
            }
            AuthMode::Jwt => {
                let key = self
                    .jwt_key
                    .as_ref()
                    .ok_or_else(|| AppError::internal_error("jwt secret not configured"))?;
                let header = request
                    .headers()
                    .get(axum::http::header::AUTHORIZATION)
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| AppError::unauthorized("missing Authorization header"))?;
                let token = header
                    .strip_prefix(BEARER_PREFIX)
                    .ok_or_else(|| AppError::unauthorized("expected bearer token"))?;

                decode::<Claims>(token, key, &Validation::new(Algorithm::HS256))
                    .map_err(|e| AppError::unauthorized(format!("invalid token: {e}")))?;
                Ok(())
            }
        }
    }
}

/// Middleware guarding every endpoint except the open liveness probe.
pub async fn require_auth(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    state.auth.authorize(&request)?;
    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde::Serialize;

    #[derive(Serialize)]
    struct TestClaims {
        sub: String,
        exp: usize,
    }

    fn request_with(header: Option<(&str, &str)>) -> Request {
        let mut builder = axum::http::Request::builder().uri("/devices");
        if let Some((name, value)) = header {
            builder = builder.header(name, value);
        }
        builder.body(Body::empty()).unwrap()
    }

    fn api_config(auth: AuthMode) -> ApiConfig {
        ApiConfig {
            enabled: true,
            bind_address: "127.0.0.1:0".to_string(),
            auth,
            api_keys: vec!["valid-key".to_string()],
            jwt_secret: Some("test-secret".to_string()),
        }
    }

    #[test]
    fn test_none_mode_allows_everything() {
        let auth = Authenticator::from_config(&api_config(AuthMode::None));
        assert!(auth.authorize(&request_with(None)).is_ok());
    }

    #[test]
    fn test_api_key_mode() {
        let auth = Authenticator::from_config(&api_config(AuthMode::ApiKey));

        assert!(auth
            .authorize(&request_with(Some(("x-api-key", "valid-key"))))
            .is_ok());
        assert!(auth
            .authorize(&request_with(Some(("x-api-key", "wrong"))))
            .is_err());
        assert!(auth.authorize(&request_with(None)).is_err());
    }

    #[test]
    fn test_jwt_mode() {
        let auth = Authenticator::from_config(&api_config(AuthMode::Jwt));

        let exp = (chrono::Utc::now() + chrono::Duration::hours(1)).timestamp() as usize;
        let token = encode(
            &Header::default(),
            &TestClaims {
                sub: "operator".to_string(),
                exp,
            },
            &EncodingKey::from_secret(b"test-secret"),
        )
        .unwrap();

        let header_value = format!("Bearer {token}");
        assert!(auth
            .authorize(&request_with(Some(("authorization", &header_value))))
            .is_ok());

        assert!(auth
            .authorize(&request_with(Some(("authorization", "Bearer garbage"))))
            .is_err());
        assert!(auth
            .authorize(&request_with(Some(("authorization", "Basic abc"))))
            .is_err());
        assert!(auth.authorize(&request_with(None)).is_err());
    }

    #[test]
    fn test_jwt_rejects_expired_token() {
        let auth = Authenticator::from_config(&api_config(AuthMode::Jwt));

        let exp = (chrono::Utc::now() - chrono::Duration::hours(1)).timestamp() as usize;
        let token = encode(
            &Header::default(),
            &TestClaims {
                sub: "operator".to_string(),
                exp,
            },
            &EncodingKey::from_secret(b"test-secret"),
        )
        .unwrap();

        let header_value = format!("Bearer {token}");
        assert!(auth
            .authorize(&request_with(Some(("authorization", &header_value))))
            .is_err());
    }
}
