//! Bearer-JWT guard for `/admin` routes.
//!
//! Tokens are issued elsewhere; this service only verifies HS256 signatures
//! against the configured secret and requires the `admin` role claim.

use crate::{errors::AppError, state::AppState};
use axum::{
    extract::{Request, State},
    http::{HeaderMap, header},
    middleware::Next,
    response::Response,
};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::{Deserialize, Serialize};

pub const ADMIN_ROLE: &str = "admin";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub role: String,
    pub exp: usize,
}

/// Checks signature and expiry of presented tokens.
#[derive(Clone)]
pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    pub fn verify(&self, token: &str) -> Result<Claims, jsonwebtoken::errors::Error> {
        decode::<Claims>(token, &self.key, &self.validation).map(|data| data.claims)
    }
}

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
}

/// Reject requests without a valid admin token. Verified claims are added to
/// the request extensions.
pub async fn require_admin(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = bearer(req.headers()).ok_or_else(AppError::unauthorized)?;
    let claims = state.jwt.verify(token).map_err(|err| {
        tracing::debug!("rejected token for {}: {}", req.uri(), err);
        AppError::unauthorized()
    })?;

    if claims.role != ADMIN_ROLE {
        tracing::debug!(subject = %claims.sub, role = %claims.role, "non-admin token");
        return Err(AppError::forbidden());
    }

    req.extensions_mut().insert(claims);
    Ok(next.run(req).await)
}

#[cfg(test)]
pub fn issue_token(secret: &str, role: &str, ttl: chrono::Duration) -> String {
    use jsonwebtoken::{EncodingKey, Header, encode};

    let claims = Claims {
        sub: "tester".into(),
        role: role.into(),
        exp: (chrono::Utc::now() + ttl).timestamp().max(0) as usize,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    const SECRET: &str = "jwt-test-secret";

    #[test]
    fn accepts_token_signed_with_the_secret() {
        let verifier = JwtVerifier::new(SECRET);
        let claims = verifier
            .verify(&issue_token(SECRET, ADMIN_ROLE, Duration::hours(1)))
            .unwrap();
        assert_eq!(claims.role, ADMIN_ROLE);
        assert_eq!(claims.sub, "tester");
    }

    #[test]
    fn rejects_foreign_or_expired_tokens() {
        let verifier = JwtVerifier::new(SECRET);
        assert!(
            verifier
                .verify(&issue_token("other-secret", ADMIN_ROLE, Duration::hours(1)))
                .is_err()
        );
        assert!(
            verifier
                .verify(&issue_token(SECRET, ADMIN_ROLE, Duration::hours(-2)))
                .is_err()
        );
        assert!(verifier.verify("not-a-jwt").is_err());
    }

    #[test]
    fn reads_bearer_header() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer(&headers), None);
        headers.insert(header::AUTHORIZATION, "Bearer abc.def".parse().unwrap());
        assert_eq!(bearer(&headers), Some("abc.def"));
        headers.insert(header::AUTHORIZATION, "Basic abc".parse().unwrap());
        assert_eq!(bearer(&headers), None);
    }
}
