//! Token issuance and verification.
//!
//! Access tokens are HS256 (HMAC-SHA256) JWTs with `{sub, role, iat, exp}`
//! claims and a 24-hour default validity. REST endpoints read the token
//! from the `Authorization: Bearer` header via extractors; the streaming
//! gateway reads it from a query parameter because many WebSocket clients
//! cannot set headers during the handshake.

use axum::extract::{FromRef, FromRequestParts};
use axum::http::request::Parts;
use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::model::Role;

/// Claims carried in every access token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject: tourist or authority id.
    pub sub: String,
    pub role: Role,
    /// Issued at (Unix seconds).
    pub iat: i64,
    /// Expiry (Unix seconds).
    pub exp: i64,
}

/// Issues and verifies access tokens.
#[derive(Clone)]
pub struct TokenService {
    encoding: EncodingKey,
    decoding: DecodingKey,
    expiry_min: i64,
}

impl TokenService {
    pub fn new(secret: &str, expiry_min: i64) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            expiry_min,
        }
    }

    /// Issue a token for a subject with the standard validity.
    pub fn issue(&self, sub: &str, role: Role) -> anyhow::Result<String> {
        self.issue_with_expiry(sub, role, Utc::now() + chrono::Duration::minutes(self.expiry_min))
    }

    /// Issue a token expiring at an explicit instant. Used by tests to
    /// exercise mid-stream expiry.
    pub fn issue_with_expiry(
        &self,
        sub: &str,
        role: Role,
        expires_at: DateTime<Utc>,
    ) -> anyhow::Result<String> {
        let claims = Claims {
            sub: sub.to_string(),
            role,
            iat: Utc::now().timestamp(),
            exp: expires_at.timestamp(),
        };
        Ok(encode(&Header::default(), &claims, &self.encoding)?)
    }

    /// Verify signature and expiry. Returns generic `Unauthorized` on any
    /// failure; no role disclosure.
    pub fn verify(&self, token: &str) -> Result<Claims, ApiError> {
        let mut validation = Validation::default();
        validation.leeway = 0;
        decode::<Claims>(token, &self.decoding, &validation)
            .map(|data| data.claims)
            .map_err(|_| ApiError::Unauthorized)
    }
}

/// An authenticated principal, extracted from the bearer token.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub id: String,
    pub role: Role,
    pub expires_at: DateTime<Utc>,
}

impl From<Claims> for AuthUser {
    fn from(claims: Claims) -> Self {
        Self {
            id: claims.sub,
            role: claims.role,
            expires_at: Utc
                .timestamp_opt(claims.exp, 0)
                .single()
                .unwrap_or_else(Utc::now),
        }
    }
}

fn bearer_token(parts: &Parts) -> Result<&str, ApiError> {
    parts
        .headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(ApiError::Unauthorized)
}

impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
    TokenService: FromRef<S>,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let tokens = TokenService::from_ref(state);
        let claims = tokens.verify(bearer_token(parts)?)?;
        Ok(claims.into())
    }
}

/// Guard: the caller must hold the tourist role (admins pass).
#[derive(Debug, Clone)]
pub struct TouristUser(pub AuthUser);

impl<S> FromRequestParts<S> for TouristUser
where
    S: Send + Sync,
    TokenService: FromRef<S>,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let user = AuthUser::from_request_parts(parts, state).await?;
        match user.role {
            Role::Tourist | Role::Admin => Ok(Self(user)),
            Role::Authority => Err(ApiError::Forbidden),
        }
    }
}

/// Guard: the caller must hold the authority role (admins pass).
#[derive(Debug, Clone)]
pub struct AuthorityUser(pub AuthUser);

impl<S> FromRequestParts<S> for AuthorityUser
where
    S: Send + Sync,
    TokenService: FromRef<S>,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let user = AuthUser::from_request_parts(parts, state).await?;
        match user.role {
            Role::Authority | Role::Admin => Ok(Self(user)),
            Role::Tourist => Err(ApiError::Forbidden),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> TokenService {
        TokenService::new("test-secret-0123456789abcdef0123456789abcdef", 1440)
    }

    #[test]
    fn test_issue_and_verify_round_trip() {
        let tokens = service();
        let token = tokens.issue("t1", Role::Tourist).unwrap();
        let claims = tokens.verify(&token).unwrap();
        assert_eq!(claims.sub, "t1");
        assert_eq!(claims.role, Role::Tourist);
        assert!(claims.exp > claims.iat);
    }

    #[test]
    fn test_expired_token_rejected() {
        let tokens = service();
        let token = tokens
            .issue_with_expiry("t1", Role::Tourist, Utc::now() - chrono::Duration::minutes(1))
            .unwrap();
        assert!(matches!(tokens.verify(&token), Err(ApiError::Unauthorized)));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let tokens = service();
        let other = TokenService::new("another-secret-0123456789abcdef01234567", 1440);
        let token = tokens.issue("t1", Role::Tourist).unwrap();
        assert!(matches!(other.verify(&token), Err(ApiError::Unauthorized)));
    }

    #[test]
    fn test_garbage_token_rejected() {
        assert!(matches!(
            service().verify("not-a-token"),
            Err(ApiError::Unauthorized)
        ));
    }
}
