//! Organization-scoped bearer tokens
//!
//! HS256 JWTs whose `org_id` claim names the one organization the caller
//! may read from and write to.

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts},
};
use chrono::Utc;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::api::AppState;
use crate::error::{LedgerError, LedgerResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub org_id: String,
    pub exp: i64,
    pub iat: i64,
}

impl Claims {
    /// Reject access to any organization but the token's own.
    pub fn ensure_organization(&self, organization_id: &str) -> LedgerResult<()> {
        if self.org_id == organization_id {
            Ok(())
        } else {
            Err(LedgerError::Forbidden(format!(
                "token is scoped to another organization than {}",
                organization_id
            )))
        }
    }
}

pub struct TokenService {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    ttl_secs: i64,
}

impl TokenService {
    pub fn new(secret: &str, ttl_secs: u64) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_required_spec_claims(&["exp", "sub"]);

        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation,
            ttl_secs: ttl_secs as i64,
        }
    }

    pub fn issue(&self, subject: &str, organization_id: &str) -> LedgerResult<String> {
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: subject.to_string(),
            org_id: organization_id.to_string(),
            iat: now,
            exp: now + self.ttl_secs,
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| LedgerError::Config(format!("Failed to sign token: {}", e)))
    }

    pub fn validate(&self, token: &str) -> LedgerResult<Claims> {
        decode::<Claims>(token, &self.decoding, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => LedgerError::Unauthorized("token expired".to_string()),
                _ => LedgerError::Unauthorized("invalid token".to_string()),
            })
    }
}

/// Extractor for handlers that require a valid bearer token
#[derive(Debug, Clone)]
pub struct OrgAuth(pub Claims);

fn bearer_token(parts: &Parts) -> Option<&str> {
    parts
        .headers
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::trim)
}

#[async_trait]
impl FromRequestParts<AppState> for OrgAuth {
    type Rejection = LedgerError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts)
            .ok_or_else(|| LedgerError::Unauthorized("missing bearer token".to_string()))?;

        state.tokens.validate(token).map(OrgAuth).map_err(|e| {
            warn!(uri = %parts.uri, "Rejected bearer token: {}", e);
            e
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issue_and_validate() {
        let service = TokenService::new("test-secret-0123456789", 60);
        let token = service.issue("user-1", "org-a").unwrap();
        let claims = service.validate(&token).unwrap();
        assert_eq!(claims.sub, "user-1");
        assert_eq!(claims.org_id, "org-a");
        assert!(claims.ensure_organization("org-a").is_ok());
        assert!(matches!(
            claims.ensure_organization("org-b"),
            Err(LedgerError::Forbidden(_))
        ));
    }

    #[test]
    fn test_wrong_secret_is_rejected() {
        let token = TokenService::new("test-secret-0123456789", 60)
            .issue("user-1", "org-a")
            .unwrap();
        let other = TokenService::new("other-secret-0123456789", 60);
        assert!(matches!(other.validate(&token), Err(LedgerError::Unauthorized(_))));
    }
}
