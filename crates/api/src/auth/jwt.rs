//! Bearer token verification

use async_trait::async_trait;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use crate::config::AuthKey;

/// Claims the gateway relies on. Other claims are ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject, used as the connection identity
    pub sub: String,
    /// Expiration
    pub exp: i64,
}

/// Verifies a bearer token and returns its claims
///
/// Token issuance lives elsewhere; the gateway only verifies.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<Claims, JwtError>;
}

/// JWT verifier checking signature, issuer, audience and expiry
#[derive(Clone)]
pub struct JwtVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    /// Create a verifier for the configured key material
    pub fn new(key: &AuthKey, issuer: &str, audience: &str) -> Result<Self, JwtError> {
        let (decoding_key, algorithm) = match key {
            AuthKey::Secret(secret) => (DecodingKey::from_secret(secret.as_bytes()), Algorithm::HS256),
            AuthKey::RsaPublicKeyPem(pem) => (
                DecodingKey::from_rsa_pem(pem.as_bytes()).map_err(|e| JwtError::Key(e.to_string()))?,
                Algorithm::RS256,
            ),
        };

        // Explicit algorithm prevents algorithm confusion attacks
        let mut validation = Validation::new(algorithm);
        validation.leeway = 60; // 60 second clock skew tolerance
        validation.set_issuer(&[issuer]);
        validation.set_audience(&[audience]);
        validation.set_required_spec_claims(&["exp", "sub", "iss", "aud"]);

        Ok(Self {
            decoding_key,
            validation,
        })
    }
}

#[async_trait]
impl TokenVerifier for JwtVerifier {
    async fn verify(&self, token: &str) -> Result<Claims, JwtError> {
        let claims = decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => JwtError::Expired,
                jsonwebtoken::errors::ErrorKind::InvalidToken => JwtError::Invalid,
                jsonwebtoken::errors::ErrorKind::InvalidAlgorithm => JwtError::Invalid,
                _ => JwtError::Validation(e.to_string()),
            })?;

        if claims.sub.trim().is_empty() {
            return Err(JwtError::MissingSubject);
        }

        Ok(claims)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum JwtError {
    #[error("Token has expired")]
    Expired,
    #[error("Invalid token")]
    Invalid,
    #[error("Token has no subject")]
    MissingSubject,
    #[error("Token validation error: {0}")]
    Validation(String),
    #[error("Invalid verification key: {0}")]
    Key(String),
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
pub(crate) mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use std::time::{SystemTime, UNIX_EPOCH};

    pub const SECRET: &str = "test-jwt-secret-must-be-at-least-32-characters-long";
    pub const ISSUER: &str = "https://auth.example.com";
    pub const AUDIENCE: &str = "drn-api";

    fn now() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64
    }

    pub fn sign(sub: &str, issuer: &str, audience: &str, exp_offset: i64) -> String {
        let claims = serde_json::json!({
            "sub": sub,
            "iss": issuer,
            "aud": audience,
            "iat": now(),
            "exp": now() + exp_offset,
        });
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }

    pub fn verifier() -> JwtVerifier {
        JwtVerifier::new(&AuthKey::Secret(SECRET.to_string()), ISSUER, AUDIENCE).unwrap()
    }

    #[tokio::test]
    async fn test_valid_token() {
        let token = sign("user-1", ISSUER, AUDIENCE, 3600);
        let claims = verifier().verify(&token).await.unwrap();
        assert_eq!(claims.sub, "user-1");
    }

    #[tokio::test]
    async fn test_expired_token() {
        let token = sign("user-1", ISSUER, AUDIENCE, -3600);
        assert!(matches!(verifier().verify(&token).await, Err(JwtError::Expired)));
    }

    #[tokio::test]
    async fn test_wrong_issuer_and_audience() {
        let token = sign("user-1", "https://evil.example.com", AUDIENCE, 3600);
        assert!(verifier().verify(&token).await.is_err());

        let token = sign("user-1", ISSUER, "someone-else", 3600);
        assert!(verifier().verify(&token).await.is_err());
    }

    #[tokio::test]
    async fn test_garbage_token() {
        assert!(verifier().verify("not-a-jwt").await.is_err());
    }

    #[tokio::test]
    async fn test_empty_subject() {
        let token = sign("", ISSUER, AUDIENCE, 3600);
        assert!(matches!(
            verifier().verify(&token).await,
            Err(JwtError::MissingSubject)
        ));
    }

    #[test]
    fn test_bad_pem_rejected() {
        let key = AuthKey::RsaPublicKeyPem("not a pem".to_string());
        assert!(matches!(
            JwtVerifier::new(&key, ISSUER, AUDIENCE),
            Err(JwtError::Key(_))
        ));
    }
}
