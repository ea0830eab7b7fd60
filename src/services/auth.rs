//! Bearer tokens and password hashing.
//!
//! Tokens are compact HS256 JWTs: `base64url(header).base64url(claims).base64url(mac)`
//! with `{sub, iat, exp}` claims. Passwords are stored as argon2id PHC strings.

use std::sync::Arc;

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Algorithm, Argon2, Params, Version,
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use super::ServiceError;
use crate::utils::Clock;

type HmacSha256 = Hmac<Sha256>;

const TOKEN_HEADER: &str = r#"{"alg":"HS256","typ":"JWT"}"#;
const MAX_TOKEN_LEN: usize = 2048;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Claims {
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenError {
    #[error("Malformed token")]
    Malformed,
    #[error("Token signature mismatch")]
    InvalidSignature,
    #[error("Token expired")]
    Expired,
    #[error("Signing error: {0}")]
    Signing(String),
}

pub struct TokenSigner {
    secret: Vec<u8>,
    ttl_secs: i64,
    clock: Arc<dyn Clock>,
}

impl TokenSigner {
    pub fn new(secret: &str, ttl_secs: u64, clock: Arc<dyn Clock>) -> Self {
        Self {
            secret: secret.as_bytes().to_vec(),
            ttl_secs: i64::try_from(ttl_secs).unwrap_or(i64::MAX),
            clock,
        }
    }

    pub fn issue(&self, user_id: &str) -> Result<String, TokenError> {
        let iat = self.clock.now().timestamp();
        let claims = Claims {
            sub: user_id.to_string(),
            iat,
            exp: iat.saturating_add(self.ttl_secs),
        };

        let claims_json =
            serde_json::to_vec(&claims).map_err(|e| TokenError::Signing(e.to_string()))?;
        let signing_input = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(TOKEN_HEADER),
            URL_SAFE_NO_PAD.encode(claims_json)
        );
        let signature = self.sign(&signing_input)?;

        Ok(format!("{}.{}", signing_input, signature))
    }

    pub fn verify(&self, token: &str) -> Result<Claims, TokenError> {
        if token.len() > MAX_TOKEN_LEN {
            return Err(TokenError::Malformed);
        }

        let mut parts = token.split('.');
        let (Some(header), Some(claims), Some(signature), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(TokenError::Malformed);
        };

        if header != URL_SAFE_NO_PAD.encode(TOKEN_HEADER) {
            return Err(TokenError::Malformed);
        }

        let expected = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| TokenError::Malformed)?;
        let mut mac = self.mac()?;
        mac.update(header.as_bytes());
        mac.update(b".");
        mac.update(claims.as_bytes());
        mac.verify_slice(&expected)
            .map_err(|_| TokenError::InvalidSignature)?;

        let claims_json = URL_SAFE_NO_PAD
            .decode(claims)
            .map_err(|_| TokenError::Malformed)?;
        let claims: Claims =
            serde_json::from_slice(&claims_json).map_err(|_| TokenError::Malformed)?;

        if claims.exp <= self.clock.now().timestamp() {
            return Err(TokenError::Expired);
        }

        Ok(claims)
    }

    fn mac(&self) -> Result<HmacSha256, TokenError> {
        HmacSha256::new_from_slice(&self.secret).map_err(|e| TokenError::Signing(e.to_string()))
    }

    fn sign(&self, input: &str) -> Result<String, TokenError> {
        let mut mac = self.mac()?;
        mac.update(input.as_bytes());

        Ok(URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes()))
    }
}

/// Argon2id hashing with configurable cost. Hashing runs on the blocking pool.
#[derive(Clone)]
pub struct Passwords {
    params: Params,
}

impl Passwords {
    pub fn new(memory_kib: u32, iterations: u32) -> Result<Self, ServiceError> {
        let params = Params::new(memory_kib, iterations, 1, None)
            .map_err(|e| ServiceError::Internal(format!("Invalid argon2 parameters: {}", e)))?;

        Ok(Self { params })
    }

    fn argon2(&self) -> Argon2<'static> {
        Argon2::new(Algorithm::Argon2id, Version::V0x13, self.params.clone())
    }

    pub async fn hash(&self, password: String) -> Result<String, ServiceError> {
        let argon2 = self.argon2();

        tokio::task::spawn_blocking(move || {
            let salt = SaltString::generate(&mut OsRng);
            argon2
                .hash_password(password.as_bytes(), &salt)
                .map(|hash| hash.to_string())
        })
        .await
        .map_err(|e| ServiceError::Internal(e.to_string()))?
        .map_err(|e| ServiceError::Internal(format!("Password hashing failed: {}", e)))
    }

    pub async fn verify(&self, password: String, password_hash: String) -> Result<bool, ServiceError> {
        let argon2 = self.argon2();

        tokio::task::spawn_blocking(move || {
            let parsed = PasswordHash::new(&password_hash)
                .map_err(|e| ServiceError::Internal(format!("Stored hash unreadable: {}", e)))?;

            Ok(argon2.verify_password(password.as_bytes(), &parsed).is_ok())
        })
        .await
        .map_err(|e| ServiceError::Internal(e.to_string()))?
    }
}
