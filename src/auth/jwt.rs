//! HS256 access tokens.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

/// Access token payload. `sub` is the account email.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub uid: i64,
    pub iat: i64,
    pub exp: i64,
}

/// Issues and validates access tokens with a shared secret.
pub struct JwtHandler {
    encoding: EncodingKey,
    decoding: DecodingKey,
    expire_minutes: i64,
}

impl JwtHandler {
    pub fn new(secret: &str, expire_minutes: i64) -> Result<Self> {
        if secret.is_empty() {
            bail!("JWT secret must not be empty");
        }
        Ok(Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            expire_minutes,
        })
    }

    /// Token lifetime in seconds.
    pub fn expires_in_secs(&self) -> i64 {
        self.expire_minutes * 60
    }

    /// Issue a token for the given account.
    pub fn generate_token(&self, email: &str, user_id: i64) -> Result<String> {
        let now = Utc::now();
        let exp = now
            .checked_add_signed(chrono::Duration::minutes(self.expire_minutes))
            .context("Invalid token expiry")?;
        let claims = Claims {
            sub: email.to_string(),
            uid: user_id,
            iat: now.timestamp(),
            exp: exp.timestamp(),
        };

        tracing::debug!(user_id, expire_minutes = self.expire_minutes, "Issuing access token");
        encode(&Header::default(), &claims, &self.encoding).context("Failed to sign access token")
    }

    /// Verify signature and expiry; returns the claims.
    pub fn validate_token(&self, token: &str) -> Result<Claims> {
        let data = decode::<Claims>(token, &self.decoding, &Validation::default())
            .context("Invalid or expired token")?;
        Ok(data.claims)
    }
}
