//! Bearer credentials for the warehouse SQL API.
//!
//! Key-pair auth mints a short-lived RS256 JWT locally and caches it until
//! shortly before expiry. Static tokens are passed through unchanged.

use crate::config::WarehouseAuth;
use anyhow::{Context, Result};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

/// Lifetime requested for minted JWTs.
const JWT_LIFETIME_SECS: i64 = 3600;
/// Refresh this long before the cached JWT expires.
const REFRESH_MARGIN_SECS: i64 = 60;

#[derive(Clone)]
struct CachedToken {
    token: String,
    expires_at: i64,
}

/// Produces the `Authorization` bearer value and its token type header.
#[derive(Clone)]
pub struct TokenProvider {
    auth: WarehouseAuth,
    /// `ACCOUNT.USER`, upper-cased, as the key-pair issuer/subject prefix.
    qualified_user: String,
    cache: Arc<Mutex<Option<CachedToken>>>,
}

impl TokenProvider {
    pub fn new(auth: WarehouseAuth, account: &str, user: &str) -> Self {
        // Account locators may carry a region suffix; only the first segment is used.
        let account = account.split('.').next().unwrap_or(account);
        Self {
            auth,
            qualified_user: format!("{}.{}", account, user).to_uppercase(),
            cache: Arc::new(Mutex::new(None)),
        }
    }

    /// Value of the token-type header accompanying the bearer token.
    pub fn token_type(&self) -> &'static str {
        match self.auth {
            WarehouseAuth::Token(_) => "OAUTH",
            WarehouseAuth::KeyPair { .. } => "KEYPAIR_JWT",
        }
    }

    /// Current bearer token, minting a new JWT when the cached one is stale.
    pub fn bearer(&self) -> Result<String> {
        let (private_key_pem, fingerprint) = match &self.auth {
            WarehouseAuth::Token(token) => return Ok(token.clone()),
            WarehouseAuth::KeyPair {
                private_key_pem,
                public_key_fingerprint,
            } => (private_key_pem, public_key_fingerprint),
        };

        let now = chrono::Utc::now().timestamp();
        {
            let cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(ref cached) = *cache {
                if now < cached.expires_at - REFRESH_MARGIN_SECS {
                    return Ok(cached.token.clone());
                }
            }
        }

        let claims = serde_json::json!({
            "iss": format!("{}.{}", self.qualified_user, fingerprint),
            "sub": self.qualified_user,
            "iat": now,
            "exp": now + JWT_LIFETIME_SECS,
        });

        let header = jsonwebtoken::Header::new(jsonwebtoken::Algorithm::RS256);
        let encoding_key = jsonwebtoken::EncodingKey::from_rsa_pem(private_key_pem.as_bytes())
            .context("Invalid RSA private key")?;
        let token =
            jsonwebtoken::encode(&header, &claims, &encoding_key).context("Failed to encode JWT")?;

        debug!("Minted warehouse JWT for {}", self.qualified_user);

        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        *cache = Some(CachedToken {
            token: token.clone(),
            expires_at: now + JWT_LIFETIME_SECS,
        });

        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_token_passthrough() {
        let provider = TokenProvider::new(WarehouseAuth::Token("abc".into()), "acct", "me");
        assert_eq!(provider.bearer().unwrap(), "abc");
        assert_eq!(provider.token_type(), "OAUTH");
    }

    #[test]
    fn test_qualified_user_strips_region() {
        let provider = TokenProvider::new(
            WarehouseAuth::Token("abc".into()),
            "xy12345.us-east-1",
            "intake_bot",
        );
        assert_eq!(provider.qualified_user, "XY12345.INTAKE_BOT");
    }

    #[test]
    fn test_invalid_key_is_an_error() {
        let provider = TokenProvider::new(
            WarehouseAuth::KeyPair {
                private_key_pem: "not a key".into(),
                public_key_fingerprint: "SHA256:abc".into(),
            },
            "acct",
            "me",
        );
        assert_eq!(provider.token_type(), "KEYPAIR_JWT");
        assert!(provider.bearer().is_err());
    }
}
