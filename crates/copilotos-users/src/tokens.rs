use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use copilotos_core::{ApiError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    Access,
    Refresh,
    Reset,
}

impl TokenKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenKind::Access => "access",
            TokenKind::Refresh => "refresh",
            TokenKind::Reset => "reset",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    /// User id for access/refresh tokens, email for reset tokens.
    pub sub: String,
    #[serde(rename = "type")]
    pub kind: TokenKind,
    pub exp: i64,
    pub iat: i64,
}

/// Stateless JWT issuance and verification.
pub struct TokenService {
    encoding: EncodingKey,
    decoding: DecodingKey,
    access_ttl_secs: u64,
    refresh_ttl_secs: u64,
}

const RESET_TTL_SECS: u64 = 30 * 60;

impl TokenService {
    pub fn new(secret: &str, access_ttl_secs: u64, refresh_ttl_secs: u64) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            access_ttl_secs,
            refresh_ttl_secs,
        }
    }

    pub fn access_ttl_secs(&self) -> u64 {
        self.access_ttl_secs
    }

    fn create(&self, sub: &str, kind: TokenKind, ttl_secs: u64) -> Result<String> {
        let now = Utc::now();
        let claims = TokenClaims {
            sub: sub.to_string(),
            kind,
            exp: (now + Duration::seconds(ttl_secs as i64)).timestamp(),
            iat: now.timestamp(),
        };
        encode(&Header::default(), &claims, &self.encoding)
            .map_err(|e| ApiError::Internal(format!("token encoding failed: {e}")))
    }

    pub fn create_access_token(&self, user_id: &str) -> Result<String> {
        self.create(user_id, TokenKind::Access, self.access_ttl_secs)
    }

    pub fn create_refresh_token(&self, user_id: &str) -> Result<String> {
        self.create(user_id, TokenKind::Refresh, self.refresh_ttl_secs)
    }

    /// Stateless reset token bound to the account email, valid 30 minutes.
    pub fn create_password_reset_token(&self, email: &str) -> Result<String> {
        self.create(email, TokenKind::Reset, RESET_TTL_SECS)
    }

    /// Decode and verify signature + expiry. Kind is checked by callers.
    pub fn decode(&self, token: &str) -> Result<TokenClaims> {
        decode::<TokenClaims>(token, &self.decoding, &Validation::default())
            .map(|data| data.claims)
            .map_err(|_| ApiError::InvalidToken)
    }

    /// Decode requiring a specific kind; an empty subject is invalid.
    pub fn decode_expecting(&self, token: &str, kind: TokenKind) -> Result<TokenClaims> {
        let claims = self.decode(token)?;
        if claims.kind != kind || claims.sub.is_empty() {
            return Err(ApiError::InvalidToken);
        }
        Ok(claims)
    }

    pub fn verify_password_reset_token(&self, token: &str) -> Result<String> {
        Ok(self.decode_expecting(token, TokenKind::Reset)?.sub)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> TokenService {
        TokenService::new("a-test-secret-key-of-enough-length", 1800, 604_800)
    }

    #[test]
    fn access_token_roundtrip() {
        let svc = service();
        let token = svc.create_access_token("u-1").expect("create");
        let claims = svc.decode_expecting(&token, TokenKind::Access).expect("decode");
        assert_eq!(claims.sub, "u-1");
        assert!(claims.exp > claims.iat);
    }

    #[test]
    fn kind_mismatch_rejected() {
        let svc = service();
        let refresh = svc.create_refresh_token("u-1").expect("create");
        assert!(svc.decode_expecting(&refresh, TokenKind::Access).is_err());
        assert!(svc.decode_expecting(&refresh, TokenKind::Refresh).is_ok());
    }

    #[test]
    fn reset_token_carries_email() {
        let svc = service();
        let token = svc.create_password_reset_token("ana@example.mx").expect("create");
        assert_eq!(
            svc.verify_password_reset_token(&token).expect("verify"),
            "ana@example.mx"
        );
    }

    #[test]
    fn tampered_token_rejected() {
        let svc = service();
        let token = svc.create_access_token("u-1").expect("create");
        let tampered = format!("{}x", token);
        assert!(svc.decode(&tampered).is_err());

        let other = TokenService::new("another-secret-another-secret-xx", 1800, 3600);
        assert!(other.decode(&token).is_err());
    }
}
