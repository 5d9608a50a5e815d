use std::sync::{Arc, Mutex};
use std::time::Duration;

use argon2::password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use rusqlite::Connection;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use copilotos_core::cache::MemoryCache;
use copilotos_core::{ApiError, Result};

use crate::db::{init_db, row_to_user, USER_SELECT_SQL};
use crate::tokens::{TokenKind, TokenService};
use crate::types::User;

const MIN_PASSWORD_LENGTH: usize = 8;

/// Issued token pair.
#[derive(Debug, Clone, Serialize)]
pub struct AuthTokens {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: u64,
    pub token_type: &'static str,
}

/// Registration, login, refresh, logout and password reset over the
/// SQLite user store. The token blacklist lives in the shared KV cache
/// under `blacklist:<token>` with TTL to the token's expiry.
pub struct AuthService {
    db: Mutex<Connection>,
    cache: Arc<MemoryCache>,
    tokens: TokenService,
}

impl AuthService {
    pub fn new(conn: Connection, cache: Arc<MemoryCache>, tokens: TokenService) -> Result<Self> {
        init_db(&conn).map_err(|e| ApiError::Database(e.to_string()))?;
        Ok(Self {
            db: Mutex::new(conn),
            cache,
            tokens,
        })
    }

    pub fn tokens(&self) -> &TokenService {
        &self.tokens
    }

    // ── registration ─────────────────────────────────────────────────────

    #[instrument(skip(self, password))]
    pub fn register(&self, username: &str, email: &str, password: &str) -> Result<User> {
        let username = username.trim();
        let email = normalize_email(email);

        if username.is_empty() {
            return Err(ApiError::MissingField {
                field: "username".to_string(),
            });
        }
        if !email.contains('@') {
            return Err(ApiError::InvalidFormat("email".to_string()));
        }
        if password.len() < MIN_PASSWORD_LENGTH {
            return Err(ApiError::Validation(format!(
                "La contraseña debe tener al menos {MIN_PASSWORD_LENGTH} caracteres"
            )));
        }

        let db = self.db.lock().unwrap();
        if self.find_by_username_locked(&db, username)?.is_some() {
            return Err(ApiError::UsernameExists);
        }
        if self.find_by_email_locked(&db, &email)?.is_some() {
            return Err(ApiError::DuplicateEmail);
        }

        let id = Uuid::now_v7().to_string();
        let now = chrono::Utc::now().to_rfc3339();
        let password_hash = hash_password(password)?;
        db.execute(
            "INSERT INTO users (id, username, email, password_hash, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            rusqlite::params![id, username, email, password_hash, now],
        )
        .map_err(|e| ApiError::Database(e.to_string()))?;

        info!(user_id = %id, "user registered");
        Ok(User {
            id,
            username: username.to_string(),
            email,
            password_hash,
            is_active: true,
            preferences: serde_json::json!({}),
            last_login: None,
            created_at: now.clone(),
            updated_at: now,
        })
    }

    // ── login ────────────────────────────────────────────────────────────

    /// Authenticate by username or email. Legacy password hashes are
    /// upgraded to argon2 and persisted on successful verification.
    #[instrument(skip(self, password))]
    pub fn login(&self, identifier: &str, password: &str) -> Result<(User, AuthTokens)> {
        let mut user = self
            .find_by_identifier(identifier)?
            .ok_or(ApiError::InvalidCredentials)?;

        let verification = verify_password(password, &user.password_hash);
        match verification {
            PasswordCheck::Rejected => return Err(ApiError::InvalidCredentials),
            PasswordCheck::Accepted => {}
            PasswordCheck::AcceptedOutdated => {
                let upgraded = hash_password(password)?;
                let db = self.db.lock().unwrap();
                db.execute(
                    "UPDATE users SET password_hash = ?1, updated_at = ?2 WHERE id = ?3",
                    rusqlite::params![upgraded, chrono::Utc::now().to_rfc3339(), user.id],
                )
                .map_err(|e| ApiError::Database(e.to_string()))?;
                user.password_hash = upgraded;
                info!(user_id = %user.id, "password hash upgraded");
            }
        }

        if !user.is_active {
            return Err(ApiError::AccountInactive);
        }

        let now = chrono::Utc::now().to_rfc3339();
        {
            let db = self.db.lock().unwrap();
            db.execute(
                "UPDATE users SET last_login = ?1 WHERE id = ?2",
                rusqlite::params![now, user.id],
            )
            .map_err(|e| ApiError::Database(e.to_string()))?;
        }
        user.last_login = Some(now);

        let tokens = self.issue_tokens(&user.id)?;
        info!(user_id = %user.id, "user logged in");
        Ok((user, tokens))
    }

    fn issue_tokens(&self, user_id: &str) -> Result<AuthTokens> {
        Ok(AuthTokens {
            access_token: self.tokens.create_access_token(user_id)?,
            refresh_token: self.tokens.create_refresh_token(user_id)?,
            expires_in: self.tokens.access_ttl_secs(),
            token_type: "bearer",
        })
    }

    // ── refresh / logout ────────────────────────────────────────────────

    /// Exchange a refresh token for a fresh pair.
    pub fn refresh(&self, refresh_token: &str) -> Result<AuthTokens> {
        if self.is_blacklisted(refresh_token) {
            warn!("refresh attempted with a blacklisted token");
            return Err(ApiError::InvalidToken);
        }
        let claims = self.tokens.decode_expecting(refresh_token, TokenKind::Refresh)?;
        let user = self
            .get_user(&claims.sub)?
            .ok_or(ApiError::InvalidToken)?;
        if !user.is_active {
            return Err(ApiError::AccountInactive);
        }
        self.issue_tokens(&user.id)
    }

    /// Blacklist both tokens of the session, each until its own expiry.
    pub fn logout(&self, access_token: &str, refresh_token: Option<&str>) -> Result<()> {
        self.blacklist(access_token);
        if let Some(refresh) = refresh_token {
            self.blacklist(refresh);
        }
        Ok(())
    }

    fn blacklist(&self, token: &str) {
        // TTL to the exp claim; an undecodable token needs no blacklisting.
        let Ok(claims) = self.tokens.decode(token) else {
            return;
        };
        let remaining = (claims.exp - chrono::Utc::now().timestamp()).max(0) as u64;
        self.cache.set(
            format!("blacklist:{token}"),
            serde_json::json!(true),
            Some(Duration::from_secs(remaining)),
        );
    }

    pub fn is_blacklisted(&self, token: &str) -> bool {
        self.cache.contains(&format!("blacklist:{token}"))
    }

    /// Validate a bearer token for the request path: signature, kind,
    /// blacklist, account state. Returns the user id.
    pub fn authenticate_bearer(&self, token: &str) -> Result<String> {
        if self.is_blacklisted(token) {
            return Err(ApiError::InvalidToken);
        }
        let claims = self.tokens.decode_expecting(token, TokenKind::Access)?;
        let user = self.get_user(&claims.sub)?.ok_or(ApiError::InvalidToken)?;
        if !user.is_active {
            return Err(ApiError::AccountInactive);
        }
        Ok(user.id)
    }

    // ── password reset ──────────────────────────────────────────────────

    /// Issue a reset token when the account exists. Always returns Ok so
    /// the endpoint cannot be used for email enumeration; the token is
    /// `None` for unknown addresses.
    pub fn forgot_password(&self, email: &str) -> Result<Option<String>> {
        let email = normalize_email(email);
        let user = {
            let db = self.db.lock().unwrap();
            self.find_by_email_locked(&db, &email)?
        };
        match user {
            Some(_) => Ok(Some(self.tokens.create_password_reset_token(&email)?)),
            None => {
                warn!("password reset requested for unknown email");
                Ok(None)
            }
        }
    }

    pub fn reset_password(&self, token: &str, new_password: &str) -> Result<()> {
        if new_password.len() < MIN_PASSWORD_LENGTH {
            return Err(ApiError::Validation(format!(
                "La contraseña debe tener al menos {MIN_PASSWORD_LENGTH} caracteres"
            )));
        }
        let email = self.tokens.verify_password_reset_token(token)?;
        let hash = hash_password(new_password)?;
        let db = self.db.lock().unwrap();
        let changed = db
            .execute(
                "UPDATE users SET password_hash = ?1, updated_at = ?2 WHERE email = ?3",
                rusqlite::params![hash, chrono::Utc::now().to_rfc3339(), email],
            )
            .map_err(|e| ApiError::Database(e.to_string()))?;
        if changed == 0 {
            return Err(ApiError::InvalidToken);
        }
        info!("password reset completed");
        Ok(())
    }

    // ── preferences ─────────────────────────────────────────────────────

    /// Shallow-merge a preferences patch; a non-object patch replaces the
    /// whole blob.
    pub fn update_preferences(
        &self,
        user_id: &str,
        patch: serde_json::Value,
    ) -> Result<serde_json::Value> {
        let user = self.get_user(user_id)?.ok_or_else(|| ApiError::UserNotFound {
            id: user_id.to_string(),
        })?;

        let merged = match (user.preferences, &patch) {
            (serde_json::Value::Object(mut current), serde_json::Value::Object(incoming)) => {
                for (key, value) in incoming {
                    current.insert(key.clone(), value.clone());
                }
                serde_json::Value::Object(current)
            }
            _ => patch,
        };

        let db = self.db.lock().unwrap();
        db.execute(
            "UPDATE users SET preferences = ?1, updated_at = ?2 WHERE id = ?3",
            rusqlite::params![
                serde_json::to_string(&merged)?,
                chrono::Utc::now().to_rfc3339(),
                user_id
            ],
        )
        .map_err(|e| ApiError::Database(e.to_string()))?;
        Ok(merged)
    }

    // ── lookups ─────────────────────────────────────────────────────────

    pub fn get_user(&self, id: &str) -> Result<Option<User>> {
        let db = self.db.lock().unwrap();
        self.query_user(&db, &format!("{USER_SELECT_SQL} WHERE id = ?1"), id)
    }

    /// Username first; when the identifier looks like an email, fall back
    /// to the normalized email column.
    fn find_by_identifier(&self, identifier: &str) -> Result<Option<User>> {
        let db = self.db.lock().unwrap();
        if let Some(user) = self.find_by_username_locked(&db, identifier)? {
            return Ok(Some(user));
        }
        if identifier.contains('@') {
            return self.find_by_email_locked(&db, &normalize_email(identifier));
        }
        Ok(None)
    }

    fn find_by_username_locked(&self, db: &Connection, username: &str) -> Result<Option<User>> {
        self.query_user(db, &format!("{USER_SELECT_SQL} WHERE username = ?1"), username)
    }

    fn find_by_email_locked(&self, db: &Connection, email: &str) -> Result<Option<User>> {
        self.query_user(db, &format!("{USER_SELECT_SQL} WHERE email = ?1"), email)
    }

    fn query_user(&self, db: &Connection, sql: &str, param: &str) -> Result<Option<User>> {
        match db.query_row(sql, rusqlite::params![param], row_to_user) {
            Ok(user) => Ok(Some(user)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(ApiError::Database(e.to_string())),
        }
    }
}

fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| ApiError::Internal(format!("password hashing failed: {e}")))
}

enum PasswordCheck {
    Accepted,
    /// Verified against a deprecated scheme; re-hash and persist.
    AcceptedOutdated,
    Rejected,
}

/// Argon2 is the current scheme. Bare SHA-256 hex digests from the legacy
/// importer verify but are flagged for upgrade.
fn verify_password(password: &str, stored_hash: &str) -> PasswordCheck {
    if stored_hash.starts_with("$argon2") {
        let Ok(parsed) = PasswordHash::new(stored_hash) else {
            return PasswordCheck::Rejected;
        };
        return if Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok()
        {
            PasswordCheck::Accepted
        } else {
            PasswordCheck::Rejected
        };
    }

    if stored_hash.len() == 64 && stored_hash.chars().all(|c| c.is_ascii_hexdigit()) {
        let digest = hex::encode(Sha256::digest(password.as_bytes()));
        if digest == stored_hash.to_lowercase() {
            return PasswordCheck::AcceptedOutdated;
        }
    }
    PasswordCheck::Rejected
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> AuthService {
        let conn = Connection::open_in_memory().expect("open");
        AuthService::new(
            conn,
            Arc::new(MemoryCache::new()),
            TokenService::new("a-test-secret-key-of-enough-length", 1800, 604_800),
        )
        .expect("service")
    }

    #[test]
    fn register_normalizes_email_and_hashes() {
        let svc = service();
        let user = svc
            .register("demo", "  Demo@Example.MX ", "segura123")
            .expect("register");
        assert_eq!(user.email, "demo@example.mx");
        assert!(user.password_hash.starts_with("$argon2"));
    }

    #[test]
    fn duplicate_username_and_email_conflict() {
        let svc = service();
        svc.register("demo", "demo@example.mx", "segura123").expect("register");

        assert!(matches!(
            svc.register("demo", "otra@example.mx", "segura123"),
            Err(ApiError::UsernameExists)
        ));
        assert!(matches!(
            svc.register("otro", "DEMO@example.mx", "segura123"),
            Err(ApiError::DuplicateEmail)
        ));
    }

    #[test]
    fn short_password_rejected() {
        let svc = service();
        assert!(matches!(
            svc.register("demo", "demo@example.mx", "corta"),
            Err(ApiError::Validation(_))
        ));
    }

    #[test]
    fn login_by_username_and_email() {
        let svc = service();
        svc.register("demo", "demo@example.mx", "segura123").expect("register");

        let (user, tokens) = svc.login("demo", "segura123").expect("login");
        assert!(user.last_login.is_some());
        assert_eq!(tokens.token_type, "bearer");

        let (by_email, _) = svc.login("Demo@Example.mx", "segura123").expect("login");
        assert_eq!(by_email.id, user.id);

        assert!(matches!(
            svc.login("demo", "equivocada"),
            Err(ApiError::InvalidCredentials)
        ));
        assert!(matches!(
            svc.login("desconocido", "segura123"),
            Err(ApiError::InvalidCredentials)
        ));
    }

    #[test]
    fn legacy_hash_upgraded_on_login() {
        let svc = service();
        let user = svc.register("demo", "demo@example.mx", "segura123").expect("register");
        // Replace with a legacy SHA-256 digest directly in the store.
        let legacy = hex::encode(Sha256::digest("segura123".as_bytes()));
        {
            let db = svc.db.lock().unwrap();
            db.execute(
                "UPDATE users SET password_hash = ?1 WHERE id = ?2",
                rusqlite::params![legacy, user.id],
            )
            .expect("update");
        }

        let (logged_in, _) = svc.login("demo", "segura123").expect("login");
        assert!(logged_in.password_hash.starts_with("$argon2"));

        // The persisted hash was upgraded too.
        let stored = svc.get_user(&user.id).expect("get").expect("user");
        assert!(stored.password_hash.starts_with("$argon2"));
    }

    #[test]
    fn refresh_rejects_blacklisted_and_wrong_kind() {
        let svc = service();
        svc.register("demo", "demo@example.mx", "segura123").expect("register");
        let (_, tokens) = svc.login("demo", "segura123").expect("login");

        // Access token is not a refresh token.
        assert!(matches!(
            svc.refresh(&tokens.access_token),
            Err(ApiError::InvalidToken)
        ));

        // Works once, then logout blacklists it.
        svc.refresh(&tokens.refresh_token).expect("refresh");
        svc.logout(&tokens.access_token, Some(&tokens.refresh_token)).expect("logout");
        assert!(matches!(
            svc.refresh(&tokens.refresh_token),
            Err(ApiError::InvalidToken)
        ));
    }

    #[test]
    fn bearer_authentication_honors_blacklist() {
        let svc = service();
        let user = svc.register("demo", "demo@example.mx", "segura123").expect("register");
        let (_, tokens) = svc.login("demo", "segura123").expect("login");

        assert_eq!(
            svc.authenticate_bearer(&tokens.access_token).expect("auth"),
            user.id
        );
        svc.logout(&tokens.access_token, None).expect("logout");
        assert!(svc.authenticate_bearer(&tokens.access_token).is_err());
    }

    #[test]
    fn preferences_merge_shallowly() {
        let svc = service();
        let user = svc.register("demo", "demo@example.mx", "segura123").expect("register");
        svc.update_preferences(&user.id, serde_json::json!({"theme": "dark", "lang": "es"}))
            .expect("patch");
        let merged = svc
            .update_preferences(&user.id, serde_json::json!({"lang": "en"}))
            .expect("patch");
        assert_eq!(merged["theme"], "dark");
        assert_eq!(merged["lang"], "en");

        let stored = svc.get_user(&user.id).expect("get").expect("user");
        assert_eq!(stored.preferences["lang"], "en");
    }

    #[test]
    fn password_reset_flow() {
        let svc = service();
        svc.register("demo", "demo@example.mx", "segura123").expect("register");

        // Unknown email still succeeds, without a token.
        assert!(svc.forgot_password("nadie@example.mx").expect("ok").is_none());

        let token = svc
            .forgot_password("demo@example.mx")
            .expect("ok")
            .expect("token");
        svc.reset_password(&token, "nueva-clave-123").expect("reset");
        svc.login("demo", "nueva-clave-123").expect("login with new password");
        assert!(matches!(
            svc.login("demo", "segura123"),
            Err(ApiError::InvalidCredentials)
        ));
    }
}
