use serde::{Deserialize, Serialize};

/// Full user record. The password hash never leaves this crate's public
/// serialization — see [`User::public`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    /// UUIDv7 — time-sortable.
    pub id: String,
    pub username: String,
    /// Normalized (lower-cased, trimmed) at registration.
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub is_active: bool,
    pub preferences: serde_json::Value,
    pub last_login: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl User {
    /// Wire-safe projection for `/me` and auth responses.
    pub fn public(&self) -> serde_json::Value {
        serde_json::json!({
            "id": self.id,
            "username": self.username,
            "email": self.email,
            "is_active": self.is_active,
            "preferences": self.preferences,
            "last_login": self.last_login,
            "created_at": self.created_at,
        })
    }
}
