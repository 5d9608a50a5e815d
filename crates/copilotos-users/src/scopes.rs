use std::collections::HashSet;

use crate::types::User;

/// Scope set for an authenticated user.
///
/// Every active account can use tools and manage its own tasks. Accounts
/// listed in `mcp.admin_users` (username or email, case-insensitive) also
/// receive the admin scope family.
pub fn user_scopes(user: &User, admin_users: &[String]) -> HashSet<String> {
    let mut scopes: HashSet<String> = HashSet::from([
        "mcp:tools.*".to_string(),
        "mcp:tasks.create".to_string(),
        "mcp:tasks.read".to_string(),
        "mcp:tasks.cancel".to_string(),
    ]);

    let identifiers = [user.username.to_lowercase(), user.email.to_lowercase()];
    let is_admin = admin_users
        .iter()
        .map(|a| a.trim().to_lowercase())
        .any(|admin| identifiers.contains(&admin));
    if is_admin {
        scopes.insert("mcp:admin.*".to_string());
        scopes.insert("mcp:admin.tools.manage".to_string());
        scopes.insert("mcp:admin.metrics".to_string());
    }
    scopes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user() -> User {
        User {
            id: "u-1".to_string(),
            username: "demo".to_string(),
            email: "demo@example.mx".to_string(),
            password_hash: String::new(),
            is_active: true,
            preferences: serde_json::json!({}),
            last_login: None,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    #[test]
    fn standard_user_gets_tool_scopes() {
        let scopes = user_scopes(&user(), &[]);
        assert!(scopes.contains("mcp:tools.*"));
        assert!(!scopes.contains("mcp:admin.*"));
    }

    #[test]
    fn admin_matched_by_username_or_email() {
        let scopes = user_scopes(&user(), &["DEMO".to_string()]);
        assert!(scopes.contains("mcp:admin.*"));

        let scopes = user_scopes(&user(), &["demo@example.mx".to_string()]);
        assert!(scopes.contains("mcp:admin.metrics"));
    }
}
