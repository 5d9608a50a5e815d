//! Authentication and account kernel.
//!
//! Registration with a password policy, login with upgradeable hashes,
//! JWT token pairs with a blacklist-backed logout, stateless password
//! reset tokens, and MCP scope assignment.

mod db;
mod scopes;
mod service;
mod tokens;
mod types;

pub use db::init_db;
pub use scopes::user_scopes;
pub use service::{AuthService, AuthTokens};
pub use tokens::{TokenClaims, TokenKind, TokenService};
pub use types::User;
