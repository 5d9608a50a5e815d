pub mod auth;
pub mod chat;
pub mod documents;
pub mod mcp;
pub mod misc;
pub mod sessions;
