mod auth;
mod config;
pub mod helpers;
mod secret;

pub use auth::*;
pub use config::*;
pub use secret::Secret;

pub type SessionId = uuid::Uuid;
