use std::sync::Arc;

use tracing::warn;

use crate::helpers::hash::verify_password_hash;
use crate::{ScpdConfigStore, Secret, User, UserAuthCredential};

/// Decides whether an offered credential matches a known identity.
///
/// The SSH handshake consumes this through two narrow callbacks so that the
/// transfer code stays decoupled from how credentials are stored.
pub trait CredentialValidator: Send + Sync {
    fn validate_password(&self, username: &str, password: &Secret<String>) -> bool;

    /// `offered_key_base64` is the base64 blob of the offered key, without
    /// the algorithm prefix or comment.
    fn validate_public_key(&self, username: &str, offered_key_base64: &str) -> bool;
}

/// Validates credentials against the user table from the config file.
pub struct ConfigCredentialValidator {
    store: Arc<ScpdConfigStore>,
}

impl ConfigCredentialValidator {
    pub fn new(store: Arc<ScpdConfigStore>) -> Self {
        Self { store }
    }

    fn user(&self, username: &str) -> Option<&User> {
        self.store.users.iter().find(|u| u.username == username)
    }
}

impl CredentialValidator for ConfigCredentialValidator {
    fn validate_password(&self, username: &str, password: &Secret<String>) -> bool {
        let Some(user) = self.user(username) else {
            return false;
        };
        user.credentials.iter().any(|c| match c {
            UserAuthCredential::Password(c) => {
                verify_password_hash(password.expose_secret(), c.hash.expose_secret())
                    .unwrap_or_else(|error| {
                        warn!(%username, %error, "Invalid password hash in config");
                        false
                    })
            }
            _ => false,
        })
    }

    fn validate_public_key(&self, username: &str, offered_key_base64: &str) -> bool {
        let Some(user) = self.user(username) else {
            return false;
        };
        user.credentials.iter().any(|c| match c {
            UserAuthCredential::PublicKey(c) => {
                c.key.expose_secret().split_whitespace().nth(1) == Some(offered_key_base64)
            }
            _ => false,
        })
    }
}
