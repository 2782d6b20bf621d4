use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::helpers::hash::hash_password;
use crate::Secret;

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct UserPasswordCredential {
    pub hash: Secret<String>,
}

impl UserPasswordCredential {
    pub fn from_password(password: &Secret<String>) -> Self {
        Self {
            hash: Secret::new(hash_password(password.expose_secret())),
        }
    }
}

/// A public key in OpenSSH `authorized_keys` format (`<algo> <base64> [comment]`).
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct UserPublicKeyCredential {
    pub key: Secret<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum UserAuthCredential {
    #[serde(rename = "password")]
    Password(UserPasswordCredential),
    #[serde(rename = "publickey")]
    PublicKey(UserPublicKeyCredential),
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct User {
    pub username: String,
    #[serde(default)]
    pub credentials: Vec<UserAuthCredential>,
}

fn _default_listen() -> String {
    "0.0.0.0:8222".to_owned()
}

fn _default_root() -> PathBuf {
    "/".into()
}

fn _default_keys_path() -> String {
    "./keys".to_owned()
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ScpdConfigStore {
    #[serde(default = "_default_listen")]
    pub listen: String,

    /// Filesystem root that transfers are resolved against.
    #[serde(default = "_default_root")]
    pub root: PathBuf,

    /// Host key directory, relative to the config file.
    #[serde(default = "_default_keys_path")]
    pub keys: String,

    #[serde(default)]
    pub users: Vec<User>,

    /// Serve exactly one connection, then quit (useful for tests).
    #[serde(default)]
    pub one_shot: bool,
}

impl Default for ScpdConfigStore {
    fn default() -> Self {
        Self {
            listen: _default_listen(),
            root: _default_root(),
            keys: _default_keys_path(),
            users: vec![],
            one_shot: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScpdConfig {
    pub store: ScpdConfigStore,
    pub paths_relative_to: PathBuf,
}

impl ScpdConfig {
    pub fn keys_path(&self) -> PathBuf {
        self.paths_relative_to.join(&self.store.keys)
    }

    pub fn root_path(&self) -> PathBuf {
        self.store.root.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_defaults() {
        let store: ScpdConfigStore = serde_yaml::from_str("{}").unwrap();
        assert_eq!(store.listen, "0.0.0.0:8222");
        assert_eq!(store.root, PathBuf::from("/"));
        assert!(store.users.is_empty());
        assert!(!store.one_shot);
    }

    #[test]
    fn test_parse_users() {
        let store: ScpdConfigStore = serde_yaml::from_str(
            r#"
            listen: "127.0.0.1:2222"
            one_shot: true
            users:
              - username: alice
                credentials:
                  - type: password
                    hash: "$argon2id$v=19$m=19456,t=2,p=1$YWJjZA$YWJjZA"
                  - type: publickey
                    key: "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIKs alice@host"
            "#,
        )
        .unwrap();
        assert_eq!(store.users.len(), 1);
        assert_eq!(store.users[0].username, "alice");
        assert_eq!(store.users[0].credentials.len(), 2);
        assert!(matches!(
            store.users[0].credentials[0],
            UserAuthCredential::Password(_)
        ));
        assert!(store.one_shot);
    }
}
