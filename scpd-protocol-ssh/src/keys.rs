use std::fs::{create_dir_all, File};

use anyhow::{Context, Result};
use russh::keys::{encode_pkcs8_pem, load_secret_key, HashAlg, PrivateKey};
use scpd_common::helpers::fs::{secure_directory, secure_file};
use scpd_common::helpers::rng::get_crypto_rng;
use scpd_common::ScpdConfig;
use tracing::*;

pub fn generate_host_keys(config: &ScpdConfig) -> Result<()> {
    let path = config.keys_path();
    create_dir_all(&path)?;
    secure_directory(&path)?;

    let key_path = path.join("host-ed25519");
    if !key_path.exists() {
        info!("Generating Ed25519 host key");
        let key = PrivateKey::random(&mut get_crypto_rng(), russh::keys::Algorithm::Ed25519)
            .context("Failed to generate Ed25519 key")?;
        let f = File::create(&key_path)?;
        encode_pkcs8_pem(&key, f)?;
    }
    secure_file(&key_path)?;

    let key_path = path.join("host-rsa");
    if !key_path.exists() {
        info!("Generating RSA host key (this can take a bit)");
        let key = PrivateKey::random(
            &mut get_crypto_rng(),
            russh::keys::Algorithm::Rsa {
                hash: Some(HashAlg::Sha512),
            },
        )
        .context("Failed to generate RSA key")?;
        let f = File::create(&key_path)?;
        encode_pkcs8_pem(&key, f)?;
    }
    secure_file(&key_path)?;

    Ok(())
}

pub fn load_host_keys(config: &ScpdConfig) -> Result<Vec<PrivateKey>, russh::keys::Error> {
    let path = config.keys_path();
    let mut keys = Vec::new();

    keys.push(load_secret_key(path.join("host-ed25519"), None)?);
    keys.push(load_secret_key(path.join("host-rsa"), None)?);

    Ok(keys)
}
