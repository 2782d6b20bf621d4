use std::path::Path;

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use scpd_common::helpers::fs::secure_file;
use scpd_common::{ScpdConfig, ScpdConfigStore};
use tracing::*;

pub fn load_config(path: &Path, secure: bool) -> Result<ScpdConfig> {
    if secure {
        secure_file(path).context("Could not secure config")?;
    }

    let store: ScpdConfigStore = Config::builder()
        .add_source(File::from(path))
        .add_source(Environment::with_prefix("SCPD"))
        .build()
        .context("Could not load config")?
        .try_deserialize()
        .context("Could not parse config")?;

    let config = ScpdConfig {
        store,
        paths_relative_to: path
            .parent()
            .context("Config path has no parent directory")?
            .to_path_buf(),
    };

    info!(
        "Using config: {path:?} (users: {}, root: {:?})",
        config.store.users.len(),
        config.store.root,
    );
    Ok(config)
}
