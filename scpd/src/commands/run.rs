use std::sync::Arc;

use anyhow::Result;
use scpd_common::ConfigCredentialValidator;
use scpd_protocol_ssh::run_server;
use tracing::*;

use crate::config::load_config;

pub(crate) async fn command(cli: &crate::Cli) -> Result<()> {
    let version = env!("CARGO_PKG_VERSION");
    info!(%version, "scpd");

    let config = Arc::new(load_config(&cli.config, true)?);
    if config.store.users.is_empty() {
        warn!("No users are configured, nobody will be able to authenticate");
    }
    let validator = Arc::new(ConfigCredentialValidator::new(Arc::new(
        config.store.clone(),
    )));

    if console::user_attended() {
        info!("--------------------------------------------");
        info!("scpd is now running.");
        info!("Accepting SSH connections on {}", config.store.listen);
        info!("Serving files from {:?}", config.root_path());
        info!("--------------------------------------------");
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Exiting");
            Ok(())
        }
        result = run_server(config, validator) => {
            if let Err(ref error) = result {
                error!(?error, "SSH server error");
            }
            result
        }
    }
}
