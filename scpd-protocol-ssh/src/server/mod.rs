mod handler;

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use scpd_common::{CredentialValidator, ScpdConfig, SessionId};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tracing::*;
use uuid::Uuid;

pub use handler::ServerHandler;

use crate::{generate_host_keys, load_host_keys};

pub async fn run_server(
    config: Arc<ScpdConfig>,
    validator: Arc<dyn CredentialValidator>,
) -> Result<()> {
    generate_host_keys(&config)?;

    let russh_config = russh::server::Config {
        auth_rejection_time: Duration::from_secs(1),
        auth_rejection_time_initial: Some(Duration::from_secs(0)),
        keys: load_host_keys(&config)?,
        ..Default::default()
    };
    let russh_config = Arc::new(russh_config);

    let listener = TcpListener::bind(&config.store.listen).await?;
    info!(address = %config.store.listen, "Accepting connections");

    loop {
        let (socket, remote_address) = listener.accept().await?;
        let id: SessionId = Uuid::new_v4();
        let handler = ServerHandler::new(id, remote_address, config.clone(), validator.clone());

        if config.store.one_shot {
            info!(%id, %remote_address, "Connection accepted, serving it and exiting");
            return _run_stream(russh_config, socket, handler)
                .instrument(info_span!("session", %id))
                .await;
        }

        info!(%id, %remote_address, "Connection accepted");
        let russh_config = russh_config.clone();
        tokio::spawn(
            async move {
                if let Err(error) = _run_stream(russh_config, socket, handler).await {
                    error!(%error, "Session failed");
                }
            }
            .instrument(info_span!("session", %id)),
        );
    }
}

async fn _run_stream<R>(
    config: Arc<russh::server::Config>,
    socket: R,
    handler: ServerHandler,
) -> Result<()>
where
    R: AsyncRead + AsyncWrite + Unpin + Debug + Send + 'static,
{
    let session = russh::server::run_stream(config, socket, handler).await?;
    session.await?;
    Ok(())
}
