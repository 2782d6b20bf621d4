use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use russh::keys::{PublicKey, PublicKeyBase64};
use russh::server::{Auth, Handle, Msg, Session};
use russh::{Channel, ChannelId};
use scpd_common::{CredentialValidator, ScpdConfig, Secret, SessionId};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::*;

use crate::scp::{
    parse_options, tokenize_command, ScpError, ScpOptions, ScpSink, ScpSource, ACK_FATAL,
};
use crate::sftp;

pub struct ServerHandler {
    pub id: SessionId,
    pub remote_address: SocketAddr,
    config: Arc<ScpdConfig>,
    validator: Arc<dyn CredentialValidator>,
    username: Option<String>,
    channels: HashMap<ChannelId, Channel<Msg>>,
}

impl ServerHandler {
    pub fn new(
        id: SessionId,
        remote_address: SocketAddr,
        config: Arc<ScpdConfig>,
        validator: Arc<dyn CredentialValidator>,
    ) -> Self {
        Self {
            id,
            remote_address,
            config,
            validator,
            username: None,
            channels: HashMap::new(),
        }
    }
}

impl russh::server::Handler for ServerHandler {
    type Error = anyhow::Error;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        let password = Secret::new(password.to_owned());
        if self.validator.validate_password(user, &password) {
            info!(username = user, "Authenticated with password");
            self.username = Some(user.to_owned());
            Ok(Auth::Accept)
        } else {
            warn!(username = user, "Password rejected");
            Ok(Auth::reject())
        }
    }

    async fn auth_publickey_offered(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        if self
            .validator
            .validate_public_key(user, &public_key.public_key_base64())
        {
            Ok(Auth::Accept)
        } else {
            Ok(Auth::reject())
        }
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        if self
            .validator
            .validate_public_key(user, &public_key.public_key_base64())
        {
            info!(username = user, "Authenticated with public key");
            self.username = Some(user.to_owned());
            Ok(Auth::Accept)
        } else {
            warn!(username = user, "Public key rejected");
            Ok(Auth::reject())
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        debug!(channel = %channel.id(), "Opening session channel");
        self.channels.insert(channel.id(), channel);
        Ok(true)
    }

    async fn exec_request(
        &mut self,
        channel_id: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let command = String::from_utf8_lossy(data).into_owned();
        info!(%command, username = ?self.username, "Exec request");

        let Some(channel) = self.channels.remove(&channel_id) else {
            session.channel_failure(channel_id)?;
            return Ok(());
        };
        let handle = session.handle();
        let tokens = tokenize_command(&command);

        if !is_scp_command(&tokens) {
            warn!(%command, "Refusing to execute a non-scp command");
            session.channel_failure(channel_id)?;
            session.data(
                channel_id,
                &b"Only scp is supported by this server\n"[..],
            )?;
            tokio::spawn(async move {
                let _ = handle.close(channel_id).await;
                drop(channel);
            });
            return Ok(());
        }

        session.channel_success(channel_id)?;
        let options = parse_options(&tokens[1..]);
        let root = self.config.root_path();
        tokio::spawn(handle_exec(channel, handle, options, root).in_current_span());
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel_id: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        session.data(
            channel_id,
            &b"Opening a shell is not supported by this server\n"[..],
        )?;
        session.channel_failure(channel_id)?;
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel_id: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        info!(subsystem = name, "Subsystem request");
        if name != "sftp" {
            // Acknowledged but not serviced
            debug!(subsystem = name, "Ignoring unknown subsystem");
            session.channel_success(channel_id)?;
            return Ok(());
        }
        let Some(channel) = self.channels.remove(&channel_id) else {
            session.channel_failure(channel_id)?;
            return Ok(());
        };
        session.channel_success(channel_id)?;
        let root = self.config.root_path();
        tokio::spawn(sftp::handle_sftp(channel, session.handle(), root).in_current_span());
        Ok(())
    }

    async fn env_request(
        &mut self,
        channel_id: ChannelId,
        name: &str,
        value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(name, value, "Environment variable accepted and ignored");
        session.channel_success(channel_id)?;
        Ok(())
    }

    async fn pty_request(
        &mut self,
        channel_id: ChannelId,
        _term: &str,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        // There is no interactive mode, but scp clients sometimes probe
        session.channel_success(channel_id)?;
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel_id: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.channels.remove(&channel_id);
        Ok(())
    }
}

fn is_scp_command(tokens: &[String]) -> bool {
    tokens.first().map(String::as_str) == Some("scp")
}

async fn handle_exec(channel: Channel<Msg>, handle: Handle, options: ScpOptions, root: PathBuf) {
    let channel_id = channel.id();
    let stream = channel.into_stream();
    let (reader, writer) = tokio::io::split(stream);

    let exit_code = match run_transfer(reader, writer, options, root).await {
        Ok(code) => code,
        Err(error) => {
            warn!(%error, "Transfer failed");
            1
        }
    };
    debug!(exit_code, "Transfer finished");
    let _ = handle.exit_status_request(channel_id, exit_code).await;
    let _ = handle.eof(channel_id).await;
    let _ = handle.close(channel_id).await;
}

async fn run_transfer<R, W>(
    reader: R,
    mut writer: W,
    options: ScpOptions,
    root: PathBuf,
) -> Result<u32, ScpError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    match (options.to, options.from) {
        (true, false) => ScpSink::new(reader, writer, options, root).run().await,
        (false, true) => ScpSource::new(reader, writer, options, root).run().await,
        _ => {
            let message = "must be called with either -t or -f";
            writer.write_all(&[ACK_FATAL]).await?;
            writer.write_all(format!("scp: {message}\n").as_bytes()).await?;
            writer.flush().await?;
            Err(ScpError::Unsupported(message.to_owned()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn tokens(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_only_scp_is_dispatched() {
        assert!(is_scp_command(&tokens(&["scp", "-t", "/tmp"])));
        assert!(!is_scp_command(&tokens(&["ls", "-la"])));
        assert!(!is_scp_command(&tokens(&["/usr/bin/scp", "-t", "/tmp"])));
        assert!(!is_scp_command(&tokens(&[])));
    }

    async fn run_transfer_with(args: &[&str]) -> (Result<u32, ScpError>, Vec<u8>) {
        let dir = tempfile::tempdir().unwrap();
        let (client, server) = tokio::io::duplex(4096);
        let (client_read, _client_write) = tokio::io::split(client);
        let (server_read, server_write) = tokio::io::split(server);

        let options = parse_options(&tokens(args));
        let result = run_transfer(server_read, server_write, options, dir.path().to_path_buf())
            .await;

        let mut sent = Vec::new();
        let mut client_read = client_read;
        client_read.read_to_end(&mut sent).await.unwrap();
        (result, sent)
    }

    #[tokio::test]
    async fn test_transfer_without_a_role_is_refused() {
        let (result, sent) = run_transfer_with(&["somefile"]).await;
        assert!(matches!(result, Err(ScpError::Unsupported(_))));
        assert_eq!(sent[0], ACK_FATAL);
        let message = String::from_utf8_lossy(&sent[1..]).into_owned();
        assert!(message.contains("either -t or -f"));
    }

    #[tokio::test]
    async fn test_transfer_with_both_roles_is_refused() {
        let (result, sent) = run_transfer_with(&["-t", "-f", "somefile"]).await;
        assert!(matches!(result, Err(ScpError::Unsupported(_))));
        assert_eq!(sent[0], ACK_FATAL);
    }
}
