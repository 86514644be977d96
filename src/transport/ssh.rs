//! SSH transport over `russh`.

use super::{CommandOutput, Connection, Connector, ShellChannel, TransportError, FAILURE_EXIT_CODE};
use crate::config::RemoteHost;
use async_trait::async_trait;
use russh::client::{self, Handle, Msg};
use russh::{Channel, ChannelMsg, Disconnect};
use russh_keys::key;
use std::sync::Arc;
use std::time::Duration;

/// Terminal geometry for interactive shells. Wide so long commands do not wrap
/// in the echo, which would break echo stripping.
const PTY_COLUMNS: u32 = 512;
const PTY_ROWS: u32 = 48;

/// `dumb` keeps colour codes out of prompts on most distributions.
const PTY_TERM: &str = "dumb";

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

impl From<russh::Error> for TransportError {
    fn from(e: russh::Error) -> Self {
        match e {
            russh::Error::Disconnect | russh::Error::HUP => TransportError::Closed(e.to_string()),
            russh::Error::ConnectionTimeout => TransportError::Timeout(e.to_string()),
            russh::Error::IO(io) => TransportError::Connect(io.to_string()),
            other => TransportError::Protocol(other.to_string()),
        }
    }
}

/// SSH connection handler
pub struct ClientHandler {
    host: String,
}

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &key::PublicKey,
    ) -> Result<bool, Self::Error> {
        // Host keys are not pinned; the fingerprint is logged.
        tracing::debug!(
            "Host '{}' presented key {}",
            self.host,
            server_public_key.fingerprint()
        );
        Ok(true)
    }
}

/// Opens authenticated SSH connections.
pub struct SshConnector {
    connect_timeout: Duration,
}

impl SshConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl Connector for SshConnector {
    async fn connect(&self, host: &RemoteHost) -> Result<Arc<dyn Connection>, TransportError> {
        let config = Arc::new(client::Config::default());
        let addr = host.socket_addr();

        tracing::debug!("Connecting to {} ({})", host.name, addr);

        let handler = ClientHandler {
            host: host.name.clone(),
        };
        let connect_future = client::connect(config, addr.as_str(), handler);
        let mut handle = tokio::time::timeout(self.connect_timeout, connect_future)
            .await
            .map_err(|_| {
                TransportError::Timeout(format!(
                    "connecting to {} took longer than {:?}",
                    addr, self.connect_timeout
                ))
            })?
            .map_err(|e| TransportError::Connect(format!("{}: {}", addr, e)))?;

        authenticate(&mut handle, host).await?;

        tracing::info!("Connected to {} as {}", host.name, host.username);

        Ok(Arc::new(SshConnection {
            host: host.name.clone(),
            handle,
        }))
    }
}

/// Try key authentication first, then password.
async fn authenticate(handle: &mut Handle<ClientHandler>, host: &RemoteHost) -> Result<(), TransportError> {
    if let Some(path) = host.expanded_key_path() {
        let key = russh_keys::load_secret_key(&path, host.key_passphrase.as_deref())
            .map_err(|e| TransportError::Key(format!("{}: {}", path, e)))?;
        if handle
            .authenticate_publickey(&host.username, Arc::new(key))
            .await?
        {
            return Ok(());
        }
        tracing::debug!("Key {} rejected for {}@{}", path, host.username, host.name);
    }

    if let Some(password) = &host.password {
        if handle
            .authenticate_password(&host.username, password)
            .await?
        {
            return Ok(());
        }
    }

    Err(TransportError::Auth(format!(
        "server rejected credentials for user '{}'",
        host.username
    )))
}

pub struct SshConnection {
    host: String,
    handle: Handle<ClientHandler>,
}

#[async_trait]
impl Connection for SshConnection {
    async fn exec(&self, command: &str) -> Result<CommandOutput, TransportError> {
        let mut channel = self.handle.channel_open_session().await?;
        channel.exec(true, command).await?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_code = None;

        // ExitStatus may arrive after Eof, so read until the channel closes.
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => stdout.extend_from_slice(data),
                ChannelMsg::ExtendedData { ref data, ext } if ext == 1 => {
                    stderr.extend_from_slice(data)
                }
                ChannelMsg::ExitStatus { exit_status } => {
                    exit_code = Some(i32::try_from(exit_status).unwrap_or(FAILURE_EXIT_CODE))
                }
                ChannelMsg::ExitSignal { signal_name, .. } => {
                    stderr.extend_from_slice(format!("killed by signal {:?}", signal_name).as_bytes());
                    exit_code = Some(FAILURE_EXIT_CODE);
                }
                ChannelMsg::Close => break,
                _ => {}
            }
        }

        let exit_code = exit_code.ok_or_else(|| {
            TransportError::Closed(format!("{}: channel closed without exit status", self.host))
        })?;

        Ok(CommandOutput::new(
            exit_code,
            String::from_utf8_lossy(&stdout),
            String::from_utf8_lossy(&stderr),
        ))
    }

    async fn open_shell(&self) -> Result<Box<dyn ShellChannel>, TransportError> {
        let channel = self.handle.channel_open_session().await?;
        channel
            .request_pty(true, PTY_TERM, PTY_COLUMNS, PTY_ROWS, 0, 0, &[])
            .await?;
        channel.request_shell(true).await?;
        tracing::debug!("Opened interactive shell on {}", self.host);
        Ok(Box::new(SshShell {
            channel,
            carry: Vec::new(),
        }))
    }

    async fn probe(&self) -> bool {
        match tokio::time::timeout(PROBE_TIMEOUT, self.exec("echo ok")).await {
            Ok(Ok(out)) => out.success() && out.stdout.trim() == "ok",
            _ => false,
        }
    }

    async fn close(&self) {
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
        {
            tracing::debug!("Disconnect from {} failed: {}", self.host, e);
        }
    }
}

/// Interactive shell on a PTY channel.
pub struct SshShell {
    channel: Channel<Msg>,
    /// Trailing bytes of an incomplete UTF-8 sequence from the last chunk.
    carry: Vec<u8>,
}

#[async_trait]
impl ShellChannel for SshShell {
    async fn send(&mut self, data: &str) -> Result<(), TransportError> {
        self.channel.data(data.as_bytes()).await?;
        Ok(())
    }

    async fn recv(&mut self, wait: Duration) -> Result<Option<String>, TransportError> {
        let msg = match tokio::time::timeout(wait, self.channel.wait()).await {
            Err(_) => return Ok(None),
            Ok(None) => return Err(TransportError::Closed("shell channel ended".to_string())),
            Ok(Some(msg)) => msg,
        };

        match msg {
            ChannelMsg::Data { ref data } | ChannelMsg::ExtendedData { ref data, .. } => {
                Ok(Some(decode_utf8_chunk(&mut self.carry, data)))
            }
            ChannelMsg::Eof | ChannelMsg::Close | ChannelMsg::ExitStatus { .. } => {
                Err(TransportError::Closed("remote shell exited".to_string()))
            }
            _ => Ok(Some(String::new())),
        }
    }

    async fn close(&mut self) {
        let _ = self.channel.eof().await;
        let _ = self.channel.close().await;
    }
}

/// Decode a chunk, holding back an incomplete trailing UTF-8 sequence for the
/// next call. Invalid bytes become U+FFFD.
pub(crate) fn decode_utf8_chunk(carry: &mut Vec<u8>, chunk: &[u8]) -> String {
    carry.extend_from_slice(chunk);
    match std::str::from_utf8(carry) {
        Ok(s) => {
            let text = s.to_string();
            carry.clear();
            text
        }
        Err(e) if e.error_len().is_none() => {
            let valid = e.valid_up_to();
            let text = String::from_utf8_lossy(&carry[..valid]).into_owned();
            carry.drain(..valid);
            text
        }
        Err(_) => {
            let text = String::from_utf8_lossy(carry).into_owned();
            carry.clear();
            text
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_keeps_split_multibyte_sequence() {
        let bytes = "环境 ok".as_bytes();
        let mut carry = Vec::new();
        let first = decode_utf8_chunk(&mut carry, &bytes[..2]);
        assert_eq!(first, "");
        assert_eq!(carry.len(), 2);
        let rest = decode_utf8_chunk(&mut carry, &bytes[2..]);
        assert_eq!(rest, "环境 ok");
        assert!(carry.is_empty());
    }

    #[test]
    fn decode_replaces_invalid_bytes() {
        let mut carry = Vec::new();
        let text = decode_utf8_chunk(&mut carry, &[b'a', 0xff, b'b']);
        assert_eq!(text, "a\u{fffd}b");
        assert!(carry.is_empty());
    }

    #[test]
    fn russh_errors_map_to_transport_errors() {
        assert!(matches!(
            TransportError::from(russh::Error::Disconnect),
            TransportError::Closed(_)
        ));
        assert!(matches!(
            TransportError::from(russh::Error::ConnectionTimeout),
            TransportError::Timeout(_)
        ));
    }
}
