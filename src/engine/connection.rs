//! One live russh connection
//!
//! Holds the authenticated handle plus the shell channel state for a single
//! correlation key. Shell output is pushed onto the event bus by a spawned
//! reader task; the write path goes through the handle directly so it never
//! contends with the reader.

use std::net::ToSocketAddrs;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use russh::client::{self, Handle, Msg};
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::{decode_secret_key, PublicKey};
use russh::{Channel, ChannelId, ChannelMsg, Disconnect};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::error::SshError;
use crate::events::{Event, EventBus};
use crate::session::{Credential, Endpoint, PtyType};

use super::sftp::TransferSet;

/// Connection establishment timeout
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Client handler for russh callbacks.
///
/// Host-key trust is the embedding application's decision (the bridge has no
/// UI to ask); the handler logs the key and accepts.
pub(crate) struct ClientHandler {
    host: String,
    port: u16,
}

impl ClientHandler {
    fn new(host: String, port: u16) -> Self {
        Self { host, port }
    }
}

impl client::Handler for ClientHandler {
    type Error = SshError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        info!(
            "Accepting {} host key for {}:{}",
            server_public_key.algorithm(),
            self.host,
            self.port
        );
        Ok(true)
    }
}

struct ShellChannel {
    id: ChannelId,
    reader: JoinHandle<()>,
}

/// An authenticated SSH connection and its channels.
pub(crate) struct Connection {
    key: String,
    bus: EventBus,
    handle: Arc<Handle<ClientHandler>>,
    shell: Mutex<Option<ShellChannel>>,
    pub(crate) sftp: Mutex<Option<Arc<russh_sftp::client::SftpSession>>>,
    pub(crate) transfers: TransferSet,
}

impl Connection {
    /// Connect and authenticate.
    pub(crate) async fn establish(
        endpoint: &Endpoint,
        credential: &Credential,
        key: &str,
        bus: EventBus,
    ) -> Result<Self, SshError> {
        let addr = format!("{}:{}", endpoint.host, endpoint.port);
        info!("Connecting to SSH server at {} for session {}", addr, key);

        let socket_addr = addr
            .to_socket_addrs()
            .map_err(|e| SshError::ConnectionFailed(format!("Failed to resolve address: {}", e)))?
            .next()
            .ok_or_else(|| SshError::ConnectionFailed("No address found".to_string()))?;

        let config = client::Config {
            inactivity_timeout: None,
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_max: 3,
            ..Default::default()
        };

        let handler = ClientHandler::new(endpoint.host.clone(), endpoint.port);

        let mut handle = tokio::time::timeout(
            CONNECT_TIMEOUT,
            client::connect(Arc::new(config), socket_addr, handler),
        )
        .await
        .map_err(|_| SshError::Timeout("Connection timed out".to_string()))?
        .map_err(|e| SshError::ConnectionFailed(e.to_string()))?;

        debug!("SSH handshake completed for session {}", key);

        let authenticated = match credential {
            Credential::Password(password) => handle
                .authenticate_password(&endpoint.username, password)
                .await
                .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?,
            Credential::Key(pair) => {
                let secret = decode_secret_key(&pair.private_key, pair.passphrase.as_deref())
                    .map_err(|e| SshError::KeyError(e.to_string()))?;
                let key_with_hash = PrivateKeyWithHashAlg::new(Arc::new(secret), None);
                handle
                    .authenticate_publickey(&endpoint.username, key_with_hash)
                    .await
                    .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?
            }
        };

        if !authenticated.success() {
            return Err(SshError::AuthenticationFailed(
                "Authentication rejected by server".to_string(),
            ));
        }

        info!("SSH authentication successful for session {}", key);

        Ok(Self {
            key: key.to_string(),
            bus,
            handle: Arc::new(handle),
            shell: Mutex::new(None),
            sftp: Mutex::new(None),
            transfers: TransferSet::new(),
        })
    }

    pub(crate) fn key(&self) -> &str {
        &self.key
    }

    pub(crate) fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub(crate) fn handle(&self) -> &Arc<Handle<ClientHandler>> {
        &self.handle
    }

    /// Run a one-shot command and collect its output.
    pub(crate) async fn execute(&self, command: &str) -> Result<String, SshError> {
        let mut channel = self.handle.channel_open_session().await?;
        channel
            .exec(true, command)
            .await
            .map_err(|e| SshError::ChannelError(e.to_string()))?;

        let mut stdout = Vec::new();
        loop {
            match channel.wait().await {
                Some(ChannelMsg::Data { data }) => stdout.extend_from_slice(&data),
                Some(ChannelMsg::ExitStatus { .. }) => {}
                Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => break,
                Some(_) => {}
            }
        }

        Ok(String::from_utf8_lossy(&stdout).to_string())
    }

    /// Open the shell channel. Output is event-borne on this platform, so the
    /// initial result is always empty. Idempotent-safe: an already-open shell
    /// resolves without touching the connection.
    pub(crate) async fn start_shell(&self, pty: PtyType) -> Result<String, SshError> {
        if self.shell.lock().is_some() {
            debug!("Shell already started for session {}", self.key);
            return Ok(String::new());
        }

        let channel = self.handle.channel_open_session().await?;
        channel
            .request_pty(false, pty.as_str(), 80, 24, 0, 0, &[])
            .await?;
        channel.request_shell(false).await?;

        let id = channel.id();
        let reader = tokio::spawn(shell_read_loop(
            channel,
            self.bus.clone(),
            self.key.clone(),
        ));
        *self.shell.lock() = Some(ShellChannel { id, reader });

        info!("Shell started for session {} ({})", self.key, pty);
        Ok(String::new())
    }

    /// Send data to the shell. Replies arrive as `Shell` events.
    pub(crate) async fn write_to_shell(&self, command: &str) -> Result<String, SshError> {
        let id = self
            .shell
            .lock()
            .as_ref()
            .map(|s| s.id)
            .ok_or_else(|| SshError::ChannelError("Shell not started".to_string()))?;

        // Write through the handle so the reader task keeps sole ownership of
        // the channel
        self.handle
            .data(id, command.as_bytes().to_vec().into())
            .await
            .map_err(|_| SshError::ChannelError("Failed to send data to shell".to_string()))?;

        Ok(String::new())
    }

    /// Drop the shell channel; the server closes it when the channel is
    /// dropped by the aborted reader.
    pub(crate) fn close_shell(&self) {
        if let Some(shell) = self.shell.lock().take() {
            shell.reader.abort();
            debug!("Shell closed for session {}", self.key);
        }
    }

    /// Tear the connection down.
    pub(crate) async fn disconnect(&self) {
        self.close_shell();
        self.close_sftp();
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "Session closed", "en")
            .await
        {
            debug!("Disconnect for session {} returned: {}", self.key, e);
        }
        info!("Session {} disconnected", self.key);
    }
}

/// Forward shell output chunks to the bus until the channel closes.
async fn shell_read_loop(mut channel: Channel<Msg>, bus: EventBus, key: String) {
    loop {
        match channel.wait().await {
            Some(ChannelMsg::Data { data }) => {
                bus.emit(&key, Event::Shell(String::from_utf8_lossy(&data).to_string()));
            }
            Some(ChannelMsg::ExtendedData { data, .. }) => {
                bus.emit(&key, Event::Shell(String::from_utf8_lossy(&data).to_string()));
            }
            Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => break,
            Some(_) => {}
        }
    }
    debug!("Shell channel closed for session {}", key);
}
