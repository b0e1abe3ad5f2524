//! Built-in russh engine
//!
//! [`RusshEngine`] is this platform's SSH/SFTP engine: a
//! [`NativeTransport`] implementation over russh/russh-sftp. The protocol
//! work (key exchange, authentication, channel multiplexing, SFTP framing)
//! stays inside those libraries; the engine maps correlation keys to live
//! connections and publishes out-of-band output on the event bus.
//!
//! Other platforms plug in their own `NativeTransport`; the session layer
//! does not care which engine is underneath.

mod connection;
mod sftp;

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::error::SshError;
use crate::events::EventBus;
use crate::session::{Credential, Endpoint, LsEntry, PtyType, SshBridge};
use crate::transport::NativeTransport;

use connection::Connection;
use sftp::TransferDirection;

/// Correlation key → live connection registry.
pub struct RusshEngine {
    bus: EventBus,
    connections: DashMap<String, Arc<Connection>>,
}

impl RusshEngine {
    /// Engine publishing its events on `bus`. Sessions built over this
    /// engine must subscribe on the same bus.
    pub fn new(bus: EventBus) -> Self {
        Self {
            bus,
            connections: DashMap::new(),
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Number of live connections.
    pub fn active_connections(&self) -> usize {
        self.connections.len()
    }

    fn connection(&self, key: &str) -> Result<Arc<Connection>, SshError> {
        self.connections
            .get(key)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| SshError::SessionNotFound(key.to_string()))
    }

    /// Lookup for fire-and-forget commands: unknown keys are logged and
    /// ignored instead of failing.
    fn connection_or_ignore(&self, key: &str, command: &str) -> Option<Arc<Connection>> {
        match self.connection(key) {
            Ok(conn) => Some(conn),
            Err(_) => {
                debug!("{} for unknown session {}, ignoring", command, key);
                None
            }
        }
    }
}

#[async_trait]
impl NativeTransport for RusshEngine {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        credential: &Credential,
        key: &str,
    ) -> Result<(), SshError> {
        let conn = Connection::establish(endpoint, credential, key, self.bus.clone()).await?;
        if self
            .connections
            .insert(key.to_string(), Arc::new(conn))
            .is_some()
        {
            // Keys are generated unique; a collision means cross-session
            // event leakage upstream
            warn!("Replaced existing connection for key {}", key);
        }
        info!(
            "Connection established for session {} ({} active)",
            key,
            self.connections.len()
        );
        Ok(())
    }

    async fn execute(&self, command: &str, key: &str) -> Result<String, SshError> {
        self.connection(key)?.execute(command).await
    }

    async fn start_shell(&self, key: &str, pty: PtyType) -> Result<String, SshError> {
        self.connection(key)?.start_shell(pty).await
    }

    async fn write_to_shell(&self, command: &str, key: &str) -> Result<String, SshError> {
        self.connection(key)?.write_to_shell(command).await
    }

    async fn close_shell(&self, key: &str) {
        if let Some(conn) = self.connection_or_ignore(key, "close_shell") {
            conn.close_shell();
        }
    }

    async fn connect_sftp(&self, key: &str) -> Result<(), SshError> {
        self.connection(key)?.open_sftp().await
    }

    async fn sftp_ls(&self, path: &str, key: &str) -> Result<Vec<LsEntry>, SshError> {
        self.connection(key)?.sftp_ls(path).await
    }

    async fn sftp_rename(
        &self,
        old_path: &str,
        new_path: &str,
        key: &str,
    ) -> Result<(), SshError> {
        self.connection(key)?.sftp_rename(old_path, new_path).await
    }

    async fn sftp_mkdir(&self, path: &str, key: &str) -> Result<(), SshError> {
        self.connection(key)?.sftp_mkdir(path).await
    }

    async fn sftp_rm(&self, path: &str, key: &str) -> Result<(), SshError> {
        self.connection(key)?.sftp_rm(path).await
    }

    async fn sftp_rmdir(&self, path: &str, key: &str) -> Result<(), SshError> {
        self.connection(key)?.sftp_rmdir(path).await
    }

    async fn sftp_chmod(&self, path: &str, mode: u32, key: &str) -> Result<(), SshError> {
        self.connection(key)?.sftp_chmod(path, mode).await
    }

    async fn sftp_upload(
        &self,
        local_path: &str,
        remote_path: &str,
        key: &str,
    ) -> Result<(), SshError> {
        self.connection(key)?
            .sftp_upload(local_path, remote_path)
            .await
    }

    async fn sftp_download(
        &self,
        remote_path: &str,
        local_path: &str,
        key: &str,
    ) -> Result<String, SshError> {
        self.connection(key)?
            .sftp_download(remote_path, local_path)
            .await
    }

    async fn sftp_cancel_upload(&self, key: &str) {
        if let Some(conn) = self.connection_or_ignore(key, "sftp_cancel_upload") {
            conn.transfers.cancel(TransferDirection::Upload);
        }
    }

    async fn sftp_cancel_download(&self, key: &str) {
        if let Some(conn) = self.connection_or_ignore(key, "sftp_cancel_download") {
            conn.transfers.cancel(TransferDirection::Download);
        }
    }

    async fn disconnect_sftp(&self, key: &str) {
        if let Some(conn) = self.connection_or_ignore(key, "disconnect_sftp") {
            conn.close_sftp();
        }
    }

    async fn disconnect(&self, key: &str) {
        if let Some((_, conn)) = self.connections.remove(key) {
            conn.disconnect().await;
        } else {
            debug!("disconnect for unknown session {}, ignoring", key);
        }
    }
}

impl SshBridge {
    /// Bridge wired to the built-in russh engine on a fresh bus.
    pub fn russh() -> Self {
        let bus = EventBus::new();
        let engine = Arc::new(RusshEngine::new(bus.clone()));
        SshBridge::new(engine, bus)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_commands_on_unknown_key_fail_with_session_not_found() {
        let engine = RusshEngine::new(EventBus::new());
        assert_eq!(engine.active_connections(), 0);

        let result = engine.execute("ls", "missing").await;
        assert!(matches!(result, Err(SshError::SessionNotFound(_))));

        let result = engine.connect_sftp("missing").await;
        assert!(matches!(result, Err(SshError::SessionNotFound(_))));
    }

    #[tokio::test]
    async fn test_fire_and_forget_on_unknown_key_is_ignored() {
        let engine = RusshEngine::new(EventBus::new());
        engine.close_shell("missing").await;
        engine.sftp_cancel_upload("missing").await;
        engine.sftp_cancel_download("missing").await;
        engine.disconnect_sftp("missing").await;
        engine.disconnect("missing").await;
    }
}
