//! Session coordinator
//!
//! One [`SshClient`] per logical SSH connection. The client owns the
//! connection's bridge-side state — correlation key, channel gates, transfer
//! counters, bus subscriptions, user handlers — and translates its methods
//! into [`NativeTransport`] commands tagged with the correlation key.
//!
//! Completion flows back as the command's single async result; out-of-band
//! output flows over the shared [`EventBus`] and is filtered here by
//! correlation key before reaching user handlers.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::SshError;
use crate::events::{Event, EventBus, EventKind, Subscription};
use crate::transport::NativeTransport;

use super::callback::{settle, Callback, ConnectCallback};
use super::state::{ChannelGate, OpenAttempt, TransferCounter};
use super::types::{Credential, Endpoint, KeyPair, LsEntry, PtyType};

type EventHandler = Arc<dyn Fn(Event) + Send + Sync>;

/// Entry point: holds the engine and the event bus, and constructs sessions.
pub struct SshBridge {
    transport: Arc<dyn NativeTransport>,
    bus: EventBus,
}

impl SshBridge {
    /// Bridge over an explicit engine and bus. The engine must publish its
    /// events on the same bus.
    pub fn new(transport: Arc<dyn NativeTransport>, bus: EventBus) -> Self {
        Self { transport, bus }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Connect with password authentication.
    pub async fn connect_with_password(
        &self,
        host: &str,
        port: u16,
        username: &str,
        password: &str,
        callback: Option<ConnectCallback>,
    ) -> Result<SshClient, SshError> {
        self.connect(
            Endpoint::new(host, port, username),
            Credential::Password(password.to_string()),
            callback,
        )
        .await
    }

    /// Connect with key-pair authentication.
    pub async fn connect_with_key(
        &self,
        host: &str,
        port: u16,
        username: &str,
        key_pair: KeyPair,
        callback: Option<ConnectCallback>,
    ) -> Result<SshClient, SshError> {
        self.connect(
            Endpoint::new(host, port, username),
            Credential::Key(key_pair),
            callback,
        )
        .await
    }

    async fn connect(
        &self,
        endpoint: Endpoint,
        credential: Credential,
        callback: Option<ConnectCallback>,
    ) -> Result<SshClient, SshError> {
        let key = Uuid::new_v4().to_string();
        info!("Connecting session {} to {}", key, endpoint);

        let result = self
            .transport
            .connect(&endpoint, &credential, &key)
            .await
            .map(|()| SshClient {
                inner: Arc::new(ClientInner {
                    key,
                    endpoint,
                    credential,
                    transport: self.transport.clone(),
                    bus: self.bus.clone(),
                    shell: ChannelGate::new("shell"),
                    sftp: ChannelGate::new("sftp"),
                    uploads: TransferCounter::new("upload"),
                    downloads: TransferCounter::new("download"),
                    listeners: Mutex::new(HashMap::new()),
                    handlers: Arc::new(RwLock::new(HashMap::new())),
                    closed: AtomicBool::new(false),
                }),
            });

        if let Some(cb) = callback {
            cb(result.as_ref().err());
        }
        result
    }
}

struct ClientInner {
    /// Correlation key routing engine completions and bus events back here
    key: String,
    endpoint: Endpoint,
    /// Retained for the session lifetime; engines may re-authenticate
    #[allow(dead_code)]
    credential: Credential,
    transport: Arc<dyn NativeTransport>,
    bus: EventBus,
    shell: ChannelGate,
    sftp: ChannelGate,
    uploads: TransferCounter,
    downloads: TransferCounter,
    /// At most one bus subscription per event kind
    listeners: Mutex<HashMap<EventKind, Subscription>>,
    /// At most one user handler per event kind, last registration wins
    handlers: Arc<RwLock<HashMap<EventKind, EventHandler>>>,
    closed: AtomicBool,
}

/// Client-side handle to one SSH connection.
///
/// Cheap to clone; clones share the same session state. The session is only
/// released by [`disconnect`](SshClient::disconnect) — after that every
/// operation fails with [`SshError::Disconnected`].
#[derive(Clone)]
pub struct SshClient {
    inner: Arc<ClientInner>,
}

impl SshClient {
    /// Correlation key of this session.
    pub fn key(&self) -> &str {
        &self.inner.key
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.inner.endpoint
    }

    pub fn shell_open(&self) -> bool {
        self.inner.shell.is_open()
    }

    pub fn sftp_open(&self) -> bool {
        self.inner.sftp.is_open()
    }

    pub fn uploads_in_flight(&self) -> usize {
        self.inner.uploads.current()
    }

    pub fn downloads_in_flight(&self) -> usize {
        self.inner.downloads.current()
    }

    pub fn is_disconnected(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Register the handler for one event kind, replacing any previous one.
    ///
    /// Events of a kind without a handler are dropped; that is not an error.
    pub fn on<F>(&self, kind: EventKind, handler: F)
    where
        F: Fn(Event) + Send + Sync + 'static,
    {
        if self
            .inner
            .handlers
            .write()
            .insert(kind, Arc::new(handler))
            .is_some()
        {
            debug!("Replaced {} handler for session {}", kind, self.inner.key);
        }
    }

    /// Run a one-shot command. No shell or SFTP precondition.
    pub async fn execute(
        &self,
        command: &str,
        callback: Option<Callback<String>>,
    ) -> Result<String, SshError> {
        let result = self.execute_inner(command).await;
        settle(result, callback)
    }

    async fn execute_inner(&self, command: &str) -> Result<String, SshError> {
        self.guard()?;
        self.inner.transport.execute(command, &self.inner.key).await
    }

    /// Start the interactive shell.
    ///
    /// Resolves with the engine's initial output. If the shell is already
    /// open this is a short-circuit: resolves immediately with an empty
    /// string and no engine command is issued.
    pub async fn start_shell(
        &self,
        pty: PtyType,
        callback: Option<Callback<String>>,
    ) -> Result<String, SshError> {
        let result = self.start_shell_inner(pty).await;
        settle(result, callback)
    }

    async fn start_shell_inner(&self, pty: PtyType) -> Result<String, SshError> {
        self.guard()?;
        Ok(self.open_shell(pty).await?.unwrap_or_default())
    }

    /// Write to the interactive shell, opening it first (default PTY) if
    /// needed. When the write triggered the open, the initial shell output
    /// plus a newline is prefixed to the reply.
    pub async fn write_to_shell(
        &self,
        command: &str,
        callback: Option<Callback<String>>,
    ) -> Result<String, SshError> {
        let result = self.write_to_shell_inner(command).await;
        settle(result, callback)
    }

    async fn write_to_shell_inner(&self, command: &str) -> Result<String, SshError> {
        self.guard()?;
        let prefix = match self.open_shell(PtyType::default()).await? {
            Some(initial) => format!("{}\n", initial),
            None => String::new(),
        };
        let reply = self
            .inner
            .transport
            .write_to_shell(command, &self.inner.key)
            .await?;
        Ok(format!("{}{}", prefix, reply))
    }

    /// Close the interactive shell. Safe to call when already closed.
    pub fn close_shell(&self) {
        if self.is_disconnected() {
            return;
        }
        self.remove_listener(EventKind::Shell);
        self.inner.shell.close();
        self.fire_and_forget(|t, key| async move { t.close_shell(&key).await });
    }

    /// Open the SFTP channel. No-op when already open.
    pub async fn connect_sftp(&self, callback: Option<Callback<()>>) -> Result<(), SshError> {
        let result = self.connect_sftp_inner().await;
        settle(result, callback)
    }

    async fn connect_sftp_inner(&self) -> Result<(), SshError> {
        self.guard()?;
        self.open_sftp().await
    }

    /// List a remote directory.
    pub async fn sftp_ls(
        &self,
        path: &str,
        callback: Option<Callback<Vec<LsEntry>>>,
    ) -> Result<Vec<LsEntry>, SshError> {
        let result = self.sftp_ls_inner(path).await;
        settle(result, callback)
    }

    async fn sftp_ls_inner(&self, path: &str) -> Result<Vec<LsEntry>, SshError> {
        self.guard()?;
        self.open_sftp().await?;
        self.inner.transport.sftp_ls(path, &self.inner.key).await
    }

    /// Rename/move a remote file or directory.
    pub async fn sftp_rename(
        &self,
        old_path: &str,
        new_path: &str,
        callback: Option<Callback<()>>,
    ) -> Result<(), SshError> {
        let result = self.sftp_rename_inner(old_path, new_path).await;
        settle(result, callback)
    }

    async fn sftp_rename_inner(&self, old_path: &str, new_path: &str) -> Result<(), SshError> {
        self.guard()?;
        self.open_sftp().await?;
        self.inner
            .transport
            .sftp_rename(old_path, new_path, &self.inner.key)
            .await
    }

    /// Create a remote directory.
    pub async fn sftp_mkdir(
        &self,
        path: &str,
        callback: Option<Callback<()>>,
    ) -> Result<(), SshError> {
        let result = self.sftp_mkdir_inner(path).await;
        settle(result, callback)
    }

    async fn sftp_mkdir_inner(&self, path: &str) -> Result<(), SshError> {
        self.guard()?;
        self.open_sftp().await?;
        self.inner.transport.sftp_mkdir(path, &self.inner.key).await
    }

    /// Remove a remote file.
    pub async fn sftp_rm(
        &self,
        path: &str,
        callback: Option<Callback<()>>,
    ) -> Result<(), SshError> {
        let result = self.sftp_rm_inner(path).await;
        settle(result, callback)
    }

    async fn sftp_rm_inner(&self, path: &str) -> Result<(), SshError> {
        self.guard()?;
        self.open_sftp().await?;
        self.inner.transport.sftp_rm(path, &self.inner.key).await
    }

    /// Remove a remote directory.
    pub async fn sftp_rmdir(
        &self,
        path: &str,
        callback: Option<Callback<()>>,
    ) -> Result<(), SshError> {
        let result = self.sftp_rmdir_inner(path).await;
        settle(result, callback)
    }

    async fn sftp_rmdir_inner(&self, path: &str) -> Result<(), SshError> {
        self.guard()?;
        self.open_sftp().await?;
        self.inner.transport.sftp_rmdir(path, &self.inner.key).await
    }

    /// Change permissions of a remote path. Engines without chmod support
    /// surface their own error.
    pub async fn sftp_chmod(
        &self,
        path: &str,
        mode: u32,
        callback: Option<Callback<()>>,
    ) -> Result<(), SshError> {
        let result = self.sftp_chmod_inner(path, mode).await;
        settle(result, callback)
    }

    async fn sftp_chmod_inner(&self, path: &str, mode: u32) -> Result<(), SshError> {
        self.guard()?;
        self.open_sftp().await?;
        self.inner
            .transport
            .sftp_chmod(path, mode, &self.inner.key)
            .await
    }

    /// Upload a local file.
    pub async fn sftp_upload(
        &self,
        local_path: &str,
        remote_path: &str,
        callback: Option<Callback<()>>,
    ) -> Result<(), SshError> {
        let result = self.sftp_upload_inner(local_path, remote_path).await;
        settle(result, callback)
    }

    async fn sftp_upload_inner(&self, local_path: &str, remote_path: &str) -> Result<(), SshError> {
        self.guard()?;
        self.open_sftp().await?;
        // Counted from just before the command is issued until its single
        // completion, success or failure
        let _marker = self.inner.uploads.begin();
        self.inner
            .transport
            .sftp_upload(local_path, remote_path, &self.inner.key)
            .await
    }

    /// Download a remote file. Resolves with the engine's response value
    /// (typically the local path).
    pub async fn sftp_download(
        &self,
        remote_path: &str,
        local_path: &str,
        callback: Option<Callback<String>>,
    ) -> Result<String, SshError> {
        let result = self.sftp_download_inner(remote_path, local_path).await;
        settle(result, callback)
    }

    async fn sftp_download_inner(
        &self,
        remote_path: &str,
        local_path: &str,
    ) -> Result<String, SshError> {
        self.guard()?;
        self.open_sftp().await?;
        let _marker = self.inner.downloads.begin();
        self.inner
            .transport
            .sftp_download(remote_path, local_path, &self.inner.key)
            .await
    }

    /// Request cancellation of in-flight uploads. No-op when none are in
    /// flight. The cancelled transfers complete their own commands (and
    /// decrement the counter) with an error.
    pub fn sftp_cancel_upload(&self) {
        if self.is_disconnected() {
            return;
        }
        if self.inner.uploads.current() == 0 {
            debug!("No uploads in flight for session {}, cancel skipped", self.inner.key);
            return;
        }
        self.fire_and_forget(|t, key| async move { t.sftp_cancel_upload(&key).await });
    }

    /// Request cancellation of in-flight downloads. No-op when none are in
    /// flight.
    pub fn sftp_cancel_download(&self) {
        if self.is_disconnected() {
            return;
        }
        if self.inner.downloads.current() == 0 {
            debug!("No downloads in flight for session {}, cancel skipped", self.inner.key);
            return;
        }
        self.fire_and_forget(|t, key| async move { t.sftp_cancel_download(&key).await });
    }

    /// Close the SFTP channel. Safe to call when already closed.
    pub fn disconnect_sftp(&self) {
        if self.is_disconnected() {
            return;
        }
        self.remove_listener(EventKind::DownloadProgress);
        self.remove_listener(EventKind::UploadProgress);
        self.inner.sftp.close();
        self.fire_and_forget(|t, key| async move { t.disconnect_sftp(&key).await });
    }

    /// Tear down the session. Closes the shell and SFTP channels if open,
    /// removes every bus subscription, and releases the engine connection.
    /// Idempotent; subsequent operations fail with
    /// [`SshError::Disconnected`].
    pub fn disconnect(&self) {
        if self.inner.shell.is_open() {
            self.close_shell();
        }
        if self.inner.sftp.is_open() {
            self.disconnect_sftp();
        }
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            debug!("Session {} already disconnected", self.inner.key);
            return;
        }
        info!("Disconnecting session {}", self.inner.key);
        self.inner.listeners.lock().clear();
        self.fire_and_forget(|t, key| async move { t.disconnect(&key).await });
    }

    fn guard(&self) -> Result<(), SshError> {
        if self.is_disconnected() {
            Err(SshError::Disconnected)
        } else {
            Ok(())
        }
    }

    /// Open the shell if needed. `Ok(None)` means it was already open;
    /// `Ok(Some(initial))` carries the engine's initial output.
    async fn open_shell(&self, pty: PtyType) -> Result<Option<String>, SshError> {
        loop {
            match self.inner.shell.begin_open() {
                OpenAttempt::AlreadyOpen => return Ok(None),
                OpenAttempt::Pending => self.inner.shell.opening_settled().await,
                OpenAttempt::Claimed(ticket) => {
                    // Route output before the engine can produce any
                    self.install_listener(EventKind::Shell);
                    let initial = self
                        .inner
                        .transport
                        .start_shell(&self.inner.key, pty)
                        .await?;
                    ticket.commit();
                    return Ok(Some(initial));
                }
            }
        }
    }

    /// Open the SFTP channel if needed; concurrent callers coalesce onto one
    /// engine connect.
    async fn open_sftp(&self) -> Result<(), SshError> {
        loop {
            match self.inner.sftp.begin_open() {
                OpenAttempt::AlreadyOpen => return Ok(()),
                OpenAttempt::Pending => self.inner.sftp.opening_settled().await,
                OpenAttempt::Claimed(ticket) => {
                    self.inner.transport.connect_sftp(&self.inner.key).await?;
                    self.install_listener(EventKind::DownloadProgress);
                    self.install_listener(EventKind::UploadProgress);
                    ticket.commit();
                    return Ok(());
                }
            }
        }
    }

    /// Subscribe this session to one event kind, replacing any previous
    /// subscription of that kind. The forwarding closure drops events whose
    /// key is not ours and events with no registered handler.
    fn install_listener(&self, kind: EventKind) {
        let handlers = self.inner.handlers.clone();
        let key = self.inner.key.clone();
        let sub = self.inner.bus.subscribe(kind, move |bus_event| {
            if bus_event.key != key {
                return;
            }
            let handler = handlers.read().get(&kind).cloned();
            if let Some(handler) = handler {
                handler(bus_event.event);
            }
        });
        self.inner.listeners.lock().insert(kind, sub);
    }

    fn remove_listener(&self, kind: EventKind) {
        if let Some(sub) = self.inner.listeners.lock().remove(&kind) {
            sub.remove();
        }
    }

    fn fire_and_forget<F, Fut>(&self, f: F)
    where
        F: FnOnce(Arc<dyn NativeTransport>, String) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let transport = self.inner.transport.clone();
        let key = self.inner.key.clone();
        tokio::spawn(f(transport, key));
    }
}
