//! Native transport seam
//!
//! The session layer never touches the SSH/SFTP protocol itself. Everything
//! below the session goes through [`NativeTransport`]: an opaque asynchronous
//! command interface where every command carries the operation arguments plus
//! the correlation key of the session it belongs to.
//!
//! Each command completes exactly once — the returned future is the single
//! completion callback of the underlying engine. Fire-and-forget commands
//! (`close_shell`, the cancels, the disconnects) have no failure surface;
//! engines log and ignore unknown correlation keys there.
//!
//! Out-of-band output (shell data, transfer progress) does not flow through
//! command results. Engines publish it on the process-wide
//! [`EventBus`](crate::events::EventBus), tagged with the correlation key.

use async_trait::async_trait;

use crate::error::SshError;
use crate::session::{Credential, Endpoint, LsEntry, PtyType};

/// Asynchronous command interface to a platform SSH/SFTP engine.
#[async_trait]
pub trait NativeTransport: Send + Sync + 'static {
    /// Establish the connection for `key`. Authentication dispatches on the
    /// credential shape.
    async fn connect(
        &self,
        endpoint: &Endpoint,
        credential: &Credential,
        key: &str,
    ) -> Result<(), SshError>;

    /// Run a one-shot command, resolving with its output.
    async fn execute(&self, command: &str, key: &str) -> Result<String, SshError>;

    /// Start an interactive shell, resolving with any initial output the
    /// engine has on hand (possibly empty). Subsequent output arrives as
    /// `Shell` events.
    async fn start_shell(&self, key: &str, pty: PtyType) -> Result<String, SshError>;

    /// Write to the interactive shell, resolving with any immediate reply
    /// (possibly empty).
    async fn write_to_shell(&self, command: &str, key: &str) -> Result<String, SshError>;

    /// Tear down the shell channel. Fire-and-forget.
    async fn close_shell(&self, key: &str);

    /// Open the SFTP channel.
    async fn connect_sftp(&self, key: &str) -> Result<(), SshError>;

    /// List a remote directory.
    async fn sftp_ls(&self, path: &str, key: &str) -> Result<Vec<LsEntry>, SshError>;

    /// Rename/move a remote file or directory.
    async fn sftp_rename(&self, old_path: &str, new_path: &str, key: &str)
        -> Result<(), SshError>;

    /// Create a remote directory.
    async fn sftp_mkdir(&self, path: &str, key: &str) -> Result<(), SshError>;

    /// Remove a remote file.
    async fn sftp_rm(&self, path: &str, key: &str) -> Result<(), SshError>;

    /// Remove a remote directory.
    async fn sftp_rmdir(&self, path: &str, key: &str) -> Result<(), SshError>;

    /// Change permissions of a remote path. Engines that cannot express this
    /// surface their own error; there is no local precondition.
    async fn sftp_chmod(&self, path: &str, mode: u32, key: &str) -> Result<(), SshError>;

    /// Upload a local file.
    async fn sftp_upload(&self, local_path: &str, remote_path: &str, key: &str)
        -> Result<(), SshError>;

    /// Download a remote file, resolving with an engine-defined response
    /// (typically the local path).
    async fn sftp_download(
        &self,
        remote_path: &str,
        local_path: &str,
        key: &str,
    ) -> Result<String, SshError>;

    /// Request cancellation of the in-flight uploads for `key`.
    /// Fire-and-forget; the cancelled transfers complete their own commands
    /// with an error.
    async fn sftp_cancel_upload(&self, key: &str);

    /// Request cancellation of the in-flight downloads for `key`.
    /// Fire-and-forget.
    async fn sftp_cancel_download(&self, key: &str);

    /// Tear down the SFTP channel. Fire-and-forget.
    async fn disconnect_sftp(&self, key: &str);

    /// Tear down the whole connection. Fire-and-forget.
    async fn disconnect(&self, key: &str);
}
