//! SFTP operations for the russh engine
//!
//! File operations run over a `russh-sftp` session opened on its own channel.
//! Transfers are chunked copy loops that publish progress events per chunk
//! and poll an advisory cancellation flag registered in the connection's
//! transfer set.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{Local, TimeZone};
use parking_lot::RwLock;
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::FileAttributes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::error::SshError;
use crate::events::{Event, TransferProgress};
use crate::session::LsEntry;

use super::connection::Connection;

/// Chunk size for streaming transfers (64 KB)
const TRANSFER_CHUNK_SIZE: usize = 64 * 1024;

impl Connection {
    /// Open the SFTP subsystem. Idempotent-safe: resolves immediately when
    /// already open.
    pub(crate) async fn open_sftp(&self) -> Result<(), SshError> {
        if self.sftp.lock().is_some() {
            debug!("SFTP already open for session {}", self.key());
            return Ok(());
        }

        let channel = self.handle().channel_open_session().await?;
        channel.request_subsystem(true, "sftp").await.map_err(|e| {
            SshError::Sftp(format!("Failed to request SFTP subsystem: {}", e))
        })?;

        let sftp = SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| SshError::Sftp(e.to_string()))?;
        *self.sftp.lock() = Some(Arc::new(sftp));

        info!("SFTP subsystem opened for session {}", self.key());
        Ok(())
    }

    fn sftp(&self) -> Result<Arc<SftpSession>, SshError> {
        self.sftp
            .lock()
            .as_ref()
            .cloned()
            .ok_or_else(|| SshError::Sftp("SFTP subsystem not initialized".to_string()))
    }

    pub(crate) fn close_sftp(&self) {
        if self.sftp.lock().take().is_some() {
            debug!("SFTP closed for session {}", self.key());
        }
    }

    pub(crate) async fn sftp_ls(&self, path: &str) -> Result<Vec<LsEntry>, SshError> {
        let sftp = self.sftp()?;
        debug!("Listing directory {} for session {}", path, self.key());

        let read_dir = sftp.read_dir(path).await?;
        let mut entries = Vec::new();
        for entry in read_dir {
            let name = entry.file_name();
            if name == "." || name == ".." {
                continue;
            }
            entries.push(entry_from_attrs(name, &entry.metadata()));
        }
        Ok(entries)
    }

    pub(crate) async fn sftp_rename(&self, old_path: &str, new_path: &str) -> Result<(), SshError> {
        let sftp = self.sftp()?;
        info!("Renaming {} to {} for session {}", old_path, new_path, self.key());
        sftp.rename(old_path, new_path).await?;
        Ok(())
    }

    pub(crate) async fn sftp_mkdir(&self, path: &str) -> Result<(), SshError> {
        let sftp = self.sftp()?;
        info!("Creating directory {} for session {}", path, self.key());
        sftp.create_dir(path).await?;
        Ok(())
    }

    pub(crate) async fn sftp_rm(&self, path: &str) -> Result<(), SshError> {
        let sftp = self.sftp()?;
        info!("Removing file {} for session {}", path, self.key());
        sftp.remove_file(path).await?;
        Ok(())
    }

    pub(crate) async fn sftp_rmdir(&self, path: &str) -> Result<(), SshError> {
        let sftp = self.sftp()?;
        info!("Removing directory {} for session {}", path, self.key());
        sftp.remove_dir(path).await?;
        Ok(())
    }

    pub(crate) async fn sftp_chmod(&self, path: &str, mode: u32) -> Result<(), SshError> {
        let sftp = self.sftp()?;
        info!("Setting mode {:o} on {} for session {}", mode, path, self.key());
        let attrs = FileAttributes {
            permissions: Some(mode),
            ..Default::default()
        };
        sftp.set_metadata(path, attrs).await?;
        Ok(())
    }

    pub(crate) async fn sftp_upload(
        &self,
        local_path: &str,
        remote_path: &str,
    ) -> Result<(), SshError> {
        let sftp = self.sftp()?;
        let cancel = self.transfers.register(TransferDirection::Upload);
        info!("Uploading {} to {} for session {}", local_path, remote_path, self.key());

        let mut local_file = tokio::fs::File::open(local_path).await?;
        let total_bytes = local_file.metadata().await?.len();
        let mut remote_file = sftp
            .create(remote_path)
            .await
            .map_err(|e| SshError::Sftp(e.to_string()))?;

        let mut buffer = vec![0u8; TRANSFER_CHUNK_SIZE];
        let mut transferred = 0u64;
        loop {
            if cancel.is_cancelled() {
                info!(
                    "Upload cancelled for session {} at {} bytes",
                    self.key(),
                    transferred
                );
                return Err(SshError::TransferCancelled);
            }

            let bytes_read = local_file.read(&mut buffer).await?;
            if bytes_read == 0 {
                break;
            }

            remote_file
                .write_all(&buffer[..bytes_read])
                .await
                .map_err(|e| SshError::Sftp(e.to_string()))?;
            transferred += bytes_read as u64;

            self.bus().emit(
                self.key(),
                Event::UploadProgress(TransferProgress {
                    transferred_bytes: transferred,
                    total_bytes,
                }),
            );
        }

        remote_file
            .flush()
            .await
            .map_err(|e| SshError::Sftp(e.to_string()))?;

        info!(
            "Upload complete for session {} ({} bytes)",
            self.key(),
            transferred
        );
        Ok(())
    }

    pub(crate) async fn sftp_download(
        &self,
        remote_path: &str,
        local_path: &str,
    ) -> Result<String, SshError> {
        let sftp = self.sftp()?;
        let cancel = self.transfers.register(TransferDirection::Download);
        info!("Downloading {} to {} for session {}", remote_path, local_path, self.key());

        let total_bytes = sftp
            .metadata(remote_path)
            .await
            .map_err(|e| SshError::Sftp(e.to_string()))?
            .size
            .unwrap_or(0);
        let mut remote_file = sftp
            .open(remote_path)
            .await
            .map_err(|e| SshError::Sftp(e.to_string()))?;
        let mut local_file = tokio::fs::File::create(local_path).await?;

        let mut buffer = vec![0u8; TRANSFER_CHUNK_SIZE];
        let mut transferred = 0u64;
        loop {
            if cancel.is_cancelled() {
                info!(
                    "Download cancelled for session {} at {} bytes",
                    self.key(),
                    transferred
                );
                return Err(SshError::TransferCancelled);
            }

            let bytes_read = remote_file
                .read(&mut buffer)
                .await
                .map_err(|e| SshError::Sftp(e.to_string()))?;
            if bytes_read == 0 {
                break;
            }

            local_file.write_all(&buffer[..bytes_read]).await?;
            transferred += bytes_read as u64;

            self.bus().emit(
                self.key(),
                Event::DownloadProgress(TransferProgress {
                    transferred_bytes: transferred,
                    total_bytes,
                }),
            );
        }

        local_file.flush().await?;

        info!(
            "Download complete for session {} ({} bytes)",
            self.key(),
            transferred
        );
        Ok(local_path.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TransferDirection {
    Upload,
    Download,
}

/// Advisory cancellation flags for the transfers of one connection.
///
/// Cancellation is direction-scoped, not per transfer: a cancel command flips
/// the flag of every in-flight transfer of that direction. Each transfer
/// observes its flag between chunks and completes its own command with
/// [`SshError::TransferCancelled`].
pub(crate) struct TransferSet {
    controls: RwLock<HashMap<u64, (TransferDirection, watch::Sender<bool>)>>,
    next_id: AtomicU64,
}

impl TransferSet {
    pub(crate) fn new() -> Self {
        Self {
            controls: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Register an in-flight transfer; the handle unregisters on drop.
    pub(crate) fn register(&self, direction: TransferDirection) -> TransferHandle<'_> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = watch::channel(false);
        self.controls.write().insert(id, (direction, tx));
        TransferHandle {
            set: self,
            id,
            cancel_rx: rx,
        }
    }

    /// Flag every in-flight transfer of `direction` for cancellation.
    pub(crate) fn cancel(&self, direction: TransferDirection) {
        let controls = self.controls.read();
        let mut flagged = 0;
        for (direction_of, tx) in controls.values() {
            if *direction_of == direction {
                tx.send_replace(true);
                flagged += 1;
            }
        }
        if flagged > 0 {
            info!("Cancelled {} in-flight {:?} transfer(s)", flagged, direction);
        } else {
            debug!("No {:?} transfers to cancel", direction);
        }
    }

    /// Number of registered transfers of `direction`.
    pub(crate) fn active(&self, direction: TransferDirection) -> usize {
        self.controls
            .read()
            .values()
            .filter(|(d, _)| *d == direction)
            .count()
    }

    fn unregister(&self, id: u64) {
        self.controls.write().remove(&id);
    }
}

/// Registered in-flight transfer. Unregisters from the set on drop.
pub(crate) struct TransferHandle<'a> {
    set: &'a TransferSet,
    id: u64,
    cancel_rx: watch::Receiver<bool>,
}

impl TransferHandle<'_> {
    pub(crate) fn is_cancelled(&self) -> bool {
        *self.cancel_rx.borrow()
    }
}

impl Drop for TransferHandle<'_> {
    fn drop(&mut self) {
        self.set.unregister(self.id);
    }
}

fn entry_from_attrs(filename: String, attrs: &FileAttributes) -> LsEntry {
    LsEntry {
        filename,
        is_directory: attrs.is_dir(),
        modification_date: format_timestamp(attrs.mtime),
        last_access: format_timestamp(attrs.atime),
        file_size: attrs.size.unwrap_or(0),
        owner_user_id: attrs.uid.unwrap_or(0),
        owner_group_id: attrs.gid.unwrap_or(0),
        flags: attrs.permissions.unwrap_or(0),
    }
}

fn format_timestamp(secs: Option<u32>) -> String {
    secs.and_then(|s| Local.timestamp_opt(s as i64, 0).single())
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_set_cancels_by_direction() {
        let set = TransferSet::new();
        let up = set.register(TransferDirection::Upload);
        let down = set.register(TransferDirection::Download);

        assert!(!up.is_cancelled());
        assert!(!down.is_cancelled());

        set.cancel(TransferDirection::Upload);
        assert!(up.is_cancelled());
        assert!(!down.is_cancelled());
    }

    #[test]
    fn test_transfer_handle_unregisters_on_drop() {
        let set = TransferSet::new();
        let up = set.register(TransferDirection::Upload);
        assert_eq!(set.active(TransferDirection::Upload), 1);

        drop(up);
        assert_eq!(set.active(TransferDirection::Upload), 0);

        // Cancelling with nothing registered is a no-op
        set.cancel(TransferDirection::Upload);
    }

    #[test]
    fn test_cancel_flags_every_transfer_of_direction() {
        let set = TransferSet::new();
        let a = set.register(TransferDirection::Download);
        let b = set.register(TransferDirection::Download);

        set.cancel(TransferDirection::Download);
        assert!(a.is_cancelled());
        assert!(b.is_cancelled());
    }

    #[test]
    fn test_entry_from_attrs_maps_fields() {
        let attrs = FileAttributes {
            size: Some(1234),
            uid: Some(1000),
            gid: Some(100),
            permissions: Some(0o40755),
            atime: Some(1_700_000_000),
            mtime: Some(1_700_000_000),
            ..Default::default()
        };

        let entry = entry_from_attrs("src".to_string(), &attrs);
        assert_eq!(entry.filename, "src");
        assert!(entry.is_directory);
        assert_eq!(entry.file_size, 1234);
        assert_eq!(entry.owner_user_id, 1000);
        assert_eq!(entry.owner_group_id, 100);
        assert_eq!(entry.flags, 0o40755);
        assert!(!entry.modification_date.is_empty());
    }

    #[test]
    fn test_format_timestamp_handles_missing_value() {
        assert_eq!(format_timestamp(None), "");
        // A known instant formats to a full date-time string
        let formatted = format_timestamp(Some(1_700_000_000));
        assert_eq!(formatted.len(), "2023-11-14 22:13:20".len());
    }
}
