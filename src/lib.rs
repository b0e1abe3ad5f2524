//! OxideSSH - Mobile SSH/SFTP session bridge
//!
//! The session layer correlates a frontend-facing client object with one
//! engine-side SSH connection: commands are tagged with a per-session
//! correlation key, completions come back as async results, and out-of-band
//! output (shell data, transfer progress) is routed over a process-wide
//! event bus filtered by that key.
//!
//! ```no_run
//! use oxidessh::{EventKind, PtyType, SshBridge};
//!
//! # async fn demo() -> Result<(), oxidessh::SshError> {
//! let bridge = SshBridge::russh();
//! let client = bridge
//!     .connect_with_password("example.com", 22, "pi", "raspberry", None)
//!     .await?;
//!
//! let uptime = client.execute("uptime", None).await?;
//!
//! client.on(EventKind::Shell, |event| {
//!     // shell output chunks for this session only
//!     let _ = event;
//! });
//! client.start_shell(PtyType::Xterm, None).await?;
//! client.write_to_shell("ls -l\n", None).await?;
//!
//! let listing = client.sftp_ls(".", None).await?;
//! client.disconnect();
//! # let _ = (uptime, listing);
//! # Ok(())
//! # }
//! ```

pub mod engine;
pub mod error;
pub mod events;
pub mod session;
pub mod transport;

pub use engine::RusshEngine;
pub use error::SshError;
pub use events::{BusEvent, Event, EventBus, EventKind, Subscription, TransferProgress};
pub use session::{
    Callback, ConnectCallback, Credential, Endpoint, KeyPair, LsEntry, PtyType, SshBridge,
    SshClient,
};
pub use transport::NativeTransport;
