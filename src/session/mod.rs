//! Session layer
//!
//! Module structure:
//! - types: connection target, credentials, PTY types, listing entries
//! - state: channel gates and transfer counters
//! - callback: dual callback-then-future notification
//! - client: the session coordinator (`SshBridge`, `SshClient`)

pub mod callback;
pub mod client;
pub mod state;
pub mod types;

pub use callback::{Callback, ConnectCallback};
pub use client::{SshBridge, SshClient};
pub use types::{Credential, Endpoint, KeyPair, LsEntry, PtyType};
