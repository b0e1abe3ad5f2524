//! Out-of-band event plumbing
//!
//! - bus: process-wide broadcast bus and subscription handles
//! - types: typed event union and progress payloads

pub mod bus;
pub mod types;

pub use bus::{BusEvent, EventBus, Subscription};
pub use types::{Event, EventKind, TransferProgress};
