//! Session channel state
//!
//! Two small state primitives used by the session client:
//!
//! - [`ChannelGate`] — explicit `Closed → Opening → Open` machine guarding the
//!   shell and SFTP channels. The `Opening` state closes the window where two
//!   concurrent first calls would both issue a native open command: exactly
//!   one caller claims the open, everyone else waits for it to settle and
//!   re-examines the gate.
//! - [`TransferCounter`] — in-flight transfer count with an RAII marker that
//!   decrements exactly once, on success and failure paths alike.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GateState {
    Closed,
    Opening,
    Open,
}

/// Guarded open/close state for one logical channel (shell or SFTP).
pub(crate) struct ChannelGate {
    name: &'static str,
    state: Mutex<GateState>,
    /// Notified on every transition out of `Opening`
    changed: Notify,
}

/// Outcome of [`ChannelGate::begin_open`].
pub(crate) enum OpenAttempt<'a> {
    /// Channel already open; short-circuit without a native command
    AlreadyOpen,
    /// Another caller is opening; wait via [`ChannelGate::opening_settled`]
    /// and re-examine the gate
    Pending,
    /// This caller owns the open; commit the ticket on success
    Claimed(OpenTicket<'a>),
}

impl ChannelGate {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            state: Mutex::new(GateState::Closed),
            changed: Notify::new(),
        }
    }

    pub fn is_open(&self) -> bool {
        *self.state.lock() == GateState::Open
    }

    /// Try to start opening the channel.
    pub fn begin_open(&self) -> OpenAttempt<'_> {
        let mut state = self.state.lock();
        match *state {
            GateState::Open => OpenAttempt::AlreadyOpen,
            GateState::Opening => OpenAttempt::Pending,
            GateState::Closed => {
                *state = GateState::Opening;
                debug!("{} channel opening", self.name);
                OpenAttempt::Claimed(OpenTicket {
                    gate: self,
                    committed: false,
                })
            }
        }
    }

    /// Wait until an in-flight open settles (commit or rollback).
    ///
    /// Returns immediately if the gate is no longer in `Opening`.
    pub async fn opening_settled(&self) {
        let notified = self.changed.notified();
        tokio::pin!(notified);
        // Register before re-checking so a settle between the check and the
        // await cannot be missed
        notified.as_mut().enable();
        if *self.state.lock() != GateState::Opening {
            return;
        }
        notified.await;
    }

    /// Close the channel. Returns whether it was open.
    pub fn close(&self) -> bool {
        let mut state = self.state.lock();
        let was_open = *state == GateState::Open;
        if *state == GateState::Opening {
            warn!("{} channel closed while an open was in flight", self.name);
        }
        *state = GateState::Closed;
        self.changed.notify_waiters();
        was_open
    }
}

/// Exclusive right to complete an in-flight open.
///
/// Dropping the ticket without [`commit`](OpenTicket::commit) rolls the gate
/// back to `Closed` (the native open failed or the caller bailed), so waiters
/// can claim the open for their own operation.
pub(crate) struct OpenTicket<'a> {
    gate: &'a ChannelGate,
    committed: bool,
}

impl OpenTicket<'_> {
    pub fn commit(mut self) {
        self.committed = true;
        let mut state = self.gate.state.lock();
        if *state == GateState::Opening {
            *state = GateState::Open;
            debug!("{} channel open", self.gate.name);
        }
        self.gate.changed.notify_waiters();
    }
}

impl Drop for OpenTicket<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        let mut state = self.gate.state.lock();
        if *state == GateState::Opening {
            *state = GateState::Closed;
            debug!("{} channel open rolled back", self.gate.name);
        }
        self.gate.changed.notify_waiters();
    }
}

/// In-flight transfer count for one direction.
pub(crate) struct TransferCounter {
    label: &'static str,
    count: Arc<AtomicUsize>,
}

impl TransferCounter {
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            count: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Increment the counter, returning a marker that decrements on drop.
    ///
    /// Create the marker immediately before issuing the native transfer
    /// command and keep it alive for the duration of the command.
    pub fn begin(&self) -> TransferMarker {
        let now = self.count.fetch_add(1, Ordering::SeqCst) + 1;
        debug!("{} started, {} in flight", self.label, now);
        TransferMarker {
            label: self.label,
            count: self.count.clone(),
        }
    }

    pub fn current(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

/// RAII marker that decrements its [`TransferCounter`] exactly once on drop.
pub(crate) struct TransferMarker {
    label: &'static str,
    count: Arc<AtomicUsize>,
}

impl Drop for TransferMarker {
    fn drop(&mut self) {
        let result = self
            .count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match result {
            Ok(prev) => debug!("{} finished, {} in flight", self.label, prev - 1),
            Err(_) => warn!("{} marker dropped with count already 0", self.label),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_gate_commit_opens() {
        let gate = ChannelGate::new("shell");
        assert!(!gate.is_open());

        match gate.begin_open() {
            OpenAttempt::Claimed(ticket) => ticket.commit(),
            _ => panic!("fresh gate should be claimable"),
        }
        assert!(gate.is_open());

        // Re-open short-circuits
        assert!(matches!(gate.begin_open(), OpenAttempt::AlreadyOpen));
    }

    #[test]
    fn test_gate_rollback_on_drop() {
        let gate = ChannelGate::new("sftp");
        match gate.begin_open() {
            OpenAttempt::Claimed(ticket) => drop(ticket),
            _ => panic!(),
        }
        assert!(!gate.is_open());

        // After rollback the gate is claimable again
        assert!(matches!(gate.begin_open(), OpenAttempt::Claimed(_)));
    }

    #[test]
    fn test_gate_close() {
        let gate = ChannelGate::new("shell");
        match gate.begin_open() {
            OpenAttempt::Claimed(ticket) => ticket.commit(),
            _ => panic!(),
        }
        assert!(gate.close());
        assert!(!gate.is_open());
        // Closing a closed gate is a no-op
        assert!(!gate.close());
    }

    #[test]
    fn test_gate_second_caller_pends() {
        let gate = ChannelGate::new("sftp");
        let ticket = match gate.begin_open() {
            OpenAttempt::Claimed(t) => t,
            _ => panic!(),
        };
        assert!(matches!(gate.begin_open(), OpenAttempt::Pending));
        ticket.commit();
        assert!(matches!(gate.begin_open(), OpenAttempt::AlreadyOpen));
    }

    #[tokio::test]
    async fn test_gate_waiter_wakes_on_commit() {
        let gate = Arc::new(ChannelGate::new("shell"));
        let ticket = match gate.begin_open() {
            OpenAttempt::Claimed(t) => t,
            _ => panic!(),
        };

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move {
                gate.opening_settled().await;
                gate.is_open()
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        ticket.commit();

        let open_after_wait = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
        assert!(open_after_wait);
    }

    #[tokio::test]
    async fn test_gate_settled_returns_immediately_when_not_opening() {
        let gate = ChannelGate::new("shell");
        // Not opening: must not hang
        tokio::time::timeout(Duration::from_millis(100), gate.opening_settled())
            .await
            .expect("settled wait on a closed gate should return immediately");
    }

    #[test]
    fn test_counter_marker_decrements_once() {
        let counter = TransferCounter::new("upload");
        assert_eq!(counter.current(), 0);

        let m1 = counter.begin();
        let m2 = counter.begin();
        assert_eq!(counter.current(), 2);

        drop(m1);
        assert_eq!(counter.current(), 1);
        drop(m2);
        assert_eq!(counter.current(), 0);
    }

    #[test]
    fn test_counter_underflow_does_not_panic() {
        let counter = TransferCounter::new("download");
        let marker = counter.begin();
        // Simulate a double decrement by constructing a second marker over
        // the same count
        let rogue = TransferMarker {
            label: "download",
            count: marker.count.clone(),
        };
        drop(marker);
        drop(rogue);
        assert_eq!(counter.current(), 0);
    }
}
