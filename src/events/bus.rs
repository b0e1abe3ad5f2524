//! Process-wide event bus
//!
//! Broadcast channel shared by every engine and session in the process.
//! Events are `{kind, key, value}` triples; the correlation key is the only
//! routing mechanism, so a subscription sees every event of its kind and the
//! session layer filters by key.

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::types::{Event, EventKind};

/// Default broadcast capacity. Shell output and progress updates are
/// advisory; a lagged receiver drops the missed events and keeps going.
const BUS_CAPACITY: usize = 256;

/// An event tagged with the correlation key of the session it belongs to.
#[derive(Debug, Clone)]
pub struct BusEvent {
    /// Correlation key of the originating session
    pub key: String,
    /// Typed payload
    pub event: Event,
}

/// Broadcast bus handle. Cheap to clone; all clones share one channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<BusEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BUS_CAPACITY);
        Self { sender }
    }

    /// Publish an event for the session identified by `key`.
    ///
    /// A send with no live subscribers is not an error (the session may not
    /// have opened the corresponding channel yet).
    pub fn emit(&self, key: &str, event: Event) {
        let bus_event = BusEvent {
            key: key.to_string(),
            event,
        };
        if self.sender.send(bus_event).is_err() {
            debug!("No subscribers on the bus, dropping event for session {}", key);
        }
    }

    /// Subscribe to all events of one kind.
    ///
    /// Spawns a forwarding task that invokes `listener` for every matching
    /// event until the subscription is removed or dropped.
    pub fn subscribe<F>(&self, kind: EventKind, listener: F) -> Subscription
    where
        F: Fn(BusEvent) + Send + 'static,
    {
        let mut rx = self.sender.subscribe();
        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(bus_event) => {
                        if bus_event.event.kind() == kind {
                            listener(bus_event);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("{} subscription lagged, {} events dropped", kind, missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Subscription { kind, task }
    }

    /// Number of live subscriptions (all kinds).
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to an active bus subscription.
///
/// Removing (or dropping) the handle stops the forwarding task; the listener
/// is never invoked afterwards.
pub struct Subscription {
    kind: EventKind,
    task: JoinHandle<()>,
}

impl Subscription {
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// Explicitly remove the subscription.
    pub fn remove(self) {
        debug!("Removing {} subscription", self.kind);
        // Drop does the abort
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    async fn settle() {
        // Give the forwarding tasks a chance to drain the channel
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_subscription_filters_by_kind() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));

        let _sub = {
            let seen = seen.clone();
            bus.subscribe(EventKind::Shell, move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            })
        };

        bus.emit("k1", Event::Shell("a".into()));
        bus.emit(
            "k1",
            Event::UploadProgress(crate::events::TransferProgress {
                transferred_bytes: 1,
                total_bytes: 2,
            }),
        );
        bus.emit("k2", Event::Shell("b".into()));
        settle().await;

        // Both Shell events (any key), but not the progress event
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_listener_receives_key_and_payload() {
        let bus = EventBus::new();
        let captured = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let _sub = {
            let captured = captured.clone();
            bus.subscribe(EventKind::Shell, move |ev| {
                if let Event::Shell(chunk) = ev.event {
                    captured.lock().push((ev.key, chunk));
                }
            })
        };

        bus.emit("key-a", Event::Shell("hello".into()));
        settle().await;

        let captured = captured.lock();
        assert_eq!(captured.len(), 1);
        assert_eq!(captured[0], ("key-a".to_string(), "hello".to_string()));
    }

    #[tokio::test]
    async fn test_removed_subscription_stops_delivery() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));

        let sub = {
            let seen = seen.clone();
            bus.subscribe(EventKind::Shell, move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            })
        };

        bus.emit("k", Event::Shell("1".into()));
        settle().await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        sub.remove();
        settle().await;

        bus.emit("k", Event::Shell("2".into()));
        settle().await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_emit_without_subscribers_is_noop() {
        let bus = EventBus::new();
        // Should not panic or error
        bus.emit("nobody", Event::Shell("dropped".into()));
        assert_eq!(bus.subscriber_count(), 0);
    }
}
