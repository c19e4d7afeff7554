//! Identity change notifications.
//!
//! Multicast with no replay and no backpressure: each subscriber gets its own
//! unbounded channel and only sees changes published after it subscribed.
//! A dropped receiver is pruned on the next publish.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::trace;

#[derive(Debug, Clone, Default)]
pub struct IdentityChanges {
    subscribers: Arc<Mutex<Vec<UnboundedSender<String>>>>,
}

impl IdentityChanges {
    pub fn subscribe(&self) -> UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Fire-and-forget; never blocks on a subscriber.
    pub fn publish(&self, address: &str) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(address.to_owned()).is_ok());
        trace!(address, subscribers = subscribers.len(), "identity change published");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_live_subscriber_sees_later_changes() {
        let changes = IdentityChanges::default();
        changes.publish("early");

        let mut a = changes.subscribe();
        let mut b = changes.clone().subscribe();
        changes.publish("peer");

        assert_eq!(a.try_recv().unwrap(), "peer");
        assert_eq!(b.try_recv().unwrap(), "peer");
        assert!(a.try_recv().is_err());

        drop(b);
        changes.publish("again");
        assert_eq!(changes.subscribers.lock().len(), 1);
        assert_eq!(a.try_recv().unwrap(), "again");
    }
}
