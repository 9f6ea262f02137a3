//! Change notification bus for the cell rule engine
//!
//! This crate provides the ChangeBus, the shared channel every cell mutation
//! is posted onto. Each subscriber gets its own unbounded queue, so events
//! are delivered in the order they were fired, without loss or coalescing.

use cellrules_core::ChangeEvent;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;

/// A unique identifier for a bus subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

/// The bus carrying cell change notifications
pub struct ChangeBus {
    subscribers: DashMap<SubscriberId, mpsc::UnboundedSender<ChangeEvent>>,
    next_subscriber_id: AtomicU64,
}

impl ChangeBus {
    /// Create a new change bus
    pub fn new() -> Self {
        Self {
            subscribers: DashMap::new(),
            next_subscriber_id: AtomicU64::new(1),
        }
    }

    /// Subscribe to all change notifications fired from now on
    pub fn subscribe(&self) -> (SubscriberId, mpsc::UnboundedReceiver<ChangeEvent>) {
        let id = SubscriberId(self.next_subscriber_id.fetch_add(1, Ordering::SeqCst));
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.insert(id, tx);
        trace!(subscriber = id.0, "Subscribed to change bus");
        (id, rx)
    }

    /// Drop a subscription; its receiver sees the end of the stream
    pub fn unsubscribe(&self, id: SubscriberId) {
        if self.subscribers.remove(&id).is_some() {
            trace!(subscriber = id.0, "Unsubscribed from change bus");
        }
    }

    /// Post a change notification to every subscriber
    pub fn fire(&self, event: ChangeEvent) {
        trace!(device = %event.device, cell = %event.cell, "Firing change");
        // Subscribers whose receiver is gone are pruned
        self.subscribers
            .retain(|_, tx| tx.send(event.clone()).is_ok());
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

impl Default for ChangeBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Thread-safe wrapper for ChangeBus
pub type SharedChangeBus = Arc<ChangeBus>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribe_and_fire() {
        let bus = ChangeBus::new();
        let (_, mut rx) = bus.subscribe();

        bus.fire(ChangeEvent::cell("dev", "temp"));

        let received = rx.recv().await.unwrap();
        assert_eq!(received, ChangeEvent::cell("dev", "temp"));
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let bus = ChangeBus::new();
        let (_, mut rx) = bus.subscribe();

        for i in 0..100 {
            bus.fire(ChangeEvent::cell("dev", format!("c{}", i)));
        }

        for i in 0..100 {
            let ev = rx.recv().await.unwrap();
            assert_eq!(ev.cell, format!("c{}", i));
        }
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let bus = ChangeBus::new();
        let (_, mut rx1) = bus.subscribe();
        let (_, mut rx2) = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        bus.fire(ChangeEvent::device("dev"));

        assert!(rx1.recv().await.unwrap().is_device_level());
        assert!(rx2.recv().await.unwrap().is_device_level());
    }

    #[tokio::test]
    async fn test_unsubscribe_closes_stream() {
        let bus = ChangeBus::new();
        let (id, mut rx) = bus.subscribe();
        bus.unsubscribe(id);
        assert_eq!(bus.subscriber_count(), 0);

        bus.fire(ChangeEvent::cell("dev", "x"));
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn test_dropped_receiver_is_pruned() {
        let bus = ChangeBus::new();
        let (_, rx) = bus.subscribe();
        drop(rx);

        bus.fire(ChangeEvent::cell("dev", "x"));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_fire_without_subscribers() {
        let bus = ChangeBus::default();
        bus.fire(ChangeEvent::cell("dev", "x"));
        tokio_test::block_on(async {
            let (_, mut rx) = bus.subscribe();
            bus.fire(ChangeEvent::cell("dev", "y"));
            assert_eq!(rx.recv().await.unwrap().cell, "y");
        });
    }
}
