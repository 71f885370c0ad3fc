//! In-process change feed.
//!
//! The file manager publishes a [`Change`] for every mutation. Each subscriber owns a bounded
//! queue; a subscriber that lets its queue fill up is marked lagging and dropped from the broker,
//! which ends its stream once the queued changes are drained.
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use mifs_std::collections::ConcurrentHashMap;

use tokio::sync::mpsc::{self, error::TrySendError};

pub const DEFAULT_BUFFER_SIZE: usize = 10_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventType {
    /// The file appeared or changed for the user.
    Available,
    /// The file is gone for the user.
    NotAvailable,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Change {
    pub event_type: EventType,
    pub file_ref: String,
    pub user: String,
}

#[derive(Clone)]
struct Subscriber {
    tx: mpsc::Sender<Change>,
    lagging: Arc<AtomicBool>,
}

struct BrokerInner {
    buffer_size: usize,
    next_id: AtomicU64,
    subscribers: ConcurrentHashMap<u64, Subscriber>,
}

#[derive(Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

impl Default for Broker {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_SIZE)
    }
}

impl Broker {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                buffer_size: buffer_size.max(1),
                next_id: AtomicU64::new(0),
                subscribers: ConcurrentHashMap::new(),
            }),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.len()
    }

    pub fn subscribe(&self) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(self.inner.buffer_size);
        let lagging = Arc::new(AtomicBool::new(false));

        self.inner.subscribers.insert(
            id,
            Subscriber {
                tx,
                lagging: lagging.clone(),
            },
        );
        tracing::debug!(subscriber = id, "subscribed");

        Subscription {
            id,
            rx,
            lagging,
            broker: Arc::downgrade(&self.inner),
        }
    }

    /// Never blocks. Full subscribers are cut off instead of slowing down the publisher.
    pub fn publish(&self, change: Change) {
        for (id, sub) in self.inner.subscribers.get_all() {
            match sub.tx.try_send(change.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(subscriber = id, "subscriber is lagging, dropping it");
                    sub.lagging.store(true, Ordering::SeqCst);
                    self.inner.subscribers.remove(&id);
                }
                Err(TrySendError::Closed(_)) => {
                    self.inner.subscribers.remove(&id);
                }
            }
        }
    }
}

/// A subscriber's end of the feed. Unsubscribes when dropped.
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<Change>,
    lagging: Arc<AtomicBool>,
    broker: Weak<BrokerInner>,
}

impl Subscription {
    /// `None` once the broker has dropped this subscriber, or the broker itself is gone.
    pub async fn recv(&mut self) -> Option<Change> {
        self.rx.recv().await
    }

    pub fn is_lagging(&self) -> bool {
        self.lagging.load(Ordering::SeqCst)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(broker) = self.broker.upgrade() {
            broker.subscribers.remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change(file_ref: &str) -> Change {
        Change {
            event_type: EventType::Available,
            file_ref: file_ref.into(),
            user: "alice".into(),
        }
    }

    #[tokio::test]
    async fn fifo_per_subscriber() {
        let broker = Broker::new(16);
        let mut a = broker.subscribe();
        let mut b = broker.subscribe();

        broker.publish(change("f1"));
        broker.publish(change("f2"));

        for sub in [&mut a, &mut b] {
            assert_eq!(sub.recv().await.map(|c| c.file_ref), Some("f1".into()));
            assert_eq!(sub.recv().await.map(|c| c.file_ref), Some("f2".into()));
        }
    }

    #[tokio::test]
    async fn overflow_marks_lagging_and_ends_stream() {
        let broker = Broker::new(2);
        let mut slow = broker.subscribe();
        let mut fast = broker.subscribe();

        broker.publish(change("f1"));
        assert!(fast.recv().await.is_some());
        broker.publish(change("f2"));
        assert!(fast.recv().await.is_some());
        broker.publish(change("f3"));

        assert!(slow.is_lagging());
        assert!(!fast.is_lagging());
        assert_eq!(broker.subscriber_count(), 1);

        // Queued changes are still delivered before the end of the stream.
        assert!(slow.recv().await.is_some());
        assert!(slow.recv().await.is_some());
        assert!(slow.recv().await.is_none());
    }

    #[test]
    fn drop_unsubscribes() {
        let broker = Broker::default();
        let sub = broker.subscribe();
        assert_eq!(broker.subscriber_count(), 1);
        drop(sub);
        assert_eq!(broker.subscriber_count(), 0);
    }
}
