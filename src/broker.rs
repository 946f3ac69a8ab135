//! In-memory fan-out hub between producers and sinks.
//!
//! [`MemoryBroker`] keeps one bounded queue per registered subscriber.
//! [`Publisher::publish`] never waits on a queue: when a subscriber's
//! queue is full the batch is dropped for that subscriber only and the
//! loss shows up in [`BrokerStats::dropped`].

use crate::error::BrokerError;
use crate::record::LogRecord;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

/// Ordered records published together; shared read-only by every subscriber.
pub type Batch = Arc<[LogRecord]>;

/// Queue capacity (in batches) of each subscription.
pub const DEFAULT_QUEUE_CAPACITY: usize = 2000;

/// Producer side of the broker.
pub trait Publisher: Send + Sync {
    /// Fan `batch` out to every registered subscription without blocking.
    fn publish(&self, cancel: &CancellationToken, batch: Vec<LogRecord>) -> Result<(), BrokerError>;
}

/// Consumer side of the broker.
pub trait Subscriber: Send + Sync {
    /// Register a new bounded queue and return its receiving end.
    fn subscribe(&self, cancel: &CancellationToken) -> Result<Subscription, BrokerError>;
}

/// Snapshot of the broker counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BrokerStats {
    /// Records accepted by `publish`, counted once per call.
    pub ingested: u64,
    /// Records dropped, counted once per subscriber that missed them.
    pub dropped: u64,
    /// Currently registered subscriptions.
    pub subscribers: usize,
}

/// Receiving end of a broker registration.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<Batch>,
}

impl Subscription {
    /// Identifier accepted by [`MemoryBroker::deregister`].
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the next batch. `None` once the broker is gone or this
    /// subscription was deregistered and drained.
    pub async fn recv(&mut self) -> Option<Batch> {
        self.rx.recv().await
    }

    /// Take a batch if one is already queued.
    pub fn try_recv(&mut self) -> Option<Batch> {
        self.rx.try_recv().ok()
    }
}

struct Slot {
    id: u64,
    tx: mpsc::Sender<Batch>,
}

/// Fan-out broker backed by bounded Tokio channels.
///
/// The subscriber set sits behind a reader-writer lock: `publish` takes
/// the read side, registration the write side. Counters are atomics and
/// never touch the lock; the subscriber count is updated under the write
/// lock but read without it.
pub struct MemoryBroker {
    subscribers: RwLock<Vec<Slot>>,
    subscriber_count: AtomicUsize,
    capacity: usize,
    next_id: AtomicU64,
    ingested: AtomicU64,
    dropped: AtomicU64,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    /// Broker whose subscriptions each hold at most `capacity` batches.
    pub fn with_capacity(capacity: usize) -> Self {
        MemoryBroker {
            subscribers: RwLock::new(Vec::new()),
            subscriber_count: AtomicUsize::new(0),
            capacity: capacity.max(1),
            next_id: AtomicU64::new(0),
            ingested: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Register a new subscription. Batches published earlier are never
    /// replayed into it.
    pub fn register(&self, cancel: &CancellationToken) -> Result<Subscription, BrokerError> {
        if cancel.is_cancelled() {
            return Err(BrokerError::Cancelled);
        }

        let (tx, rx) = mpsc::channel(self.capacity);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let mut subscribers = self.subscribers.write().unwrap_or_else(PoisonError::into_inner);
        subscribers.push(Slot { id, tx });
        self.subscriber_count.store(subscribers.len(), Ordering::Relaxed);
        tracing::debug!(subscription = id, total = subscribers.len(), "subscription registered");

        Ok(Subscription { id, rx })
    }

    /// Release a subscription's queue. Registrations are otherwise kept
    /// for the lifetime of the broker, even when their receiver is gone.
    pub fn deregister(&self, id: u64) -> bool {
        let mut subscribers = self.subscribers.write().unwrap_or_else(PoisonError::into_inner);
        let before = subscribers.len();
        subscribers.retain(|slot| slot.id != id);
        self.subscriber_count.store(subscribers.len(), Ordering::Relaxed);
        before != subscribers.len()
    }

    /// Counter snapshot. Reads atomics only, so it never waits on
    /// `publish` or registration.
    pub fn stats(&self) -> BrokerStats {
        BrokerStats {
            ingested: self.ingested.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            subscribers: self.subscriber_count.load(Ordering::Relaxed),
        }
    }

    /// Publish an already shared batch.
    pub fn publish_shared(&self, cancel: &CancellationToken, batch: Batch) -> Result<(), BrokerError> {
        self.fan_out(cancel, batch, |_| {})
    }

    /// Offer `batch` to each slot in registration order, calling `delivered`
    /// after each offer. Cancellation is checked before every slot; records
    /// already counted as ingested stay counted.
    fn fan_out(
        &self,
        cancel: &CancellationToken,
        batch: Batch,
        mut delivered: impl FnMut(u64),
    ) -> Result<(), BrokerError> {
        if cancel.is_cancelled() {
            return Err(BrokerError::Cancelled);
        }

        let len = batch.len() as u64;
        self.ingested.fetch_add(len, Ordering::Relaxed);

        let subscribers = self.subscribers.read().unwrap_or_else(PoisonError::into_inner);
        for slot in subscribers.iter() {
            if cancel.is_cancelled() {
                return Err(BrokerError::Cancelled);
            }
            match slot.tx.try_send(Arc::clone(&batch)) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => {
                    self.dropped.fetch_add(len, Ordering::Relaxed);
                }
            }
            delivered(slot.id);
        }
        Ok(())
    }
}

impl Publisher for MemoryBroker {
    fn publish(&self, cancel: &CancellationToken, batch: Vec<LogRecord>) -> Result<(), BrokerError> {
        self.publish_shared(cancel, Batch::from(batch))
    }
}

impl Subscriber for MemoryBroker {
    fn subscribe(&self, cancel: &CancellationToken) -> Result<Subscription, BrokerError> {
        self.register(cancel)
    }
}

impl<T: Publisher + ?Sized> Publisher for Arc<T> {
    fn publish(&self, cancel: &CancellationToken, batch: Vec<LogRecord>) -> Result<(), BrokerError> {
        (**self).publish(cancel, batch)
    }
}

impl<T: Subscriber + ?Sized> Subscriber for Arc<T> {
    fn subscribe(&self, cancel: &CancellationToken) -> Result<Subscription, BrokerError> {
        (**self).subscribe(cancel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::time::Duration;

    fn batch(n: usize) -> Vec<LogRecord> {
        (0..n)
            .map(|i| LogRecord::new(format!("test log {i}"), Utc::now()).with_sequence(i as u64))
            .collect()
    }

    #[tokio::test]
    async fn subscriber_receives_published_batch() {
        let broker = MemoryBroker::new();
        let cancel = CancellationToken::new();
        let mut sub = broker.subscribe(&cancel).unwrap();

        broker.publish(&cancel, batch(2)).unwrap();

        let received = tokio::time::timeout(Duration::from_secs(2), sub.recv())
            .await
            .expect("timed out waiting for batch")
            .expect("broker closed");
        assert_eq!(received.len(), 2);
        assert_eq!(received[0].message, "test log 0");
    }

    #[test]
    fn ingested_counts_once_per_call_regardless_of_subscribers() {
        let cancel = CancellationToken::new();
        for subscribers in [0usize, 1, 3] {
            let broker = MemoryBroker::new();
            let _subs: Vec<_> = (0..subscribers).map(|_| broker.register(&cancel).unwrap()).collect();

            broker.publish(&cancel, batch(4)).unwrap();

            let stats = broker.stats();
            assert_eq!(stats.ingested, 4, "subscribers={subscribers}");
            assert_eq!(stats.dropped, 0);
            assert_eq!(stats.subscribers, subscribers);
        }
    }

    #[test]
    fn full_queue_drops_for_that_subscriber_only() {
        let broker = MemoryBroker::with_capacity(1);
        let cancel = CancellationToken::new();
        let mut slow = broker.register(&cancel).unwrap();
        let mut fast = broker.register(&cancel).unwrap();

        broker.publish(&cancel, batch(3)).unwrap();
        assert!(fast.try_recv().is_some());

        // `slow` still holds the first batch, so this one is dropped for it.
        broker.publish(&cancel, batch(3)).unwrap();

        let stats = broker.stats();
        assert_eq!(stats.ingested, 6);
        assert_eq!(stats.dropped, 3);
        assert!(fast.try_recv().is_some());
        assert_eq!(slow.try_recv().map(|b| b.len()), Some(3));
        assert!(slow.try_recv().is_none());
    }

    #[test]
    fn late_subscriber_sees_no_backfill() {
        let broker = MemoryBroker::new();
        let cancel = CancellationToken::new();
        broker.publish(&cancel, batch(2)).unwrap();

        let mut late = broker.register(&cancel).unwrap();
        assert!(late.try_recv().is_none());

        broker.publish(&cancel, batch(1)).unwrap();
        assert_eq!(late.try_recv().map(|b| b.len()), Some(1));
    }

    #[test]
    fn cancelled_publish_fails_without_counting() {
        let broker = MemoryBroker::new();
        let cancel = CancellationToken::new();
        let mut sub = broker.register(&cancel).unwrap();
        cancel.cancel();

        assert_eq!(broker.publish(&cancel, batch(1)), Err(BrokerError::Cancelled));
        assert_eq!(broker.stats().ingested, 0);
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn cancellation_between_subscribers_keeps_ingested_count() {
        let broker = MemoryBroker::new();
        let cancel = CancellationToken::new();
        let mut first = broker.register(&cancel).unwrap();
        let mut second = broker.register(&cancel).unwrap();

        let result = broker.fan_out(&cancel, Batch::from(batch(3)), |_| cancel.cancel());

        assert_eq!(result, Err(BrokerError::Cancelled));
        assert_eq!(first.try_recv().map(|b| b.len()), Some(3));
        assert!(second.try_recv().is_none());
        let stats = broker.stats();
        assert_eq!(stats.ingested, 3);
        assert_eq!(stats.dropped, 0);
    }

    #[test]
    fn stats_does_not_wait_for_the_subscriber_lock() {
        let broker = Arc::new(MemoryBroker::new());
        let cancel = CancellationToken::new();
        let _sub = broker.register(&cancel).unwrap();
        broker.publish(&cancel, batch(2)).unwrap();

        let guard = broker.subscribers.write().unwrap();
        let (tx, rx) = std::sync::mpsc::channel();
        let reader = Arc::clone(&broker);
        let handle = std::thread::spawn(move || {
            tx.send(reader.stats()).unwrap();
        });

        let stats = rx
            .recv_timeout(Duration::from_millis(500))
            .expect("stats() blocked on the write lock");
        drop(guard);
        handle.join().unwrap();
        assert_eq!(stats.ingested, 2);
        assert_eq!(stats.subscribers, 1);
    }

    #[test]
    fn cancelled_register_fails() {
        let broker = MemoryBroker::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(broker.register(&cancel), Err(BrokerError::Cancelled)));
        assert_eq!(broker.stats().subscribers, 0);
    }

    #[test]
    fn dropped_receiver_keeps_counting_until_deregistered() {
        let broker = MemoryBroker::new();
        let cancel = CancellationToken::new();
        let gone = broker.register(&cancel).unwrap();
        let id = gone.id();
        drop(gone);

        broker.publish(&cancel, batch(2)).unwrap();
        assert_eq!(broker.stats().dropped, 2);

        assert!(broker.deregister(id));
        assert!(!broker.deregister(id));
        broker.publish(&cancel, batch(2)).unwrap();
        let stats = broker.stats();
        assert_eq!(stats.dropped, 2);
        assert_eq!(stats.ingested, 4);
        assert_eq!(stats.subscribers, 0);
    }

    #[tokio::test]
    async fn concurrent_publishers_are_all_counted() {
        let broker = Arc::new(MemoryBroker::new());
        let cancel = CancellationToken::new();
        let mut sub = broker.register(&cancel).unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let broker = Arc::clone(&broker);
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..10 {
                    broker.publish(&cancel, batch(2)).unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(broker.stats().ingested, 160);
        let mut received = 0;
        while let Some(batch) = sub.try_recv() {
            received += batch.len();
        }
        assert_eq!(received, 160);
    }
}
