//! Bounded intake queue for push-style sources
//!
//! Decouples a subscription callback (producer, any thread) from the
//! tick-driven forwarder (consumer). The queue owns its synchronization;
//! callers share it through an `Arc` without extra locking.
//!
//! Under the default [`OverflowPolicy::Block`] a producer that finds the queue
//! full waits until the consumer drains. There is no timeout: if the consumer
//! stops draining, the producer stalls. [`IntakeQueue::close`] releases
//! blocked producers at shutdown.

use crate::error::IntakeError;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::warn;

/// Default capacity, in items
pub const DEFAULT_CAPACITY: usize = 10_000;

/// What `push` does when the queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Block the producer until space is available
    #[default]
    Block,
    /// Evict the oldest queued item
    DropOldest,
    /// Refuse the new item with `IntakeError::Full`
    Reject,
}

impl std::str::FromStr for OverflowPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "block" => Ok(OverflowPolicy::Block),
            "drop-oldest" | "drop_oldest" => Ok(OverflowPolicy::DropOldest),
            "reject" => Ok(OverflowPolicy::Reject),
            other => Err(format!(
                "{other} (expected 'block', 'drop-oldest' or 'reject')"
            )),
        }
    }
}

/// Counters for queue monitoring
#[derive(Default)]
pub struct IntakeMetrics {
    /// Items accepted into the queue
    pub pushed: AtomicU64,
    /// Items evicted under `DropOldest`
    pub dropped: AtomicU64,
    /// Items refused under `Reject` or after close
    pub rejected: AtomicU64,
    /// Items handed to the consumer
    pub drained: AtomicU64,
}

struct Inner<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Thread-safe bounded FIFO queue
pub struct IntakeQueue<T> {
    inner: Mutex<Inner<T>>,
    not_full: Condvar,
    capacity: usize,
    policy: OverflowPolicy,
    metrics: IntakeMetrics,
}

impl<T> IntakeQueue<T> {
    /// Create a queue with the given capacity and overflow policy
    ///
    /// A capacity of zero is raised to one.
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity.min(1024)),
                closed: false,
            }),
            not_full: Condvar::new(),
            capacity,
            policy,
            metrics: IntakeMetrics::default(),
        }
    }

    /// Add one item, applying the overflow policy when full
    ///
    /// Under `Block` this waits for space; call it from a thread that may block.
    pub fn push(&self, item: T) -> Result<(), IntakeError> {
        let mut inner = self.inner.lock();

        if inner.closed {
            self.metrics.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(IntakeError::Closed);
        }

        if inner.items.len() >= self.capacity {
            match self.policy {
                OverflowPolicy::Block => {
                    while inner.items.len() >= self.capacity && !inner.closed {
                        self.not_full.wait(&mut inner);
                    }
                    if inner.closed {
                        self.metrics.rejected.fetch_add(1, Ordering::Relaxed);
                        return Err(IntakeError::Closed);
                    }
                }
                OverflowPolicy::DropOldest => {
                    inner.items.pop_front();
                    self.metrics.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(capacity = self.capacity, "Intake queue full, oldest item dropped");
                    crate::metrics::try_record_intake_dropped("overflow", 1);
                }
                OverflowPolicy::Reject => {
                    self.metrics.rejected.fetch_add(1, Ordering::Relaxed);
                    crate::metrics::try_record_intake_dropped("rejected", 1);
                    return Err(IntakeError::Full {
                        capacity: self.capacity,
                    });
                }
            }
        }

        inner.items.push_back(item);
        self.metrics.pushed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Remove up to `max_count` items in FIFO order; never blocks on space
    pub fn drain(&self, max_count: usize) -> Vec<T> {
        let mut inner = self.inner.lock();
        let count = max_count.min(inner.items.len());
        let items: Vec<T> = inner.items.drain(..count).collect();
        drop(inner);

        if !items.is_empty() {
            self.metrics
                .drained
                .fetch_add(items.len() as u64, Ordering::Relaxed);
            self.not_full.notify_all();
        }

        items
    }

    /// Refuse further items and wake every blocked producer
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.not_full.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Current number of queued items
    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    pub fn metrics(&self) -> &IntakeMetrics {
        &self.metrics
    }

    /// Get current fill percentage (0.0 - 1.0)
    pub fn fill_ratio(&self) -> f64 {
        self.len() as f64 / self.capacity as f64
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_drain_is_fifo_and_resumes() {
        let queue = IntakeQueue::new(100, OverflowPolicy::Block);
        for i in 1..=10 {
            queue.push(i).unwrap();
        }

        assert_eq!(queue.drain(4), vec![1, 2, 3, 4]);
        assert_eq!(queue.drain(4), vec![5, 6, 7, 8]);
        assert_eq!(queue.drain(4), vec![9, 10]);
        assert!(queue.drain(4).is_empty());
    }

    #[test]
    fn test_drain_empty_does_not_block() {
        let queue: IntakeQueue<u32> = IntakeQueue::new(10, OverflowPolicy::Block);
        assert!(queue.drain(10).is_empty());
    }

    #[test]
    fn test_producer_thread_order_preserved() {
        let queue = Arc::new(IntakeQueue::new(1000, OverflowPolicy::Block));
        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                for i in 1..=500 {
                    queue.push(i).unwrap();
                }
            })
        };
        producer.join().unwrap();

        let first = queue.drain(200);
        assert_eq!(first, (1..=200).collect::<Vec<_>>());
        let rest = queue.drain(1000);
        assert_eq!(rest, (201..=500).collect::<Vec<_>>());
    }

    #[test]
    fn test_block_policy_waits_for_drain() {
        let queue = Arc::new(IntakeQueue::new(2, OverflowPolicy::Block));
        queue.push(1).unwrap();
        queue.push(2).unwrap();

        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.push(3))
        };

        // Producer stays blocked while full
        thread::sleep(Duration::from_millis(50));
        assert_eq!(queue.len(), 2);
        assert!(!producer.is_finished());

        assert_eq!(queue.drain(1), vec![1]);
        producer.join().unwrap().unwrap();
        assert_eq!(queue.drain(10), vec![2, 3]);
    }

    #[test]
    fn test_close_releases_blocked_producer() {
        let queue = Arc::new(IntakeQueue::new(1, OverflowPolicy::Block));
        queue.push(1).unwrap();

        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.push(2))
        };
        thread::sleep(Duration::from_millis(20));

        queue.close();
        assert_eq!(producer.join().unwrap(), Err(IntakeError::Closed));
        assert_eq!(queue.push(3), Err(IntakeError::Closed));
        // Already queued items can still be drained
        assert_eq!(queue.drain(10), vec![1]);
    }

    #[test]
    fn test_drop_oldest_policy() {
        let queue = IntakeQueue::new(3, OverflowPolicy::DropOldest);
        for i in 0..5 {
            queue.push(i).unwrap();
        }

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.metrics().dropped.load(Ordering::Relaxed), 2);
        assert_eq!(queue.drain(3), vec![2, 3, 4]);
    }

    #[test]
    fn test_reject_policy() {
        let queue = IntakeQueue::new(2, OverflowPolicy::Reject);
        queue.push("a").unwrap();
        queue.push("b").unwrap();

        assert_eq!(queue.push("c"), Err(IntakeError::Full { capacity: 2 }));
        assert_eq!(queue.metrics().rejected.load(Ordering::Relaxed), 1);
        assert_eq!(queue.drain(5), vec!["a", "b"]);
    }

    #[test]
    fn test_metrics_and_fill_ratio() {
        let queue = IntakeQueue::new(100, OverflowPolicy::Block);
        for i in 0..50 {
            queue.push(i).unwrap();
        }
        assert!((queue.fill_ratio() - 0.5).abs() < 0.01);

        queue.drain(20);
        assert_eq!(queue.metrics().pushed.load(Ordering::Relaxed), 50);
        assert_eq!(queue.metrics().drained.load(Ordering::Relaxed), 20);
    }

    #[test]
    fn test_policy_parsing() {
        assert_eq!("block".parse::<OverflowPolicy>(), Ok(OverflowPolicy::Block));
        assert_eq!(
            "Drop-Oldest".parse::<OverflowPolicy>(),
            Ok(OverflowPolicy::DropOldest)
        );
        assert_eq!("reject".parse::<OverflowPolicy>(), Ok(OverflowPolicy::Reject));
        assert!("spill".parse::<OverflowPolicy>().is_err());
    }
}
