//! Bounded inbound queue feeding one worker's consumer task.
//!
//! Many producers, exactly one consumer. The overflow policy decides what
//! happens when the queue is at capacity; no policy blocks a producer for
//! longer than the configured timeout.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Notify;

use crate::model::Record;

/// What to do with a record that arrives while the queue is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Drop the incoming record.
    #[default]
    DropNewest,
    /// Evict the oldest queued record to make room.
    DropOldest,
    /// Wait for room up to the block timeout, then drop the incoming record.
    Block,
}

impl OverflowPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DropNewest => "drop_newest",
            Self::DropOldest => "drop_oldest",
            Self::Block => "block",
        }
    }
}

/// Successful outcome of [`InboundQueue::push`].
#[derive(Debug, PartialEq, Eq)]
pub enum Pushed {
    Enqueued,
    /// Enqueued after evicting the oldest record, which is returned.
    Displaced(Record),
}

/// Why a record was not enqueued.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue full ({capacity} records)")]
    Full { capacity: usize },

    #[error("queue still full after waiting {waited:?}")]
    Timeout { waited: Duration },

    #[error("queue closed")]
    Closed,
}

impl QueueError {
    /// Short label for metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Full { .. } => "queue_full",
            Self::Timeout { .. } => "block_timeout",
            Self::Closed => "closed",
        }
    }
}

pub struct InboundQueue {
    items: Mutex<VecDeque<Record>>,
    capacity: usize,
    policy: OverflowPolicy,
    block_timeout: Duration,
    readable: Notify,
    writable: Notify,
    closed: AtomicBool,
}

impl InboundQueue {
    pub fn new(capacity: usize, policy: OverflowPolicy, block_timeout: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
            capacity,
            policy,
            block_timeout,
            readable: Notify::new(),
            writable: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Enqueues a record according to the overflow policy.
    pub async fn push(&self, record: Record) -> Result<Pushed, QueueError> {
        let record = match self.try_push(record) {
            Ok(pushed) => return Ok(pushed),
            Err((record, QueueError::Full { .. })) if self.policy == OverflowPolicy::Block => {
                record
            }
            Err((_, e)) => return Err(e),
        };

        let deadline = tokio::time::Instant::now() + self.block_timeout;
        let mut pending = record;
        loop {
            let notified = self.writable.notified();
            match self.try_push(pending) {
                Ok(pushed) => return Ok(pushed),
                Err((_, QueueError::Closed)) => return Err(QueueError::Closed),
                Err((record, _)) => pending = record,
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(QueueError::Timeout {
                    waited: self.block_timeout,
                });
            }
        }
    }

    /// Non-blocking push. `Block` behaves like `DropNewest` here.
    fn try_push(&self, record: Record) -> Result<Pushed, (Record, QueueError)> {
        if self.closed.load(Ordering::Acquire) {
            return Err((record, QueueError::Closed));
        }

        let mut items = self.items.lock();
        let outcome = if items.len() < self.capacity {
            items.push_back(record);
            Pushed::Enqueued
        } else if self.policy == OverflowPolicy::DropOldest {
            let evicted = items.pop_front();
            items.push_back(record);
            match evicted {
                Some(old) => Pushed::Displaced(old),
                None => Pushed::Enqueued,
            }
        } else {
            return Err((
                record,
                QueueError::Full {
                    capacity: self.capacity,
                },
            ));
        };
        drop(items);

        self.readable.notify_one();
        Ok(outcome)
    }

    /// Waits for the next record. Returns `None` once closed and empty.
    pub async fn pop(&self) -> Option<Record> {
        loop {
            if let Some(record) = self.try_pop() {
                return Some(record);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            self.readable.notified().await;
        }
    }

    pub fn try_pop(&self) -> Option<Record> {
        let record = self.items.lock().pop_front();
        if record.is_some() {
            self.writable.notify_one();
        }
        record
    }

    /// Rejects further pushes and wakes the consumer so it can drain.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.readable.notify_one();
        self.writable.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::model::Value;

    fn rec(id: &str) -> Record {
        Record::new(id, vec![Value::Int64(1)])
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = InboundQueue::new(8, OverflowPolicy::DropNewest, Duration::ZERO);
        for id in ["a", "b", "c"] {
            assert_eq!(queue.push(rec(id)).await, Ok(Pushed::Enqueued));
        }

        assert_eq!(queue.len(), 3);
        for id in ["a", "b", "c"] {
            assert_eq!(queue.pop().await.map(|r| r.id().to_string()), Some(id.to_string()));
        }
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_drop_newest_rejects_when_full() {
        let queue = InboundQueue::new(2, OverflowPolicy::DropNewest, Duration::ZERO);
        queue.push(rec("a")).await.expect("push a");
        queue.push(rec("b")).await.expect("push b");

        assert_eq!(
            queue.push(rec("c")).await,
            Err(QueueError::Full { capacity: 2 })
        );
        assert_eq!(queue.try_pop().map(|r| r.id().to_string()), Some("a".into()));
        assert_eq!(queue.try_pop().map(|r| r.id().to_string()), Some("b".into()));
        assert!(queue.try_pop().is_none());
    }

    #[tokio::test]
    async fn test_drop_oldest_evicts_head() {
        let queue = InboundQueue::new(2, OverflowPolicy::DropOldest, Duration::ZERO);
        queue.push(rec("a")).await.expect("push a");
        queue.push(rec("b")).await.expect("push b");

        assert_eq!(queue.push(rec("c")).await, Ok(Pushed::Displaced(rec("a"))));
        assert_eq!(queue.try_pop().map(|r| r.id().to_string()), Some("b".into()));
        assert_eq!(queue.try_pop().map(|r| r.id().to_string()), Some("c".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_block_times_out() {
        let queue = InboundQueue::new(1, OverflowPolicy::Block, Duration::from_millis(50));
        queue.push(rec("a")).await.expect("push a");

        assert_eq!(
            queue.push(rec("b")).await,
            Err(QueueError::Timeout {
                waited: Duration::from_millis(50)
            })
        );
    }

    #[tokio::test]
    async fn test_block_succeeds_when_consumer_frees_space() {
        let queue = Arc::new(InboundQueue::new(
            1,
            OverflowPolicy::Block,
            Duration::from_secs(5),
        ));
        queue.push(rec("a")).await.expect("push a");

        let producer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.push(rec("b")).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(queue.pop().await.map(|r| r.id().to_string()), Some("a".into()));

        let pushed = producer.await.expect("join");
        assert_eq!(pushed, Ok(Pushed::Enqueued));
        assert_eq!(queue.pop().await.map(|r| r.id().to_string()), Some("b".into()));
    }

    #[tokio::test]
    async fn test_close_drains_then_ends() {
        let queue = InboundQueue::new(4, OverflowPolicy::DropNewest, Duration::ZERO);
        queue.push(rec("a")).await.expect("push");
        queue.close();

        assert_eq!(queue.push(rec("b")).await, Err(QueueError::Closed));
        assert!(queue.pop().await.is_some());
        assert!(queue.pop().await.is_none());
    }

    #[tokio::test]
    async fn test_pop_wakes_on_push() {
        let queue = Arc::new(InboundQueue::new(
            4,
            OverflowPolicy::DropNewest,
            Duration::ZERO,
        ));

        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.push(rec("late")).await.expect("push");

        let popped = consumer.await.expect("join");
        assert_eq!(popped.map(|r| r.id().to_string()), Some("late".into()));
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let queue = InboundQueue::new(0, OverflowPolicy::DropNewest, Duration::ZERO);
        assert_eq!(queue.capacity(), 1);
    }
}
