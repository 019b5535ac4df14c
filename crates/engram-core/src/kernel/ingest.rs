//! Ingest Queue
//!
//! Bounded in-process queue between event producers and the episodic layer.
//! Overflow drops the oldest entries (after counting them) rather than
//! blocking producers; the background worker drains in batches.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::sync::Notify;

use crate::model::EventInput;

// ============================================================================
// QUEUE
// ============================================================================

/// A queued event with its project partition
#[derive(Debug, Clone)]
pub struct QueuedEvent {
    /// Target project
    pub project_id: i64,
    /// The event
    pub input: EventInput,
}

/// Bounded drop-oldest ingest queue
pub struct IngestQueue {
    inner: Mutex<VecDeque<QueuedEvent>>,
    capacity: usize,
    notify: Notify,
    dropped: AtomicU64,
}

impl IngestQueue {
    /// Queue holding at most `capacity` events
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue an event; returns true when an older event was dropped
    pub fn enqueue(&self, project_id: i64, input: EventInput) -> bool {
        let overflowed = {
            let Ok(mut queue) = self.inner.lock() else {
                return false;
            };
            let overflowed = if queue.len() >= self.capacity {
                queue.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
                true
            } else {
                false
            };
            queue.push_back(QueuedEvent { project_id, input });
            overflowed
        };
        self.notify.notify_one();
        overflowed
    }

    /// Take up to `max` events, suspending until at least one is available
    pub async fn drain(&self, max: usize) -> Vec<QueuedEvent> {
        loop {
            {
                let Ok(mut queue) = self.inner.lock() else {
                    return Vec::new();
                };
                if !queue.is_empty() {
                    let take = max.min(queue.len());
                    return queue.drain(..take).collect();
                }
            }
            self.notify.notified().await;
        }
    }

    /// Suspend until the queue holds at least one event
    pub async fn wait_nonempty(&self) {
        loop {
            if !self.is_empty() {
                return;
            }
            self.notify.notified().await;
        }
    }

    /// Take up to `max` events without waiting
    pub fn drain_now(&self, max: usize) -> Vec<QueuedEvent> {
        let Ok(mut queue) = self.inner.lock() else {
            return Vec::new();
        };
        let take = max.min(queue.len());
        queue.drain(..take).collect()
    }

    /// Events currently queued
    pub fn len(&self) -> usize {
        self.inner.lock().map(|q| q.len()).unwrap_or(0)
    }

    /// True when empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total events dropped by overflow
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn input(content: &str) -> EventInput {
        EventInput {
            content: content.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let queue = IngestQueue::new(3);
        assert!(!queue.enqueue(1, input("a")));
        assert!(!queue.enqueue(1, input("b")));
        assert!(!queue.enqueue(1, input("c")));
        assert!(queue.enqueue(1, input("d")));

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.dropped(), 1);
        let drained = queue.drain_now(10);
        assert_eq!(drained[0].input.content, "b");
        assert_eq!(drained[2].input.content, "d");
    }

    #[tokio::test]
    async fn test_drain_waits_for_work() {
        let queue = std::sync::Arc::new(IngestQueue::new(10));
        let producer = std::sync::Arc::clone(&queue);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            producer.enqueue(7, input("late"));
        });
        let drained = queue.drain(10).await;
        handle.await.unwrap();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].project_id, 7);
    }

    #[test]
    fn test_drain_now_respects_max() {
        let queue = IngestQueue::new(10);
        for i in 0..5 {
            queue.enqueue(1, input(&format!("e{i}")));
        }
        assert_eq!(queue.drain_now(2).len(), 2);
        assert_eq!(queue.len(), 3);
    }
}
