//! Bounded producer/consumer queue between ingestion and the pipeline.

use crate::event::LogEvent;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;

/// Outcome of a [`EventQueue::push`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushResult {
    /// False when the queue was full and the event was rejected.
    pub success: bool,
    /// Timestamp of the oldest event still queued; meaningful on failure.
    pub oldest_timestamp_ns: i64,
    /// Queue size after the operation.
    pub size: usize,
}

/// A thread-safe FIFO with a hard capacity.
///
/// `push` never blocks: at capacity it reports failure together with the
/// oldest queued timestamp so the caller can account for the loss.
/// `wait_pop` blocks until an event is available.
pub struct EventQueue {
    limit: usize,
    inner: Mutex<VecDeque<Box<LogEvent>>>,
    not_empty: Condvar,
}

impl EventQueue {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            inner: Mutex::new(VecDeque::with_capacity(limit.min(4096))),
            not_empty: Condvar::new(),
        }
    }

    /// Appends an event unless the queue is at capacity.
    pub fn push(&self, event: Box<LogEvent>) -> PushResult {
        let result = {
            let mut queue = self.inner.lock();
            if queue.len() < self.limit {
                queue.push_back(event);
                PushResult {
                    success: true,
                    oldest_timestamp_ns: 0,
                    size: queue.len(),
                }
            } else {
                // Queue must be non-empty here, the limit is at least 1.
                let oldest = queue.front().map(|e| e.elapsed_timestamp_ns()).unwrap_or(0);
                PushResult {
                    success: false,
                    oldest_timestamp_ns: oldest,
                    size: queue.len(),
                }
            }
        };
        self.not_empty.notify_one();
        result
    }

    /// Blocks until an event is available, then returns the oldest.
    pub fn wait_pop(&self) -> Box<LogEvent> {
        let mut queue = self.inner.lock();
        while queue.is_empty() {
            self.not_empty.wait(&mut queue);
        }
        queue.pop_front().expect("queue is non-empty")
    }

    /// Non-blocking pop, used when draining.
    pub fn try_pop(&self) -> Option<Box<LogEvent>> {
        self.inner.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn event(ts: i64) -> Box<LogEvent> {
        Box::new(LogEvent::new(1, ts))
    }

    #[test]
    fn test_fifo_order() {
        let queue = EventQueue::new(4);
        for ts in 1..=3 {
            assert!(queue.push(event(ts)).success);
        }
        for ts in 1..=3 {
            assert_eq!(queue.wait_pop().elapsed_timestamp_ns(), ts);
        }
    }

    #[test]
    fn test_overflow_reports_oldest_and_size() {
        let queue = EventQueue::new(2);
        assert!(queue.push(event(100)).success);
        assert!(queue.push(event(200)).success);

        // Capacity N: every push after the Nth fails and reports the
        // current oldest timestamp; exactly N items remain.
        for _ in 0..3 {
            let result = queue.push(event(300));
            assert!(!result.success);
            assert_eq!(result.oldest_timestamp_ns, 100);
            assert_eq!(result.size, 2);
        }
        assert_eq!(queue.len(), 2);

        // After consuming one, the next push succeeds and the oldest moves.
        assert_eq!(queue.wait_pop().elapsed_timestamp_ns(), 100);
        assert!(queue.push(event(300)).success);
        let result = queue.push(event(400));
        assert!(!result.success);
        assert_eq!(result.oldest_timestamp_ns, 200);
    }

    #[test]
    fn test_blocking_pop_wakes_on_push() {
        let queue = Arc::new(EventQueue::new(8));
        let consumer_queue = Arc::clone(&queue);
        let consumer = thread::spawn(move || consumer_queue.wait_pop().elapsed_timestamp_ns());

        // Give the consumer a moment to block, then feed it.
        thread::sleep(std::time::Duration::from_millis(10));
        queue.push(event(42));
        assert_eq!(consumer.join().unwrap(), 42);
    }

    #[test]
    fn test_single_producer_single_consumer() {
        let queue = Arc::new(EventQueue::new(1024));
        let producer_queue = Arc::clone(&queue);
        let producer = thread::spawn(move || {
            for ts in 0..500 {
                while !producer_queue.push(event(ts)).success {
                    thread::yield_now();
                }
            }
        });

        let mut seen = Vec::with_capacity(500);
        for _ in 0..500 {
            seen.push(queue.wait_pop().elapsed_timestamp_ns());
        }
        producer.join().unwrap();

        let expected: Vec<i64> = (0..500).collect();
        assert_eq!(seen, expected);
    }
}
