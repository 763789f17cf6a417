// crates/scrycast-capture/src/queue.rs
//
// Bounded, drop-oldest, single-producer/single-consumer queue used between
// each capture thread and the encode thread. Generalizes the
// Arc<(Mutex<Option<T>>, Condvar)> "latest frame wins" slot that the media
// worker thread uses for scrub requests into a small ring buffer that keeps
// more than one pending item, with the same "caller decides backlog depth"
// Condvar-wait shape.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

struct Inner<T> {
    items: VecDeque<T>,
    shutdown: bool,
}

/// A bounded FIFO that never blocks on push: when full, the oldest item is
/// discarded to admit the new one and `drop_count` is incremented.
pub struct BoundedQueue<T> {
    capacity: usize,
    state: Mutex<Inner<T>>,
    not_empty: Condvar,
    drop_count: AtomicU64,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Arc<Self> {
        assert!(capacity > 0, "queue capacity must be non-zero");
        Arc::new(Self {
            capacity,
            state: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity),
                shutdown: false,
            }),
            not_empty: Condvar::new(),
            drop_count: AtomicU64::new(0),
        })
    }

    /// Pushes `item`. Never blocks, never fails. If the queue is already at
    /// capacity, the head (oldest item) is dropped first.
    pub fn push(&self, item: T) {
        let mut inner = self.state.lock().unwrap();
        if inner.items.len() >= self.capacity {
            inner.items.pop_front();
            self.drop_count.fetch_add(1, Ordering::Relaxed);
        }
        inner.items.push_back(item);
        self.not_empty.notify_one();
    }

    /// Waits up to `timeout` for an item. Returns `None` on timeout or after
    /// [`shutdown`](Self::shutdown) has been called and the queue has
    /// drained.
    pub fn pop(&self, timeout: Duration) -> Option<T> {
        let mut inner = self.state.lock().unwrap();
        loop {
            if let Some(item) = inner.items.pop_front() {
                return Some(item);
            }
            if inner.shutdown {
                return None;
            }
            let (guard, result) = self.not_empty.wait_timeout(inner, timeout).unwrap();
            inner = guard;
            if result.timed_out() && inner.items.is_empty() {
                return None;
            }
        }
    }

    /// Wakes every blocked `pop` so shutdown latency is bounded by one
    /// queue-pop timeout, not the full timeout.
    pub fn shutdown(&self) {
        let mut inner = self.state.lock().unwrap();
        inner.shutdown = true;
        self.not_empty.notify_all();
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn drop_count(&self) -> u64 {
        self.drop_count.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Capacity for the video frame queue (§4.4): 10 frames.
pub const VIDEO_QUEUE_CAPACITY: usize = 10;
/// Capacity for the audio packet queue (§4.4): 30 packets.
pub const AUDIO_QUEUE_CAPACITY: usize = 30;

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn push_never_blocks_and_drops_oldest_on_overflow() {
        let q = BoundedQueue::new(3);
        for i in 0..5 {
            q.push(i);
        }
        assert_eq!(q.len(), 3);
        assert_eq!(q.drop_count(), 2);
        // oldest two (0, 1) were dropped — head is now 2
        assert_eq!(q.pop(Duration::from_millis(10)), Some(2));
    }

    #[test]
    fn pop_times_out_when_empty() {
        let q: Arc<BoundedQueue<i32>> = BoundedQueue::new(4);
        let start = std::time::Instant::now();
        let result = q.pop(Duration::from_millis(20));
        assert!(result.is_none());
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn shutdown_wakes_blocked_pop() {
        let q: Arc<BoundedQueue<i32>> = BoundedQueue::new(4);
        let q2 = q.clone();
        let handle = thread::spawn(move || q2.pop(Duration::from_secs(5)));
        thread::sleep(Duration::from_millis(20));
        q.shutdown();
        assert_eq!(handle.join().unwrap(), None);
    }

    #[test]
    fn fifo_order_preserved_below_capacity() {
        let q = BoundedQueue::new(10);
        q.push(1);
        q.push(2);
        q.push(3);
        assert_eq!(q.pop(Duration::from_millis(10)), Some(1));
        assert_eq!(q.pop(Duration::from_millis(10)), Some(2));
        assert_eq!(q.pop(Duration::from_millis(10)), Some(3));
    }
}
