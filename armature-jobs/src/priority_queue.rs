//! Shared blocking priority queue.
//!
//! The queue is a binary min-heap: the item with the **smallest** numeric
//! priority is extracted first, so `1` is more urgent than `10`. Every driver
//! inserts into the same queue and pollers extract from it.
//!
//! ```
//! use armature_jobs::priority_queue::{Prioritized, PriorityQueue};
//!
//! struct Task(i64);
//! impl Prioritized for Task {
//!     fn priority(&self) -> i64 {
//!         self.0
//!     }
//! }
//!
//! let pq = PriorityQueue::new();
//! pq.insert(Task(10));
//! pq.insert(Task(1));
//! assert_eq!(pq.extract_min().0, 1);
//! ```

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

use crate::item::{BoxedItem, Item};

/// Anything ordered by a numeric priority.
pub trait Prioritized {
    fn priority(&self) -> i64;
}

impl Prioritized for BoxedItem {
    fn priority(&self) -> i64 {
        Item::priority(&**self)
    }
}

/// Queue of in-flight job items shared by drivers and pollers.
pub type JobQueue = PriorityQueue<BoxedItem>;

/// Unbounded, thread-safe min-heap with blocking extraction.
pub struct PriorityQueue<T> {
    heap: Mutex<Vec<T>>,
    available: Condvar,
    notify: Notify,
}

impl<T: Prioritized> Default for PriorityQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Prioritized> PriorityQueue<T> {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self {
            heap: Mutex::new(Vec::new()),
            available: Condvar::new(),
            notify: Notify::new(),
        }
    }

    /// Insert an item and wake one waiting extractor.
    pub fn insert(&self, item: T) {
        {
            let mut heap = self.heap.lock();
            heap.push(item);
            let last = heap.len() - 1;
            sift_up(&mut heap, last);
        }
        self.available.notify_one();
        self.notify.notify_one();
    }

    /// Remove and return the minimum-priority item, blocking the thread while empty.
    pub fn extract_min(&self) -> T {
        let mut heap = self.heap.lock();
        loop {
            if let Some(item) = pop_min(&mut heap) {
                return item;
            }
            self.available.wait(&mut heap);
        }
    }

    /// Like [`extract_min`](Self::extract_min) but gives up after `timeout`.
    pub fn extract_min_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut heap = self.heap.lock();
        loop {
            if let Some(item) = pop_min(&mut heap) {
                return Some(item);
            }
            if self.available.wait_until(&mut heap, deadline).timed_out() {
                return pop_min(&mut heap);
            }
        }
    }

    /// Remove the minimum-priority item without waiting.
    pub fn try_extract_min(&self) -> Option<T> {
        pop_min(&mut self.heap.lock())
    }

    /// Async extraction: parks the task instead of the thread.
    pub async fn extract_min_async(&self) -> T {
        loop {
            let notified = self.notify.notified();
            if let Some(item) = self.try_extract_min() {
                return item;
            }
            notified.await;
        }
    }

    /// Number of resident items.
    pub fn len(&self) -> usize {
        self.heap.lock().len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.heap.lock().is_empty()
    }
}

fn pop_min<T: Prioritized>(heap: &mut Vec<T>) -> Option<T> {
    let n = heap.len();
    if n == 0 {
        return None;
    }
    heap.swap(0, n - 1);
    let min = heap.pop();
    sift_down(heap, 0);
    min
}

fn sift_up<T: Prioritized>(heap: &mut [T], mut i: usize) {
    while i > 0 {
        let parent = (i - 1) / 2;
        if heap[i].priority() >= heap[parent].priority() {
            break;
        }
        heap.swap(i, parent);
        i = parent;
    }
}

fn sift_down<T: Prioritized>(heap: &mut [T], mut i: usize) {
    let n = heap.len();
    loop {
        let left = 2 * i + 1;
        if left >= n {
            break;
        }
        let right = left + 1;
        let mut smallest = left;
        if right < n && heap[right].priority() < heap[left].priority() {
            smallest = right;
        }
        if heap[i].priority() <= heap[smallest].priority() {
            break;
        }
        heap.swap(i, smallest);
        i = smallest;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    #[derive(Debug)]
    struct Test(i64);

    impl Prioritized for Test {
        fn priority(&self) -> i64 {
            self.0
        }
    }

    #[test]
    fn test_extracts_in_ascending_order() {
        let pq = PriorityQueue::new();
        for p in [2, 23, 33, 44, 1, 2, 2, 2, 4, 6, 99] {
            pq.insert(Test(p));
        }

        let out: Vec<i64> = (0..11).map(|_| pq.extract_min().0).collect();
        assert_eq!(out, vec![1, 2, 2, 2, 2, 4, 6, 23, 33, 44, 99]);
        assert!(pq.is_empty());
    }

    #[test]
    fn test_interleaved_insert_extract() {
        let pq = PriorityQueue::new();
        pq.insert(Test(5));
        pq.insert(Test(3));
        assert_eq!(pq.extract_min().0, 3);
        pq.insert(Test(1));
        pq.insert(Test(4));
        assert_eq!(pq.extract_min().0, 1);
        assert_eq!(pq.extract_min().0, 4);
        assert_eq!(pq.extract_min().0, 5);
        assert_eq!(pq.len(), 0);
    }

    #[test]
    fn test_extract_blocks_until_insert() {
        let pq = Arc::new(PriorityQueue::<Test>::new());
        let inserted = Arc::new(AtomicBool::new(false));

        let consumer = {
            let pq = pq.clone();
            let inserted = inserted.clone();
            thread::spawn(move || {
                let item = pq.extract_min();
                assert!(inserted.load(Ordering::SeqCst));
                item.0
            })
        };

        thread::sleep(Duration::from_millis(100));
        assert!(!consumer.is_finished());

        inserted.store(true, Ordering::SeqCst);
        pq.insert(Test(42));

        assert_eq!(consumer.join().unwrap(), 42);
    }

    #[test]
    fn test_concurrent_producers() {
        let pq = Arc::new(PriorityQueue::new());
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let pq = pq.clone();
                thread::spawn(move || {
                    for i in 0..250 {
                        pq.insert(Test(i * 4 + t));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let mut last = i64::MIN;
        for _ in 0..1000 {
            let p = pq.extract_min().0;
            assert!(p >= last);
            last = p;
        }
    }

    #[test]
    fn test_extract_timeout_on_empty() {
        let pq: PriorityQueue<Test> = PriorityQueue::new();
        assert!(pq.extract_min_timeout(Duration::from_millis(20)).is_none());
        pq.insert(Test(1));
        assert_eq!(pq.extract_min_timeout(Duration::from_millis(20)).unwrap().0, 1);
    }

    #[tokio::test]
    async fn test_async_extract_wakes_on_insert() {
        let pq = Arc::new(PriorityQueue::<Test>::new());
        let waiter = {
            let pq = pq.clone();
            tokio::spawn(async move { pq.extract_min_async().await.0 })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        pq.insert(Test(7));
        assert_eq!(waiter.await.unwrap(), 7);
    }

    #[test]
    fn test_async_extract_ready_item() {
        let pq = PriorityQueue::new();
        pq.insert(Test(9));
        pq.insert(Test(3));

        let first = tokio_test::block_on(pq.extract_min_async());
        assert_eq!(first.0, 3);
        assert_eq!(pq.len(), 1);
    }
}
