use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;

/// Thread-safe FIFO with blocking push/pop.
///
/// `push` blocks while the queue holds `capacity` items, `pop` blocks while
/// it is empty. Intended for one producer and one consumer.
pub struct BoundedQueue<T> {
    capacity: usize,
    queue: Mutex<VecDeque<T>>,
    not_full: Condvar,
    not_empty: Condvar,
}

impl<T> BoundedQueue<T> {
    pub fn new() -> Self {
        Self::with_capacity(usize::MAX)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be positive");
        Self {
            capacity,
            queue: Mutex::new(VecDeque::new()),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
        }
    }

    pub fn push(&self, value: T) {
        {
            let mut queue = self.queue.lock();
            while queue.len() >= self.capacity {
                self.not_full.wait(&mut queue);
            }
            queue.push_back(value);
        }
        self.not_empty.notify_one();
    }

    pub fn pop(&self) -> T {
        let mut queue = self.queue.lock();
        loop {
            if let Some(value) = queue.pop_front() {
                drop(queue);
                self.not_full.notify_one();
                return value;
            }
            self.not_empty.wait(&mut queue);
        }
    }

    /// Non-blocking pop.
    pub fn try_pop(&self) -> Option<T> {
        let value = self.queue.lock().pop_front();
        if value.is_some() {
            self.not_full.notify_one();
        }
        value
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&self) {
        self.queue.lock().clear();
        self.not_full.notify_all();
    }
}

impl<T> Default for BoundedQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
