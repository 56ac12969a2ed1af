//! Producer-counted event queue.
//!
//! An [`EventQueue`] is an ordered, thread-safe queue of shared event
//! handles. Producers announce themselves with [`add_producer`] and leave
//! with [`remove_producer`]; a blocked consumer wakes up as soon as an
//! element arrives or the last producer leaves, so consumers can
//! distinguish "nothing yet" from "nothing ever again".
//!
//! Elements are `Arc<E>` handles and removal via [`delete_equal`] matches
//! by *identity* (pointer equality), not by value. A producer that needs
//! to retract an element it already queued keeps its own clone of the
//! handle and deletes with that; two events with equal contents but
//! separate allocations never alias.
//!
//! [`add_producer`]: EventQueue::add_producer
//! [`remove_producer`]: EventQueue::remove_producer
//! [`delete_equal`]: EventQueue::delete_equal

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Ordered multi-producer queue of shared event handles.
pub struct EventQueue<E> {
    inner: Mutex<Inner<E>>,
    readers: Condvar,
}

struct Inner<E> {
    items: VecDeque<Arc<E>>,
    producers: usize,
}

impl<E> EventQueue<E> {
    /// Create an empty queue with no producers.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                producers: 0,
            }),
            readers: Condvar::new(),
        })
    }

    /// Announce a producer. Blocked consumers will wait as long as at
    /// least one producer remains.
    pub fn add_producer(&self) {
        self.inner.lock().producers += 1;
    }

    /// Retract a producer claim. When the count reaches zero, all blocked
    /// consumers are woken so they can observe the end of the stream.
    pub fn remove_producer(&self) {
        let mut inner = self.inner.lock();
        debug_assert!(inner.producers > 0, "producer count underflow");
        inner.producers = inner.producers.saturating_sub(1);
        if inner.producers == 0 {
            self.readers.notify_all();
        }
    }

    /// Append an event and wake one consumer.
    pub fn produce(&self, event: Arc<E>) {
        let mut inner = self.inner.lock();
        inner.items.push_back(event);
        self.readers.notify_one();
    }

    /// Pop the front event, blocking while the queue is empty and
    /// producers remain. Returns `None` once the queue is empty and the
    /// last producer has left.
    pub fn consume(&self) -> Option<Arc<E>> {
        let mut inner = self.inner.lock();
        loop {
            if let Some(event) = inner.items.pop_front() {
                return Some(event);
            }
            if inner.producers == 0 {
                return None;
            }
            self.readers.wait(&mut inner);
        }
    }

    /// Like [`consume`](Self::consume), but gives up after `timeout`.
    pub fn consume_timeout(&self, timeout: Duration) -> Option<Arc<E>> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        loop {
            if let Some(event) = inner.items.pop_front() {
                return Some(event);
            }
            if inner.producers == 0 {
                return None;
            }
            if self.readers.wait_until(&mut inner, deadline).timed_out() {
                return inner.items.pop_front();
            }
        }
    }

    /// Pop the front event without blocking.
    pub fn try_consume(&self) -> Option<Arc<E>> {
        self.inner.lock().items.pop_front()
    }

    /// Remove every queued element that is pointer-identical to `event`.
    /// Returns the number removed. Relative order of survivors is kept.
    pub fn delete_equal(&self, event: &Arc<E>) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.items.len();
        inner.items.retain(|item| !Arc::ptr_eq(item, event));
        before - inner.items.len()
    }

    /// Number of queued elements.
    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    /// True when no elements are queued.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }

    /// Current producer count.
    pub fn producers(&self) -> usize {
        self.inner.lock().producers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn fifo_order() {
        let queue = EventQueue::new();
        queue.add_producer();
        for i in 0..5u32 {
            queue.produce(Arc::new(i));
        }
        for i in 0..5u32 {
            assert_eq!(*queue.try_consume().unwrap(), i);
        }
        assert!(queue.try_consume().is_none());
    }

    #[test]
    fn consume_blocks_until_produce() {
        let queue = EventQueue::<u32>::new();
        queue.add_producer();

        let consumer = {
            let queue = queue.clone();
            thread::spawn(move || queue.consume())
        };

        thread::sleep(Duration::from_millis(50));
        queue.produce(Arc::new(7));
        assert_eq!(*consumer.join().unwrap().unwrap(), 7);
    }

    #[test]
    fn consume_unblocks_on_last_producer_leaving() {
        let queue = EventQueue::<u32>::new();
        queue.add_producer();

        let consumer = {
            let queue = queue.clone();
            thread::spawn(move || queue.consume())
        };

        thread::sleep(Duration::from_millis(50));
        queue.remove_producer();
        assert!(consumer.join().unwrap().is_none());
    }

    #[test]
    fn consume_timeout_expires() {
        let queue = EventQueue::<u32>::new();
        queue.add_producer();
        let start = Instant::now();
        assert!(queue.consume_timeout(Duration::from_millis(50)).is_none());
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn delete_equal_matches_identity_not_value() {
        let queue = EventQueue::new();
        queue.add_producer();

        let original = Arc::new(42u32);
        let lookalike = Arc::new(42u32);
        queue.produce(original.clone());
        queue.produce(lookalike.clone());
        queue.produce(original.clone());

        assert_eq!(queue.delete_equal(&original), 2);
        assert_eq!(queue.len(), 1);
        assert!(Arc::ptr_eq(&queue.try_consume().unwrap(), &lookalike));
    }

    #[test]
    fn delete_equal_keeps_survivor_order() {
        let queue = EventQueue::new();
        queue.add_producer();

        let doomed = Arc::new(0u32);
        let a = Arc::new(1u32);
        let b = Arc::new(2u32);
        queue.produce(a.clone());
        queue.produce(doomed.clone());
        queue.produce(b.clone());

        assert_eq!(queue.delete_equal(&doomed), 1);
        assert!(Arc::ptr_eq(&queue.try_consume().unwrap(), &a));
        assert!(Arc::ptr_eq(&queue.try_consume().unwrap(), &b));
    }
}
