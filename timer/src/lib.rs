//! Heap-scheduled wall-clock timers.
//!
//! A [`TimerSet`] owns a partially-ordered heap of pending timers and a
//! worker thread that sleeps until the earliest deadline, then produces a
//! duplicate of the timer's template event onto an [`EventQueue`]. Timers
//! are handles created from a set; they can be started, re-armed and
//! stopped any number of times.
//!
//! The heap is a binary min-heap in which element *i* is the child of
//! element *i/2* and a child never elapses before its parent. Each timer
//! records its own heap slot, which makes removal from the middle of the
//! heap O(log n); that in turn makes `stop` cheap no matter where the
//! timer sits.
//!
//! A fired event is not considered fully delivered until the consumer has
//! taken it off the queue. Re-arming or stopping a timer first retracts
//! any firing that is still sitting on the queue, so a consumer never
//! observes a stale wake-up from before the re-arm.
//!
//! Granularity is whole wall-clock seconds; a timer started with an
//! interval of zero fires on the worker's next iteration.

pub mod metrics;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use eventq::EventQueue;
use parking_lot::{Condvar, Mutex};
use slab::Slab;
use tracing::trace;

/// Current wall-clock time in whole seconds since the Unix epoch.
fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// A set of timers sharing one worker thread and one output queue.
///
/// Dropping the set stops every active timer, retracts their queued
/// firings, joins the worker, and releases the producer claim on the
/// output queue. Outstanding [`Timer`] handles stay valid; their
/// operations simply find nothing left to schedule against.
pub struct TimerSet<E: Clone + Send + Sync + 'static> {
    shared: Arc<Shared<E>>,
    worker: Option<thread::JoinHandle<()>>,
}

/// A single timer bound to a [`TimerSet`].
///
/// Created inactive; dropping it stops it and releases its template
/// event.
pub struct Timer<E: Clone + Send + Sync + 'static> {
    shared: Arc<Shared<E>>,
    id: usize,
}

struct Shared<E> {
    inner: Mutex<Inner<E>>,
    /// Worker sleeps here; signaled by starts that change the earliest
    /// deadline and by set teardown.
    wake: Condvar,
    stopping: AtomicBool,
    queue: Arc<EventQueue<E>>,
}

struct Inner<E> {
    /// Heap of timer ids ordered by deadline. Element i is the child of
    /// element i/2.
    heap: Vec<usize>,
    timers: Slab<TimerState<E>>,
}

struct TimerState<E> {
    /// Unix second at which the timer elapses; `None` while inactive.
    elapses: Option<u64>,
    /// Template duplicated into the queue on each firing.
    event: Option<Arc<E>>,
    /// The duplicate produced by the last firing, until the consumer is
    /// known to have taken it (or it was retracted).
    elapsed_event: Option<Arc<E>>,
    /// Position in the heap; `None` while inactive.
    slot: Option<usize>,
}

impl<E: Clone + Send + Sync + 'static> TimerSet<E> {
    /// Create a set producing into `queue` and spawn its worker thread.
    pub fn new(queue: Arc<EventQueue<E>>) -> Self {
        queue.add_producer();
        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner {
                heap: Vec::new(),
                timers: Slab::new(),
            }),
            wake: Condvar::new(),
            stopping: AtomicBool::new(false),
            queue,
        });

        let worker_shared = shared.clone();
        let worker = thread::Builder::new()
            .name("timerset-worker".to_string())
            .spawn(move || watch_timers(&worker_shared))
            .expect("failed to spawn timerset worker");

        Self {
            shared,
            worker: Some(worker),
        }
    }

    /// Allocate a new inactive timer bound to this set.
    pub fn timer(&self) -> Timer<E> {
        let mut inner = self.shared.inner.lock();
        let id = inner.timers.insert(TimerState {
            elapses: None,
            event: None,
            elapsed_event: None,
            slot: None,
        });
        Timer {
            shared: self.shared.clone(),
            id,
        }
    }

    /// Number of currently active timers.
    pub fn active(&self) -> usize {
        self.shared.inner.lock().heap.len()
    }

    #[cfg(test)]
    fn assert_heap_invariants(&self) {
        let inner = self.shared.inner.lock();
        for (slot, &id) in inner.heap.iter().enumerate() {
            assert_eq!(
                inner.timers[id].slot,
                Some(slot),
                "timer {id} disagrees about its heap slot"
            );
            let deadline = inner.timers[id].elapses.expect("heap timer has a deadline");
            if slot > 0 {
                let parent = inner.heap[slot / 2];
                let parent_deadline = inner.timers[parent]
                    .elapses
                    .expect("heap timer has a deadline");
                assert!(
                    deadline >= parent_deadline,
                    "slot {slot} elapses before its parent"
                );
            }
        }
    }
}

impl<E: Clone + Send + Sync + 'static> Drop for TimerSet<E> {
    fn drop(&mut self) {
        {
            let mut inner = self.shared.inner.lock();
            // Stop every active timer by repeatedly stopping the top.
            while let Some(&top) = inner.heap.first() {
                inner.stop_timer(top, &self.shared.queue);
            }
            // Raised under the lock so the worker cannot miss it between
            // its check and its wait.
            self.shared.stopping.store(true, Ordering::Release);
        }
        self.shared.wake.notify_all();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        self.shared.queue.remove_producer();
    }
}

impl<E: Clone + Send + Sync + 'static> Timer<E> {
    /// Arm or re-arm the timer to fire `interval_seconds` from now.
    ///
    /// A non-`None` `event` replaces the stored template; the previous
    /// template is released. Passing `None` requires a template from an
    /// earlier start.
    ///
    /// # Panics
    ///
    /// Panics if `event` is `None` and the timer has never been given a
    /// template event.
    pub fn start(&self, interval_seconds: u64, event: Option<Arc<E>>) {
        let mut inner = self.shared.inner.lock();
        assert!(
            event.is_some() || inner.timers[self.id].event.is_some(),
            "timer started without an event"
        );

        let deadline = unix_now().saturating_add(interval_seconds);
        let wakeup;

        if let Some(previous) = inner.timers[self.id].elapses {
            // Re-arming an active timer: move it to its new heap position.
            let slot = inner.timers[self.id]
                .slot
                .expect("active timer has a heap slot");
            let mut wake = deadline < previous && slot == 0;
            inner.timers[self.id].elapses = Some(deadline);
            wake |= inner.heap_adjust(slot);
            wakeup = wake;
        } else {
            // Arming an inactive (or elapsed) timer. A firing from a
            // previous activation may still sit on the output queue;
            // retract it first.
            inner.abort_elapsed(self.id, &self.shared.queue);
            inner.timers[self.id].elapses = Some(deadline);
            inner.heap_insert(self.id);
            wakeup = inner.timers[self.id].slot == Some(0);
        }

        if let Some(event) = event {
            inner.timers[self.id].event = Some(event);
        }

        metrics::TIMERS_STARTED.increment();
        drop(inner);

        if wakeup {
            self.shared.wake.notify_all();
        }
    }

    /// Deactivate the timer and retract any firing still on the queue.
    pub fn stop(&self) {
        let mut inner = self.shared.inner.lock();
        inner.stop_timer(self.id, &self.shared.queue);
        metrics::TIMERS_STOPPED.increment();
    }

    /// True while the timer sits in its set's heap.
    pub fn is_active(&self) -> bool {
        self.shared.inner.lock().timers[self.id].elapses.is_some()
    }
}

impl<E: Clone + Send + Sync + 'static> Drop for Timer<E> {
    fn drop(&mut self) {
        let mut inner = self.shared.inner.lock();
        inner.stop_timer(self.id, &self.shared.queue);
        inner.timers.remove(self.id);
    }
}

impl<E: Clone + Send + Sync + 'static> Inner<E> {
    /// Deactivate `id` (removing it from the heap if present) and retract
    /// any still-queued firing.
    fn stop_timer(&mut self, id: usize, queue: &EventQueue<E>) {
        if let Some(slot) = self.timers[id].slot {
            self.timers[id].elapses = None;
            self.heap_delete(slot);
        }
        self.abort_elapsed(id, queue);
    }

    /// Remove this timer's queued firing from the output queue, to
    /// pretend it never elapsed. Closes the race where the worker fires
    /// and the caller re-arms or stops before the consumer saw the event.
    fn abort_elapsed(&mut self, id: usize, queue: &EventQueue<E>) {
        let Some(elapsed) = self.timers[id].elapsed_event.take() else {
            return;
        };
        if queue.delete_equal(&elapsed) > 0 {
            metrics::TIMERS_ABORTED.increment();
        }
    }

    /// Fire the top timer: remove it from the heap, duplicate its
    /// template onto the output queue, deactivate it.
    fn elapse_top(&mut self, queue: &Arc<EventQueue<E>>) {
        let id = self.heap[0];
        self.heap_delete(0);
        let state = &mut self.timers[id];
        // abort_elapsed always runs before a timer is activated, so a
        // previous firing can no longer be outstanding here.
        debug_assert!(state.elapsed_event.is_none());
        let Some(template) = state.event.as_ref() else {
            state.elapses = None;
            return;
        };
        let duplicate = Arc::new((**template).clone());
        state.elapsed_event = Some(duplicate.clone());
        state.elapses = None;
        queue.produce(duplicate);
        metrics::TIMERS_ELAPSED.increment();
    }

    fn deadline_at(&self, slot: usize) -> u64 {
        self.timers[self.heap[slot]]
            .elapses
            .expect("heap timer has a deadline")
    }

    /// Swap two heap slots and fix up the back-indices. The only
    /// primitive that moves heap elements.
    fn heap_swap(&mut self, a: usize, b: usize) {
        self.heap.swap(a, b);
        let id = self.heap[a];
        self.timers[id].slot = Some(a);
        let id = self.heap[b];
        self.timers[id].slot = Some(b);
    }

    /// Add a timer at the end of the heap and sift it into place.
    fn heap_insert(&mut self, id: usize) {
        self.heap.push(id);
        let slot = self.heap.len() - 1;
        self.timers[id].slot = Some(slot);
        self.heap_adjust(slot);
    }

    /// Remove the timer at `slot` by swapping it with the last element,
    /// shrinking the heap, and sifting the swapped element into place.
    fn heap_delete(&mut self, slot: usize) {
        let id = self.heap[slot];
        let last = self.heap.len() - 1;
        if slot == last {
            self.heap.pop();
        } else {
            self.heap_swap(slot, last);
            self.heap.pop();
            self.heap_adjust(slot);
        }
        self.timers[id].slot = None;
    }

    /// Restore the partial order around `slot` after its deadline
    /// changed, moving the element up or down as needed. Returns true if
    /// slot 0 now holds a strictly earlier deadline than before.
    fn heap_adjust(&mut self, mut slot: usize) -> bool {
        // Move toward the top? Terminates at the root, where an element
        // is its own parent.
        if self.deadline_at(slot) < self.deadline_at(slot / 2) {
            while self.deadline_at(slot) < self.deadline_at(slot / 2) {
                self.heap_swap(slot, slot / 2);
                slot /= 2;
            }
            return slot == 0;
        }

        // Move toward the bottom.
        loop {
            let mut child = slot * 2;
            if child >= self.heap.len() {
                return false;
            }
            if child + 1 < self.heap.len() && self.deadline_at(child + 1) < self.deadline_at(child)
            {
                child += 1;
            }
            if child != slot && self.deadline_at(child) < self.deadline_at(slot) {
                self.heap_swap(slot, child);
                slot = child;
            } else {
                return false;
            }
        }
    }
}

/// Worker loop: fire due timers, sleep until the next deadline or a
/// wake-up, exit when the set raises its stopping flag.
fn watch_timers<E: Clone + Send + Sync + 'static>(shared: &Shared<E>) {
    loop {
        let mut inner = shared.inner.lock();
        if shared.stopping.load(Ordering::Acquire) {
            return;
        }

        if inner.heap.is_empty() {
            shared.wake.wait(&mut inner);
            continue;
        }

        let top_time = inner.deadline_at(0);
        let now = unix_now();
        if top_time <= now {
            inner.elapse_top(&shared.queue);
            continue;
        }

        trace!(sleep = top_time - now, "timer worker sleeping");
        let _ = shared
            .wake
            .wait_for(&mut inner, Duration::from_secs(top_time - now));
    }
}
