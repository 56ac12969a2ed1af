//! Sharded counter storage.
//!
//! Writes go to a per-thread shard so threads bumping the same counter
//! never contend on one cache line; reads sum across shards. A shard is
//! 128 bytes (16 slots of 8 bytes) and shards are 128-byte aligned, so
//! no two shards share a cache-line pair.

use std::any::Any;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use metriken::{Metric, Value};

/// Slots available in one [`CounterGroup`].
pub const SLOTS_PER_GROUP: usize = 16;

/// Number of shards per group. Power of two so shard selection is a
/// mask.
const SHARD_COUNT: usize = 64;

/// Monotonic source of per-thread shard assignments.
static NEXT_SHARD: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    /// This thread's shard, fixed on first use.
    static SHARD: usize = NEXT_SHARD.fetch_add(1, Ordering::Relaxed) & (SHARD_COUNT - 1);
}

fn shard_index() -> usize {
    SHARD.with(|&shard| shard)
}

#[repr(align(128))]
struct Shard {
    slots: [AtomicU64; SLOTS_PER_GROUP],
}

/// Sharded storage for up to [`SLOTS_PER_GROUP`] counters.
pub struct CounterGroup {
    shards: [Shard; SHARD_COUNT],
}

impl CounterGroup {
    /// Create a zeroed group. Usable in statics.
    pub const fn new() -> Self {
        const ZERO: AtomicU64 = AtomicU64::new(0);
        const EMPTY: Shard = Shard {
            slots: [ZERO; SLOTS_PER_GROUP],
        };
        Self {
            shards: [EMPTY; SHARD_COUNT],
        }
    }

    fn add(&self, slot: usize, value: u64) {
        self.shards[shard_index()].slots[slot].fetch_add(value, Ordering::Relaxed);
    }

    fn sum(&self, slot: usize) -> u64 {
        self.shards
            .iter()
            .map(|shard| shard.slots[slot].load(Ordering::Relaxed))
            .sum()
    }
}

impl Default for CounterGroup {
    fn default() -> Self {
        Self::new()
    }
}

/// A counter occupying one slot of a [`CounterGroup`].
pub struct Counter {
    group: &'static CounterGroup,
    slot: usize,
}

impl Counter {
    /// Bind a counter to `slot` of `group`.
    ///
    /// # Panics
    ///
    /// Panics (at compile time for statics) if `slot` is out of range.
    pub const fn new(group: &'static CounterGroup, slot: usize) -> Self {
        assert!(slot < SLOTS_PER_GROUP, "counter slot out of range");
        Self { group, slot }
    }

    /// Add one.
    #[inline]
    pub fn increment(&self) {
        self.add(1);
    }

    /// Add `value` to this thread's shard.
    #[inline]
    pub fn add(&self, value: u64) {
        self.group.add(self.slot, value);
    }

    /// Current total, summed across shards.
    pub fn value(&self) -> u64 {
        self.group.sum(self.slot)
    }
}

impl Metric for Counter {
    fn as_any(&self) -> Option<&dyn Any> {
        Some(self)
    }

    fn value(&self) -> Option<Value> {
        Some(Value::Counter(Counter::value(self)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    static GROUP: CounterGroup = CounterGroup::new();

    #[test]
    fn slots_are_independent() {
        static A: Counter = Counter::new(&GROUP, 0);
        static B: Counter = Counter::new(&GROUP, 1);

        A.add(5);
        B.increment();
        assert_eq!(A.value(), 5);
        assert_eq!(B.value(), 1);
    }

    #[test]
    fn sums_across_threads() {
        static TOTAL: CounterGroup = CounterGroup::new();
        static HITS: Counter = Counter::new(&TOTAL, 0);

        let workers: Vec<_> = (0..8)
            .map(|_| {
                thread::spawn(|| {
                    for _ in 0..1000 {
                        HITS.increment();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(HITS.value(), 8000);
    }
}
