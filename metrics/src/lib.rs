//! Sharded metrics with metriken integration.
//!
//! This crate provides [`Counter`] and [`CounterGroup`] for counters that
//! are bumped from several threads at once (poller threads, timer
//! workers, arbitrary callers) without cache-line contention.
//!
//! # Overview
//!
//! A [`CounterGroup`] provides sharded storage for up to 16 counters.
//! Each thread writes to its own shard (selected by thread), so counters
//! in the same group never false-share and concurrent increments of the
//! same counter touch different cache lines.
//!
//! A [`Counter`] references a slot in a group and implements
//! [`metriken::Metric`], so it can be registered with the `#[metric]`
//! attribute; reading sums the slot across all shards.
//!
//! # Example
//!
//! ```
//! use metrics::{Counter, CounterGroup};
//!
//! // Define named slot constants for clarity
//! mod slots {
//!     pub const RX: usize = 0;
//!     pub const TX: usize = 1;
//! }
//!
//! // Create the counter group (just storage)
//! static TRAFFIC: CounterGroup = CounterGroup::new();
//!
//! // Create counters referencing group slots
//! static RX_BYTES: Counter = Counter::new(&TRAFFIC, slots::RX);
//! static TX_BYTES: Counter = Counter::new(&TRAFFIC, slots::TX);
//!
//! // Use in hot path
//! RX_BYTES.add(512);
//! TX_BYTES.increment();
//! assert_eq!(RX_BYTES.value(), 512);
//! ```

mod counter;

pub use counter::{Counter, CounterGroup, SLOTS_PER_GROUP};

// Re-export metriken for convenience
pub use metriken;
