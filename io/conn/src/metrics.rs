//! Connection metrics.

use ::metrics::{Counter, CounterGroup};
use metriken::metric;

// Counter groups (sharded storage); traffic counters are bumped on every
// send/read syscall from poller threads and caller threads alike.
static TRAFFIC: CounterGroup = CounterGroup::new();
static FRAMING: CounterGroup = CounterGroup::new();

/// Counter slot indices for traffic metrics.
pub mod traffic {
    pub const RX_BYTES: usize = 0;
    pub const TX_BYTES: usize = 1;
}

/// Counter slot indices for framing metrics.
pub mod framing {
    pub const FRAMES_READ: usize = 0;
    pub const CORRUPT_PREFIXES: usize = 1;
}

#[metric(name = "conn_rx_bytes", description = "Bytes read off sockets")]
pub static RX_BYTES: Counter = Counter::new(&TRAFFIC, traffic::RX_BYTES);

#[metric(name = "conn_tx_bytes", description = "Bytes written to sockets")]
pub static TX_BYTES: Counter = Counter::new(&TRAFFIC, traffic::TX_BYTES);

#[metric(
    name = "conn_frames_read",
    description = "Complete frames returned by framed reads"
)]
pub static FRAMES_READ: Counter = Counter::new(&FRAMING, framing::FRAMES_READ);

#[metric(
    name = "conn_corrupt_prefixes",
    description = "Negative length prefixes discarded during framing"
)]
pub static CORRUPT_PREFIXES: Counter = Counter::new(&FRAMING, framing::CORRUPT_PREFIXES);
