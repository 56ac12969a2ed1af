//! Timer set metrics.

use ::metrics::{Counter, CounterGroup};
use metriken::metric;

// Counter group (sharded storage); starts and firings come from caller
// threads and the worker thread concurrently.
static TIMER: CounterGroup = CounterGroup::new();

/// Counter slot indices for timer metrics.
pub mod timer {
    pub const STARTED: usize = 0;
    pub const STOPPED: usize = 1;
    pub const ELAPSED: usize = 2;
    pub const ABORTED: usize = 3;
}

#[metric(name = "timers_started", description = "Total timer (re)arms")]
pub static TIMERS_STARTED: Counter = Counter::new(&TIMER, timer::STARTED);

#[metric(name = "timers_stopped", description = "Total timer stops")]
pub static TIMERS_STOPPED: Counter = Counter::new(&TIMER, timer::STOPPED);

#[metric(name = "timers_elapsed", description = "Total timer firings produced")]
pub static TIMERS_ELAPSED: Counter = Counter::new(&TIMER, timer::ELAPSED);

#[metric(
    name = "timers_aborted",
    description = "In-flight firings retracted from the output queue"
)]
pub static TIMERS_ABORTED: Counter = Counter::new(&TIMER, timer::ABORTED);
