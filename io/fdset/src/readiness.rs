//! Interest and readiness bits for poll(2).

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// A set of poll(2) event bits, used both as an interest mask and as the
/// readiness reported to callbacks.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Readiness(i16);

impl Readiness {
    /// No events.
    pub const NONE: Readiness = Readiness(0);
    /// Data available for reading (POLLIN).
    pub const READABLE: Readiness = Readiness(libc::POLLIN);
    /// Writable without blocking (POLLOUT).
    pub const WRITABLE: Readiness = Readiness(libc::POLLOUT);

    /// Wrap raw `revents` bits from poll(2).
    pub fn from_raw(bits: i16) -> Readiness {
        Readiness(bits)
    }

    /// The raw poll(2) bits.
    pub fn raw(self) -> i16 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn readable(self) -> bool {
        self.0 & libc::POLLIN != 0
    }

    pub fn writable(self) -> bool {
        self.0 & libc::POLLOUT != 0
    }

    /// Error condition on the descriptor (POLLERR).
    pub fn error(self) -> bool {
        self.0 & libc::POLLERR != 0
    }

    /// Peer hung up (POLLHUP).
    pub fn hangup(self) -> bool {
        self.0 & libc::POLLHUP != 0
    }

    /// Descriptor was not open (POLLNVAL).
    pub fn invalid(self) -> bool {
        self.0 & libc::POLLNVAL != 0
    }

    pub fn contains(self, other: Readiness) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Readiness {
    type Output = Readiness;

    fn bitor(self, rhs: Readiness) -> Readiness {
        Readiness(self.0 | rhs.0)
    }
}

impl BitOrAssign for Readiness {
    fn bitor_assign(&mut self, rhs: Readiness) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for Readiness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut set = f.debug_set();
        if self.readable() {
            set.entry(&"READABLE");
        }
        if self.writable() {
            set.entry(&"WRITABLE");
        }
        if self.error() {
            set.entry(&"ERROR");
        }
        if self.hangup() {
            set.entry(&"HANGUP");
        }
        if self.invalid() {
            set.entry(&"INVALID");
        }
        set.finish()
    }
}
