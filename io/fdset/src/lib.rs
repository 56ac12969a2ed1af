//! Poll-based file descriptor multiplexer.
//!
//! An [`FdSet`] maps file descriptors to interest masks and callbacks,
//! and runs one dedicated poller thread that blocks in poll(2) over the
//! registered descriptors. When a descriptor becomes ready, the poller
//! invokes the registered callback on its own thread with the reported
//! readiness.
//!
//! Interest updates and registrations from other threads take effect on
//! the next poll cycle; the poller is kicked out of poll(2) through a
//! self-pipe. [`FdSet::unregister`] does not return while a callback for
//! that descriptor is in flight, so a caller that has unregistered may
//! immediately close the descriptor.

mod readiness;

pub use readiness::Readiness;

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};

use parking_lot::{Condvar, Mutex};
use tracing::error;

/// Errors returned by the multiplexer.
#[derive(Debug)]
pub enum Error {
    /// Pipe creation, spawn, or poll failure.
    Io(io::Error),
    /// The descriptor is already registered with this set.
    AlreadyRegistered,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {e}"),
            Error::AlreadyRegistered => write!(f, "descriptor already registered"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::AlreadyRegistered => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

type Callback = Arc<dyn Fn(RawFd, Readiness) + Send + Sync>;

struct Entry {
    interest: Readiness,
    callback: Callback,
    /// Stamp distinguishing this registration from an earlier one on a
    /// reused descriptor number.
    generation: u64,
}

struct State {
    entries: HashMap<RawFd, Entry>,
    next_generation: u64,
    /// Registration whose callback is currently running, if any.
    dispatching: Option<(RawFd, u64)>,
}

struct Shared {
    state: Mutex<State>,
    /// Signaled when a callback finishes, for quiescing unregisters.
    quiesced: Condvar,
    stopping: AtomicBool,
    /// Write end of the self-pipe used to kick the poller out of poll(2).
    wake_fd: RawFd,
    /// Identity of the poller thread, so it can unregister from inside a
    /// callback without waiting on itself.
    poller: Mutex<Option<ThreadId>>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        // Closed here rather than in FdSet::drop: a weak handle can only
        // reach wake() while the Shared is still alive, so the write end
        // stays open exactly that long.
        unsafe {
            libc::close(self.wake_fd);
        }
    }
}

impl Shared {
    fn wake(&self) {
        let byte = 1u8;
        // The pipe being full already guarantees a pending wake-up.
        unsafe {
            libc::write(self.wake_fd, &byte as *const u8 as *const libc::c_void, 1);
        }
    }

    fn listen(&self, fd: RawFd, mask: Readiness, value: Readiness) {
        let mut changed = false;
        {
            let mut state = self.state.lock();
            if let Some(entry) = state.entries.get_mut(&fd) {
                let updated = (entry.interest.raw() & !mask.raw()) | (value.raw() & mask.raw());
                if updated != entry.interest.raw() {
                    entry.interest = Readiness::from_raw(updated);
                    changed = true;
                }
            }
        }
        if changed {
            self.wake();
        }
    }

    fn unregister(&self, fd: RawFd) {
        let mut state = self.state.lock();
        if state.entries.remove(&fd).is_none() {
            return;
        }
        let on_poller = *self.poller.lock() == Some(thread::current().id());
        if !on_poller {
            // Quiesce: a callback for this descriptor may be mid-flight.
            while matches!(state.dispatching, Some((dfd, _)) if dfd == fd) {
                self.quiesced.wait(&mut state);
            }
        }
        drop(state);
        self.wake();
    }
}

/// A registry of descriptors served by one poller thread.
pub struct FdSet {
    shared: Arc<Shared>,
    /// Read end of the self-pipe, closed after the poller exits.
    wake_read: RawFd,
    poller: Option<thread::JoinHandle<()>>,
}

impl FdSet {
    /// Create the set and spawn its poller thread.
    pub fn new() -> Result<FdSet, Error> {
        let mut pipe = [0 as RawFd; 2];
        let rc = unsafe { libc::pipe2(pipe.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) };
        if rc < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        let [wake_read, wake_write] = pipe;

        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                entries: HashMap::new(),
                next_generation: 0,
                dispatching: None,
            }),
            quiesced: Condvar::new(),
            stopping: AtomicBool::new(false),
            wake_fd: wake_write,
            poller: Mutex::new(None),
        });

        let poller_shared = shared.clone();
        let poller = thread::Builder::new()
            .name("fdset-poller".to_string())
            .spawn(move || run_poller(&poller_shared, wake_read))
            .map_err(|e| {
                unsafe {
                    libc::close(wake_read);
                    libc::close(wake_write);
                }
                Error::Io(e)
            })?;

        Ok(FdSet {
            shared,
            wake_read,
            poller: Some(poller),
        })
    }

    /// Register `fd` with an initial interest mask and a callback invoked
    /// from the poller thread whenever the descriptor is ready.
    pub fn register<F>(&self, fd: RawFd, interest: Readiness, callback: F) -> Result<(), Error>
    where
        F: Fn(RawFd, Readiness) + Send + Sync + 'static,
    {
        let mut state = self.shared.state.lock();
        if state.entries.contains_key(&fd) {
            return Err(Error::AlreadyRegistered);
        }
        let generation = state.next_generation;
        state.next_generation += 1;
        state.entries.insert(
            fd,
            Entry {
                interest,
                callback: Arc::new(callback),
                generation,
            },
        );
        drop(state);
        self.shared.wake();
        Ok(())
    }

    /// Update interest for `fd`: within the bits of `mask`, set interest
    /// to `value`. Unknown descriptors are ignored.
    pub fn listen(&self, fd: RawFd, mask: Readiness, value: Readiness) {
        self.shared.listen(fd, mask, value);
    }

    /// Remove `fd` from the set. Does not return while a callback for
    /// `fd` is in flight (unless called from the poller thread itself),
    /// so the caller may close the descriptor immediately afterwards.
    pub fn unregister(&self, fd: RawFd) {
        self.shared.unregister(fd);
    }

    /// A weak handle for components that must not keep the set alive.
    pub fn handle(&self) -> FdSetRef {
        FdSetRef {
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Number of registered descriptors.
    pub fn len(&self) -> usize {
        self.shared.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.state.lock().entries.is_empty()
    }
}

impl Drop for FdSet {
    fn drop(&mut self) {
        self.shared.stopping.store(true, Ordering::Release);
        self.shared.wake();
        if let Some(poller) = self.poller.take() {
            let _ = poller.join();
        }
        unsafe {
            libc::close(self.wake_read);
        }
    }
}

/// Weak handle to an [`FdSet`]. All operations are no-ops once the set
/// has been dropped.
#[derive(Clone)]
pub struct FdSetRef {
    shared: Weak<Shared>,
}

impl FdSetRef {
    /// See [`FdSet::listen`].
    pub fn listen(&self, fd: RawFd, mask: Readiness, value: Readiness) {
        if let Some(shared) = self.shared.upgrade() {
            shared.listen(fd, mask, value);
        }
    }

    /// See [`FdSet::unregister`].
    pub fn unregister(&self, fd: RawFd) {
        if let Some(shared) = self.shared.upgrade() {
            shared.unregister(fd);
        }
    }

    /// True when both handles refer to the same set.
    pub fn same_set(&self, other: &FdSetRef) -> bool {
        Weak::ptr_eq(&self.shared, &other.shared)
    }
}

fn run_poller(shared: &Shared, wake_read: RawFd) {
    *shared.poller.lock() = Some(thread::current().id());

    let mut pollfds: Vec<libc::pollfd> = Vec::new();
    let mut ready: Vec<(RawFd, u64, i16)> = Vec::new();

    loop {
        if shared.stopping.load(Ordering::Acquire) {
            return;
        }

        pollfds.clear();
        pollfds.push(libc::pollfd {
            fd: wake_read,
            events: libc::POLLIN,
            revents: 0,
        });
        {
            let state = shared.state.lock();
            for (&fd, entry) in &state.entries {
                if !entry.interest.is_empty() {
                    pollfds.push(libc::pollfd {
                        fd,
                        events: entry.interest.raw(),
                        revents: 0,
                    });
                }
            }
        }

        let rc = unsafe { libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, -1) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            error!("fdset poll failed: {err}");
            return;
        }
        if rc == 0 {
            continue;
        }

        if pollfds[0].revents != 0 {
            drain_wake_pipe(wake_read);
        }

        // Snapshot the ready descriptors with their generation stamps so
        // a registration replaced mid-cycle is not dispatched stale.
        ready.clear();
        {
            let state = shared.state.lock();
            for pfd in &pollfds[1..] {
                if pfd.revents == 0 {
                    continue;
                }
                if let Some(entry) = state.entries.get(&pfd.fd) {
                    ready.push((pfd.fd, entry.generation, pfd.revents));
                }
            }
        }

        for (fd, generation, revents) in ready.drain(..) {
            let callback = {
                let mut state = shared.state.lock();
                let current = match state.entries.get(&fd) {
                    Some(entry) if entry.generation == generation => entry.callback.clone(),
                    _ => continue,
                };
                state.dispatching = Some((fd, generation));
                current
            };

            callback(fd, Readiness::from_raw(revents));

            let mut state = shared.state.lock();
            state.dispatching = None;
            drop(state);
            shared.quiesced.notify_all();
        }
    }
}

fn drain_wake_pipe(fd: RawFd) {
    let mut sink = [0u8; 64];
    loop {
        let n = unsafe { libc::read(fd, sink.as_mut_ptr() as *mut libc::c_void, sink.len()) };
        if n <= 0 {
            return;
        }
    }
}
