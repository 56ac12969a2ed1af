//! The connection type: buffering, framing, and poll integration.

use std::io;
use std::net::ToSocketAddrs;
use std::os::fd::{IntoRawFd, RawFd};
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, ThreadId};
use std::time::Duration;

use fdset::{FdSet, FdSetRef, Readiness};
use parking_lot::{Mutex, MutexGuard};
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{error, warn};

use crate::buffer::Buffer;
use crate::{Error, metrics, sys};

/// Bytes per refill attempt on the read side.
const READ_CHUNK: usize = 4096;

const LF: u8 = 0x0a;
const CR: u8 = 0x0d;

/// Outcome of a buffered write attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// Everything drained to the socket.
    Complete,
    /// Data remains buffered (socket not writable, or below the
    /// buffering threshold).
    Pending,
}

/// Outcome of [`Connection::flush`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flush {
    /// The output buffer drained completely.
    Done,
    /// The blocking poll was interrupted before the drain finished.
    Interrupted,
}

/// Outcome of [`Connection::wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    /// The connection made progress in some direction.
    Progress,
    /// The timeout passed without readiness.
    TimedOut,
}

/// Settings for outbound connects and fresh connections.
#[derive(Debug, Clone)]
pub struct Config {
    /// How long [`Connection::open_tcp_with`] waits for the TCP connect.
    /// `None` blocks indefinitely.
    pub connect_timeout: Option<Duration>,
    /// Initial output buffering threshold in bytes. Zero writes through.
    pub output_buffering: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            connect_timeout: Some(Duration::from_secs(30)),
            output_buffering: 0,
        }
    }
}

/// Callback invoked from the poller thread when a registered connection
/// has new input.
pub type ConnCallback = Arc<dyn Fn(&Arc<Connection>) + Send + Sync>;

struct Input {
    buf: Buffer,
    /// Sticky: read returned zero bytes.
    eof: bool,
    /// Sticky: read failed with a real error.
    error: bool,
    listening_pollin: bool,
}

struct Output {
    buf: Buffer,
    /// Writes are held back until this many bytes are buffered.
    buffering: u32,
    listening_pollout: bool,
}

struct Registration {
    fdset: FdSetRef,
    callback: ConnCallback,
}

/// A non-blocking stream connection with buffered, framed I/O.
///
/// The input and output directions are locked independently so readers
/// and writers stay out of each other's way. Dropping the last handle
/// unregisters the connection, attempts one final non-blocking drain of
/// buffered output, and closes the descriptor.
pub struct Connection {
    /// Owned descriptor; closed on drop.
    fd: RawFd,
    /// Back-reference handed to the fdset so the poller never keeps the
    /// connection alive.
    weak: Weak<Connection>,
    claimed: AtomicBool,
    claimant: Mutex<Option<ThreadId>>,
    input: Mutex<Input>,
    output: Mutex<Output>,
    /// Written under both halves' locks, read under either plus this
    /// leaf lock (lock order: output, input, registration).
    registration: Mutex<Option<Registration>>,
}

impl Connection {
    /// Connect to `host:port` with the default [`Config`] and wrap the
    /// socket.
    pub fn open_tcp(host: &str, port: u16) -> Result<Arc<Connection>, Error> {
        Self::open_tcp_with(host, port, &Config::default())
    }

    /// Connect to `host:port` and wrap the socket. The connect itself
    /// blocks, bounded by `config.connect_timeout`; the wrapped socket is
    /// non-blocking.
    pub fn open_tcp_with(
        host: &str,
        port: u16,
        config: &Config,
    ) -> Result<Arc<Connection>, Error> {
        let mut last_err = None;
        for addr in (host, port).to_socket_addrs().map_err(Error::Io)? {
            let socket =
                match Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP)) {
                    Ok(socket) => socket,
                    Err(e) => {
                        last_err = Some(e);
                        continue;
                    }
                };
            let connected = match config.connect_timeout {
                Some(timeout) => socket.connect_timeout(&addr.into(), timeout),
                None => socket.connect(&addr.into()),
            };
            match connected {
                Ok(()) => {
                    let conn = Self::wrap_fd(socket.into_raw_fd())?;
                    conn.set_output_buffering(config.output_buffering);
                    return Ok(conn);
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(Error::Io(last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "address resolved to nothing")
        })))
    }

    /// Take ownership of a connected descriptor and switch it to
    /// non-blocking mode. The descriptor is closed if the switch fails.
    pub fn wrap_fd(fd: RawFd) -> io::Result<Arc<Connection>> {
        if let Err(e) = sys::set_nonblocking(fd) {
            unsafe {
                libc::close(fd);
            }
            return Err(e);
        }
        Ok(Arc::new_cyclic(|weak| Connection {
            fd,
            weak: weak.clone(),
            claimed: AtomicBool::new(false),
            claimant: Mutex::new(None),
            input: Mutex::new(Input {
                buf: Buffer::new(),
                eof: false,
                error: false,
                listening_pollin: false,
            }),
            output: Mutex::new(Output {
                buf: Buffer::new(),
                buffering: 0,
                listening_pollout: false,
            }),
            registration: Mutex::new(None),
        }))
    }

    /// The wrapped descriptor.
    pub fn as_raw_fd(&self) -> RawFd {
        self.fd
    }

    /// Declare the current thread the only user of this connection.
    /// Purely an exclusivity assertion; foreign-thread access afterwards
    /// is a caller bug (caught by debug assertions).
    ///
    /// # Panics
    ///
    /// Panics if the connection is already claimed.
    pub fn claim(&self) {
        if self.claimed.swap(true, Ordering::AcqRel) {
            panic!("connection claimed twice");
        }
        *self.claimant.lock() = Some(thread::current().id());
    }

    fn lock_input(&self) -> MutexGuard<'_, Input> {
        self.debug_check_claim();
        self.input.lock()
    }

    fn lock_output(&self) -> MutexGuard<'_, Output> {
        self.debug_check_claim();
        self.output.lock()
    }

    #[inline]
    fn debug_check_claim(&self) {
        if cfg!(debug_assertions) && self.claimed.load(Ordering::Acquire) {
            debug_assert_eq!(
                *self.claimant.lock(),
                Some(thread::current().id()),
                "claimed connection touched from a foreign thread"
            );
        }
    }

    // Observers

    /// Unwritten bytes in the output buffer.
    pub fn outbuf_len(&self) -> usize {
        self.lock_output().buf.len()
    }

    /// Unread bytes in the input buffer.
    pub fn inbuf_len(&self) -> usize {
        self.lock_input().buf.len()
    }

    /// True once a read has observed end of stream.
    pub fn eof(&self) -> bool {
        self.lock_input().eof
    }

    /// True once a read has failed with a real error.
    pub fn read_error(&self) -> bool {
        self.lock_input().error
    }

    // Write path

    /// Append `bytes` to the output buffer and attempt a non-blocking
    /// drain.
    pub fn write(&self, bytes: &[u8]) -> Result<Progress, Error> {
        let mut out = self.lock_output();
        out.buf.append(bytes);
        Ok(self.try_drain_locked(&mut out)?)
    }

    /// Like [`write`](Self::write), with a 4-byte big-endian length
    /// prefix prepended.
    pub fn write_with_length(&self, bytes: &[u8]) -> Result<Progress, Error> {
        if bytes.len() > i32::MAX as usize {
            return Err(Error::FrameTooLarge);
        }
        let prefix = (bytes.len() as u32).to_be_bytes();
        let mut out = self.lock_output();
        out.buf.append(&prefix);
        out.buf.append(bytes);
        Ok(self.try_drain_locked(&mut out)?)
    }

    /// Update the buffering threshold. Shrinking it may trigger an
    /// immediate drain.
    pub fn set_output_buffering(&self, threshold: u32) {
        let mut out = self.lock_output();
        out.buffering = threshold;
        let _ = self.try_drain_locked(&mut out);
    }

    /// Block until the output buffer is fully drained.
    pub fn flush(&self) -> Result<Flush, Error> {
        let mut out = self.lock_output();
        self.drain_locked(&mut out)?;

        while !out.buf.is_empty() {
            let fd = self.fd;
            // Don't hold the lock while blocked in poll.
            drop(out);

            let revents = match sys::poll_fd(fd, Readiness::WRITABLE, None) {
                Ok(revents) => revents,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(Flush::Interrupted),
                Err(e) => {
                    error!("flush: poll failed on fd {fd}: {e}");
                    return Err(e.into());
                }
            };
            if revents.is_empty() {
                return Ok(Flush::Interrupted);
            }
            if revents.invalid() {
                error!("flush: fd {fd} not open");
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::NotFound,
                    "descriptor not open",
                )));
            }

            out = self.lock_output();
            if revents.writable() || revents.error() || revents.hangup() {
                self.drain_locked(&mut out)?;
            }
        }

        Ok(Flush::Done)
    }

    // Read path

    /// Return all currently buffered input, refilling once if the buffer
    /// is empty. `None` when nothing is available.
    pub fn read_everything(&self) -> Option<Vec<u8>> {
        let mut input = self.lock_input();
        if input.buf.is_empty() {
            self.refill_locked(&mut input);
            if input.buf.is_empty() {
                return None;
            }
        }
        let n = input.buf.len();
        Some(input.buf.take(n))
    }

    /// Return exactly `n` bytes, or `None` if that many are not yet
    /// available.
    pub fn read_fixed(&self, n: usize) -> Option<Vec<u8>> {
        let mut input = self.lock_input();
        if input.buf.len() < n {
            self.refill_locked(&mut input);
            if input.buf.len() < n {
                return None;
            }
        }
        metrics::FRAMES_READ.increment();
        Some(input.buf.take(n))
    }

    /// Return the next line without its terminator. The LF is consumed;
    /// a single CR immediately before it is stripped from the result.
    /// `None` until a full line is available.
    pub fn read_line(&self) -> Option<Vec<u8>> {
        let mut input = self.lock_input();
        let mut pos = input.buf.find(LF, 0);
        if pos.is_none() {
            self.refill_locked(&mut input);
            pos = input.buf.find(LF, 0);
        }
        let pos = pos?;

        let mut line = input.buf.take(pos);
        // Skip the LF, which stays out of the result.
        input.buf.consume(1);
        if line.last() == Some(&CR) {
            line.pop();
        }
        metrics::FRAMES_READ.increment();
        Some(line)
    }

    /// Return the payload of the next length-prefixed frame (4-byte
    /// big-endian length). A negative length is treated as corruption:
    /// the prefix is discarded and framing resumes behind it. `None`
    /// until a complete frame is available.
    pub fn read_with_length(&self) -> Option<Vec<u8>> {
        let mut input = self.lock_input();
        for attempt in 0..2 {
            if attempt > 0 {
                self.refill_locked(&mut input);
            }
            loop {
                if input.buf.len() < 4 {
                    break;
                }
                let mut prefix = [0u8; 4];
                prefix.copy_from_slice(&input.buf.as_slice()[..4]);
                let length = i32::from_be_bytes(prefix);
                if length < 0 {
                    warn!("negative frame length on fd {}, skipping prefix", self.fd);
                    metrics::CORRUPT_PREFIXES.increment();
                    input.buf.consume(4);
                    continue;
                }
                let length = length as usize;
                if input.buf.len() - 4 < length {
                    break;
                }
                input.buf.consume(4);
                metrics::FRAMES_READ.increment();
                return Some(input.buf.take(length));
            }
        }
        None
    }

    /// Return the next `[start_mark .. end_mark]` packet, inclusive of
    /// both marks. Bytes before the start mark are discarded; with no
    /// start mark in sight the whole buffer is discarded. `None` until a
    /// complete packet is available.
    pub fn read_packet(&self, start_mark: u8, end_mark: u8) -> Option<Vec<u8>> {
        let mut input = self.lock_input();
        for attempt in 0..2 {
            if attempt > 0 {
                self.refill_locked(&mut input);
            }

            match input.buf.find(start_mark, 0) {
                None => {
                    let n = input.buf.len();
                    input.buf.consume(n);
                    continue;
                }
                Some(pos) => input.buf.consume(pos),
            }

            if let Some(end) = input.buf.find(end_mark, 0) {
                metrics::FRAMES_READ.increment();
                return Some(input.buf.take(end + 1));
            }
        }
        None
    }

    // Polling integration

    /// Attach the connection to `set`. Initial interest is readable
    /// (unless the read side is already terminal) plus writable when
    /// output is buffered. `callback` runs on the poller thread after
    /// each refill. Registering again with the same set just replaces the
    /// callback; a different set is an error.
    pub fn register<F>(&self, set: &FdSet, callback: F) -> Result<(), Error>
    where
        F: Fn(&Arc<Connection>) + Send + Sync + 'static,
    {
        let mut out = self.lock_output();
        let mut input = self.lock_input();
        let mut registration = self.registration.lock();

        match registration.as_mut() {
            Some(existing) if existing.fdset.same_set(&set.handle()) => {
                existing.callback = Arc::new(callback);
                Ok(())
            }
            Some(_) => Err(Error::AlreadyRegistered),
            None => {
                let mut events = Readiness::NONE;
                if !input.eof && !input.error {
                    events |= Readiness::READABLE;
                }
                if !out.buf.is_empty() {
                    events |= Readiness::WRITABLE;
                }

                let weak = self.weak.clone();
                set.register(self.fd, events, move |fd, revents| {
                    if let Some(conn) = weak.upgrade() {
                        conn.poll_callback(fd, revents);
                    }
                })
                .map_err(|e| match e {
                    fdset::Error::AlreadyRegistered => Error::AlreadyRegistered,
                    fdset::Error::Io(e) => Error::Io(e),
                })?;

                input.listening_pollin = events.readable();
                out.listening_pollout = events.writable();
                *registration = Some(Registration {
                    fdset: set.handle(),
                    callback: Arc::new(callback),
                });
                Ok(())
            }
        }
    }

    /// Detach from the fdset. Quiesces against an in-flight poll
    /// callback, so the connection may be dropped right afterwards.
    pub fn unregister(&self) {
        let registration = {
            let mut out = self.lock_output();
            let mut input = self.lock_input();
            let mut registration = self.registration.lock();
            input.listening_pollin = false;
            out.listening_pollout = false;
            registration.take()
        };
        // Quiesce outside the connection locks so an in-flight poll
        // callback can still take them to finish.
        if let Some(registration) = registration {
            registration.fdset.unregister(self.fd);
        }
    }

    /// Drive an unregistered connection: drain pending output, then
    /// block until the socket is ready in whichever direction matters,
    /// dispatching the readiness internally.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<Wait, Error> {
        let mut out = self.lock_output();
        let written = self.drain_locked(&mut out)?;
        if written > 0 {
            // We did something useful; no need to poll.
            return Ok(Wait::Progress);
        }

        let mut events = Readiness::NONE;
        if !out.buf.is_empty() {
            events |= Readiness::WRITABLE;
        }
        drop(out);

        {
            let input = self.lock_input();
            // Always poll for reading, unless the read side is finished
            // and there is something else to wait for.
            if (!input.eof && !input.error) || events.is_empty() {
                events |= Readiness::READABLE;
            }
        }

        let revents = match sys::poll_fd(self.fd, events, timeout) {
            Ok(revents) => revents,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(Wait::Progress),
            Err(e) => {
                error!("wait: poll failed on fd {}: {e}", self.fd);
                return Err(e.into());
            }
        };

        if revents.is_empty() {
            return Ok(Wait::TimedOut);
        }
        if revents.invalid() {
            error!("wait: fd {} not open", self.fd);
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::NotFound,
                "descriptor not open",
            )));
        }
        if revents.error() || revents.hangup() {
            // Read so the specific error lands in the sticky flags. It
            // may have cleared while we were unlocked; the refill copes.
            let mut input = self.lock_input();
            self.refill_locked(&mut input);
            return Err(Error::Io(io::Error::other(
                "socket error reported by poll",
            )));
        }

        if revents.writable() {
            let mut out = self.lock_output();
            let _ = self.drain_locked(&mut out);
        }
        // We polled for reading, so read here; otherwise a caller that
        // loops on wait without reading would spin on the same readiness.
        if revents.readable() {
            let mut input = self.lock_input();
            self.refill_locked(&mut input);
        }

        Ok(Wait::Progress)
    }

    /// Dispatch poller readiness: drain output, refill input, then hand
    /// the new input to the user callback.
    fn poll_callback(&self, fd: RawFd, revents: Readiness) {
        if self.fd != fd {
            error!(
                "poll callback for fd {fd} reached connection on fd {}",
                self.fd
            );
            return;
        }

        if revents.writable() {
            // A full drain turns POLLOUT interest back off by itself.
            let mut out = self.lock_output();
            let _ = self.drain_locked(&mut out);
        }

        if revents.readable() || revents.hangup() || revents.error() {
            {
                // EOF or error in the refill turns POLLIN interest off.
                let mut input = self.lock_input();
                self.refill_locked(&mut input);
            }
            let callback = self
                .registration
                .lock()
                .as_ref()
                .map(|registration| registration.callback.clone());
            if let Some(callback) = callback
                && let Some(conn) = self.weak.upgrade()
            {
                callback(&conn);
            }
        }
    }

    // Internal I/O

    /// One non-blocking send of everything buffered. Advances the
    /// buffer, reclaims the consumed prefix once it outgrows the unsent
    /// remainder, and keeps POLLOUT interest in step with buffered bytes.
    /// Returns the byte count actually written.
    fn drain_locked(&self, out: &mut Output) -> io::Result<usize> {
        let written = if out.buf.is_empty() {
            0
        } else {
            match sys::send(self.fd, out.buf.as_slice()) {
                Ok(n) => n,
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
                    ) =>
                {
                    0
                }
                Err(e) => {
                    error!("write error on fd {}: {e}", self.fd);
                    return Err(e);
                }
            }
        };

        if written > 0 {
            out.buf.consume(written);
            metrics::TX_BYTES.add(written as u64);
        }
        if out.buf.consumed() > out.buf.total() / 2 {
            out.buf.compact();
        }

        let keep_pollout = !out.buf.is_empty();
        self.update_pollout(out, keep_pollout);
        Ok(written)
    }

    /// Drain once the buffering threshold is met.
    fn try_drain_locked(&self, out: &mut Output) -> io::Result<Progress> {
        let len = out.buf.len();
        if len == 0 {
            return Ok(Progress::Complete);
        }
        if (len as u64) < u64::from(out.buffering) {
            return Ok(Progress::Pending);
        }
        self.drain_locked(out)?;
        if out.buf.is_empty() {
            Ok(Progress::Complete)
        } else {
            Ok(Progress::Pending)
        }
    }

    /// One non-blocking read of up to [`READ_CHUNK`] bytes into the
    /// input buffer, reclaiming the consumed prefix first. Transient
    /// failures return silently; EOF and real errors set the sticky
    /// flags and turn POLLIN interest off.
    fn refill_locked(&self, input: &mut Input) {
        input.buf.compact();

        let mut chunk = [0u8; READ_CHUNK];
        match sys::read(self.fd, &mut chunk) {
            Ok(0) => {
                input.eof = true;
                self.update_pollin(input, false);
            }
            Ok(n) => {
                metrics::RX_BYTES.add(n as u64);
                input.buf.append(&chunk[..n]);
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
                ) => {}
            Err(e) => {
                error!("read error on fd {}: {e}", self.fd);
                input.error = true;
                self.update_pollin(input, false);
            }
        }
    }

    /// Flip POLLIN interest, but only on a state change; interest
    /// updates can be expensive for the poller.
    fn update_pollin(&self, input: &mut Input, on: bool) {
        let registration = self.registration.lock();
        let Some(registration) = registration.as_ref() else {
            return;
        };
        if on && !input.listening_pollin {
            input.listening_pollin = true;
            registration
                .fdset
                .listen(self.fd, Readiness::READABLE, Readiness::READABLE);
        } else if !on && input.listening_pollin {
            input.listening_pollin = false;
            registration
                .fdset
                .listen(self.fd, Readiness::READABLE, Readiness::NONE);
        }
    }

    /// Flip POLLOUT interest, but only on a state change.
    fn update_pollout(&self, out: &mut Output, on: bool) {
        let registration = self.registration.lock();
        let Some(registration) = registration.as_ref() else {
            return;
        };
        if on && !out.listening_pollout {
            out.listening_pollout = true;
            registration
                .fdset
                .listen(self.fd, Readiness::WRITABLE, Readiness::WRITABLE);
        } else if !on && out.listening_pollout {
            out.listening_pollout = false;
            registration
                .fdset
                .listen(self.fd, Readiness::WRITABLE, Readiness::NONE);
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        // Teardown may run on whichever thread drops the last handle;
        // the claim no longer applies.
        self.claimed.store(false, Ordering::Release);
        self.unregister();

        {
            // Best-effort attempt to get remaining output out the door.
            let mut out = self.output.lock();
            if !out.buf.is_empty()
                && let Err(e) = self.drain_locked(&mut out)
            {
                error!("closing fd {}: discarding unwritten output: {e}", self.fd);
            }
        }

        if unsafe { libc::close(self.fd) } < 0 {
            error!("closing fd {}: {}", self.fd, io::Error::last_os_error());
        }
    }
}
