//! Thin libc wrappers for the non-blocking I/O paths.

use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use fdset::Readiness;

/// Switch a descriptor to non-blocking mode.
pub(crate) fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Non-blocking send. MSG_NOSIGNAL keeps a dead peer from raising
/// SIGPIPE; the EPIPE comes back as an ordinary error instead.
pub(crate) fn send(fd: RawFd, bytes: &[u8]) -> io::Result<usize> {
    let n = unsafe {
        libc::send(
            fd,
            bytes.as_ptr() as *const libc::c_void,
            bytes.len(),
            libc::MSG_NOSIGNAL,
        )
    };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

/// Non-blocking read into `buf`.
pub(crate) fn read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

/// Block until `fd` reports one of `events` or the timeout passes.
/// `None` waits indefinitely. Returns the reported readiness;
/// [`Readiness::NONE`] means the poll timed out.
pub(crate) fn poll_fd(fd: RawFd, events: Readiness, timeout: Option<Duration>) -> io::Result<Readiness> {
    let mut pfd = libc::pollfd {
        fd,
        events: events.raw(),
        revents: 0,
    };
    let timeout_ms = match timeout {
        None => -1,
        Some(d) => d.as_millis().min(i32::MAX as u128) as i32,
    };
    let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    if rc == 0 {
        return Ok(Readiness::NONE);
    }
    Ok(Readiness::from_raw(pfd.revents))
}
