//! Deadline-bound raw socket reads and gathered writes.
//!
//! Adapted from the fd-ownership pattern used for the kernel communication
//! channel this crate's ancestor spoke over: a small `Drop`-closing wrapper
//! around a raw descriptor, with reads and writes expressed as direct
//! `libc` calls rather than routed through `std::net::TcpStream`'s buffered
//! API. Kept here because deadlines and `writev` gather both need the raw
//! fd.

use std::io;
use std::net::TcpStream;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::{Duration, Instant};

use libc::{c_int, c_void, size_t};
use log::warn;
use smallvec::SmallVec;

/// Polls `fd` for readability/writability with the given timeout.
///
/// Returns `Ok(true)` if the fd became ready, `Ok(false)` on timeout.
fn poll_ready(fd: RawFd, events: i16, timeout: Duration) -> io::Result<bool> {
    let mut pfd = libc::pollfd {
        fd,
        events,
        revents: 0,
    };
    let millis = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
    let rc = unsafe { libc::poll(&mut pfd, 1, millis) };
    if rc < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(false);
        }
        return Err(err);
    }
    Ok(rc > 0)
}

/// Reads up to `buf.len()` bytes, blocking for at most `timeout`.
///
/// Returns `Ok(0)` only on a genuine timeout (distinguished from EOF by
/// the caller, which knows whether a read of exactly zero length was
/// expected); an orderly peer close surfaces as `Ok(0)` from the raw
/// `read(2)` too, matching normal socket semantics.
pub fn read_with_deadline(
    stream: &TcpStream,
    buf: &mut [u8],
    deadline: Instant,
) -> io::Result<ReadOutcome> {
    loop {
        let now = Instant::now();
        if now >= deadline {
            return Ok(ReadOutcome::TimedOut);
        }
        if !poll_ready(stream.as_raw_fd(), libc::POLLIN, deadline - now)? {
            return Ok(ReadOutcome::TimedOut);
        }
        let rc = unsafe {
            libc::read(
                stream.as_raw_fd(),
                buf.as_mut_ptr() as *mut c_void,
                buf.len() as size_t,
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            warn!("read(2) failed on wire socket: {err}");
            return Err(err);
        }
        return Ok(ReadOutcome::Read(rc as usize));
    }
}

pub enum ReadOutcome {
    Read(usize),
    TimedOut,
}

/// Writes every byte of every slice in `chunks` via a single gathered
/// `writev(2)` call where possible, retrying on partial writes and
/// `EINTR`.
pub fn write_all_vectored(stream: &TcpStream, chunks: &[&[u8]]) -> io::Result<()> {
    let mut remaining: SmallVec<[&[u8]; 4]> = chunks.iter().copied().filter(|c| !c.is_empty()).collect();
    while !remaining.is_empty() {
        let iovecs: SmallVec<[libc::iovec; 4]> = remaining
            .iter()
            .map(|c| libc::iovec {
                iov_base: c.as_ptr() as *mut c_void,
                iov_len: c.len(),
            })
            .collect();
        let rc = unsafe {
            libc::writev(
                stream.as_raw_fd(),
                iovecs.as_ptr(),
                iovecs.len() as c_int,
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            warn!("writev(2) failed on wire socket: {err}");
            return Err(err);
        }
        let mut written = rc as usize;
        while written > 0 {
            let head_len = remaining[0].len();
            if written < head_len {
                remaining[0] = &remaining[0][written..];
                written = 0;
            } else {
                written -= head_len;
                remaining.remove(0);
            }
        }
    }
    Ok(())
}

/// Non-blocking one-byte peek used to detect a peer-initiated half-close
/// before issuing the next verb on a connection we believe is still open.
pub fn peer_closed(stream: &TcpStream) -> bool {
    let mut byte = [0u8; 1];
    let rc = unsafe {
        libc::recv(
            stream.as_raw_fd(),
            byte.as_mut_ptr() as *mut c_void,
            1,
            libc::MSG_PEEK | libc::MSG_DONTWAIT,
        )
    };
    // A zero-length read means the peer sent FIN; a real error other than
    // "would block" is treated conservatively as "not yet known to be
    // closed" so the caller falls through to its normal I/O path and
    // surfaces any genuine error there.
    rc == 0
}
