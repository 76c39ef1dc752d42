//! Timer Wheel: converts a logical `(delay_ns, repeating)` request into a
//! descriptor-bearing object the Reactor can wait on.
//!
//! Three realizations exist, one per backend family:
//! - [`crate::reactor::backend_epoll`]: a native `timerfd`.
//! - [`crate::reactor::backend_kqueue`]: the kernel's own `EVFILT_TIMER`
//!   filter, keyed by a synthetic fd for uniformity (no real descriptor).
//! - The poll-style and event-ports backends (this module):
//!   [`SelfPipeTimer`], a pipe pair plus a worker thread that sleeps and
//!   writes one byte per expiry.
//!
//! A self-pipe timer is just another pollable fd from the Reactor's point of
//! view, the same treatment a `signalfd`/`signal-hook` source would get.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::error::Result;

/// Allocates process-wide-unique identifiers for synthetic timer sources
/// (kqueue `EVFILT_TIMER` idents, event-ports `PORT_SOURCE_USER` events).
///
/// Avoids a collision that a hard-coded user id `1` for every timer on the
/// event-ports backend would cause when more than one timer is active.
/// Each timer here gets a unique id instead.
static NEXT_SYNTHETIC_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_synthetic_id() -> u64 {
    NEXT_SYNTHETIC_ID.fetch_add(1, Ordering::Relaxed)
}

fn make_pipe() -> io::Result<(RawFd, RawFd)> {
    let mut fds = [0_i32; 2];
    // SAFETY: `fds` is a valid two-element out-array for `pipe(2)`.
    let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    for fd in fds {
        // SAFETY: fd was just created by this call and is open.
        unsafe {
            let flags = libc::fcntl(fd, libc::F_GETFL, 0);
            libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
        }
    }
    Ok((fds[0], fds[1]))
}

/// A timer realized as a self-pipe plus a dedicated sleeper thread.
///
/// The read end (`read_fd`) is what callers register for `Read` interest
/// with the Reactor; one byte arrives per expiry, possibly coalesced if the
/// Reactor was slow to drain the pipe. The `timerfd` realization reads an
/// 8-byte fire count; this self-pipe realization instead drains and counts
/// bytes.
#[derive(Debug)]
pub struct SelfPipeTimer {
    pub read_fd: RawFd,
    write_fd: RawFd,
    cancelled: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl SelfPipeTimer {
    /// The write end, kept open by the sleeper thread; reactor bookkeeping
    /// tracks it as a partner fd so phantom-fd cleanup doesn't close it if
    /// it ever turns up in a ready set under some other backend's oddities.
    #[must_use]
    pub fn write_fd(&self) -> RawFd {
        self.write_fd
    }

    /// Spawns the sleeper thread and returns the armed timer. `delay` must
    /// be nonzero — timer entries with `delay_ns == 0` are forbidden,
    /// enforced by the caller, `Reactor::add`.
    pub fn arm(delay: Duration, repeating: bool) -> Result<Self> {
        let (read_fd, write_fd) = make_pipe()?;
        let cancelled = Arc::new(AtomicBool::new(false));
        let thread_cancelled = Arc::clone(&cancelled);
        let handle = thread::Builder::new()
            .name("netcore-timer".into())
            .spawn(move || loop {
                thread::sleep(delay);
                if thread_cancelled.load(Ordering::Acquire) {
                    return;
                }
                // SAFETY: write_fd is valid for the thread's lifetime; a
                // single byte write to a pipe is atomic and cannot block
                // the reactor's owner thread since it happens here, not
                // there.
                let byte: u8 = 1;
                unsafe {
                    libc::write(
                        write_fd,
                        std::ptr::addr_of!(byte).cast::<libc::c_void>(),
                        1,
                    );
                }
                if !repeating {
                    return;
                }
            })
            .map_err(io::Error::from)?;
        Ok(Self {
            read_fd,
            write_fd,
            cancelled,
            handle: Some(handle),
        })
    }

    /// Drains all pending wake bytes, returning how many expiries were
    /// coalesced into this wakeup.
    pub fn drain(&self) -> usize {
        let mut buf = [0_u8; 256];
        let mut total = 0;
        loop {
            // SAFETY: buf is a valid, correctly-sized read buffer.
            let n = unsafe {
                libc::read(
                    self.read_fd,
                    buf.as_mut_ptr().cast::<libc::c_void>(),
                    buf.len(),
                )
            };
            if n <= 0 {
                break;
            }
            total += n as usize;
            if (n as usize) < buf.len() {
                break;
            }
        }
        total
    }

    /// Cancels the timer. Already-fired-but-undrained bytes are discarded
    /// along with the pipe; a cancelled timer must never fire again, which
    /// this guarantees because the fds are closed before the caller can
    /// observe any further callback.
    pub fn cancel(mut self) {
        self.cancelled.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            // The sleeper thread wakes up to find `cancelled` set and
            // exits; we don't block waiting for it so `cancel()` returns
            // promptly from the Reactor's owner thread.
            drop(handle);
        }
    }
}

impl Drop for SelfPipeTimer {
    fn drop(&mut self) {
        self.cancelled.store(true, Ordering::Release);
        // SAFETY: both fds are owned by this struct and not used again
        // after drop.
        unsafe {
            libc::close(self.read_fd);
            libc::close(self.write_fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthetic_ids_are_unique() {
        let a = next_synthetic_id();
        let b = next_synthetic_id();
        assert_ne!(a, b);
    }

    #[test]
    fn self_pipe_timer_fires_once() {
        let timer = SelfPipeTimer::arm(Duration::from_millis(20), false).unwrap();
        std::thread::sleep(Duration::from_millis(80));
        let n = timer.drain();
        assert_eq!(n, 1);
    }

    #[test]
    fn self_pipe_timer_repeats() {
        let timer = SelfPipeTimer::arm(Duration::from_millis(15), true).unwrap();
        std::thread::sleep(Duration::from_millis(90));
        let n = timer.drain();
        assert!(n >= 3, "expected >=3 fires, got {n}");
        timer.cancel();
    }
}
