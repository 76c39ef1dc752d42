//! Cross-thread wake primitive backing `Reactor::kick()` — the one method
//! permitted off the owner thread.
//!
//! A self-pipe — write a byte to interrupt a blocked `select()`/`poll()` —
//! is the standard `mio::Waker`-free wakeup primitive; implemented directly
//! here since this crate's backends are raw `libc` multiplexers, not `mio`.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};

/// A pipe pair any thread may write to, safely, to interrupt the owner
/// thread's blocking `wait()` call.
#[derive(Debug)]
pub struct WakePipe {
    pub read_fd: RawFd,
    write_fd: RawFd,
    /// Set by `kick()`, cleared by the owner thread after observing it.
    /// Coalesces multiple concurrent `kick()` calls into one restart:
    /// concurrent callers are safe and harmless, the worker wakes once.
    pub requested: AtomicBool,
}

impl WakePipe {
    pub fn new() -> io::Result<Self> {
        let mut fds = [0_i32; 2];
        // SAFETY: fds is a valid two-element out-array for `pipe(2)`.
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        for fd in fds {
            // SAFETY: fd was just created above and is open.
            unsafe {
                let flags = libc::fcntl(fd, libc::F_GETFL, 0);
                libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
            }
        }
        Ok(Self {
            read_fd: fds[0],
            write_fd: fds[1],
            requested: AtomicBool::new(false),
        })
    }

    /// Thread-safe: writes one byte and sets the request flag. Safe to call
    /// from any thread, any number of times, concurrently.
    pub fn wake(&self) {
        self.requested.store(true, Ordering::Release);
        let byte: u8 = 1;
        // SAFETY: write_fd is valid for the lifetime of this struct; a
        // single-byte pipe write is atomic.
        unsafe {
            libc::write(
                self.write_fd,
                std::ptr::addr_of!(byte).cast::<libc::c_void>(),
                1,
            );
        }
    }

    /// Drains pending wake bytes and clears the request flag, returning
    /// whether a kick had actually been requested.
    pub fn drain_and_take(&self) -> bool {
        let mut buf = [0_u8; 64];
        loop {
            // SAFETY: buf is a valid, correctly-sized read buffer.
            let n = unsafe {
                libc::read(
                    self.read_fd,
                    buf.as_mut_ptr().cast::<libc::c_void>(),
                    buf.len(),
                )
            };
            if n <= 0 || (n as usize) < buf.len() {
                break;
            }
        }
        self.requested.swap(false, Ordering::AcqRel)
    }
}

impl Drop for WakePipe {
    fn drop(&mut self) {
        // SAFETY: both fds are owned exclusively by this struct.
        unsafe {
            libc::close(self.read_fd);
            libc::close(self.write_fd);
        }
    }
}

// SAFETY: all mutable state is either atomic (`requested`) or a raw fd used
// only through `write`/`read` syscalls, both of which are safe to issue
// concurrently from multiple threads on the same fd.
unsafe impl Sync for WakePipe {}
