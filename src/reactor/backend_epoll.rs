//! Linux `epoll` backend.

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::error::{NetError, Result};
use crate::reactor::backend::{Backend, ReadyEvent};
use crate::types::Interest;

pub struct EpollBackend {
    epfd: RawFd,
    /// Tracked only so `modify`/`unregister` can distinguish "not
    /// registered" from a kernel error, matching `PollBackend`'s contract.
    registered: HashMap<RawFd, ()>,
}

impl EpollBackend {
    pub fn new() -> Result<Self> {
        // SAFETY: epoll_create1 with a constant flag; the returned fd is
        // checked below.
        let epfd = unsafe { libc::epoll_create1(0) };
        if epfd < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(Self {
            epfd,
            registered: HashMap::new(),
        })
    }

    fn events_for(interest: Interest) -> u32 {
        let mut events = 0_u32;
        if interest.wants_read() {
            events |= libc::EPOLLIN as u32;
        }
        if interest.wants_write() {
            events |= libc::EPOLLOUT as u32;
        }
        events
    }

    fn ctl(&self, op: i32, fd: RawFd, interest: Interest) -> Result<()> {
        let mut ev = libc::epoll_event {
            events: Self::events_for(interest),
            u64: fd as u64,
        };
        // SAFETY: ev is a stack-local, correctly-sized epoll_event; we
        // store the fd itself (not a pointer) as the token.
        let rc = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if rc < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(())
    }
}

impl Backend for EpollBackend {
    fn register(&mut self, fd: RawFd, interest: Interest) -> Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, interest)?;
        self.registered.insert(fd, ());
        Ok(())
    }

    fn modify(&mut self, fd: RawFd, interest: Interest) -> Result<()> {
        if !self.registered.contains_key(&fd) {
            return Err(NetError::Registration {
                fd,
                reason: "fd not registered".into(),
            });
        }
        self.ctl(libc::EPOLL_CTL_MOD, fd, interest)
    }

    fn unregister(&mut self, fd: RawFd) -> Result<()> {
        if self.registered.remove(&fd).is_some() {
            // SAFETY: epoll_ctl DEL ignores the event pointer on Linux
            // >= 2.6.9, but older kernels require a non-null pointer; pass
            // a valid zeroed one for portability.
            let mut ev: libc::epoll_event = unsafe { std::mem::zeroed() };
            // SAFETY: ev is a valid, stack-local epoll_event.
            unsafe {
                libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, &mut ev);
            }
        }
        Ok(())
    }

    fn wait(&mut self, timeout: Option<Duration>) -> Result<Vec<ReadyEvent>> {
        let timeout_ms = match timeout {
            Some(d) => d.as_millis().min(i32::MAX as u128) as i32,
            None => -1,
        };
        let mut events: Vec<libc::epoll_event> = vec![unsafe { std::mem::zeroed() }; 256];
        // SAFETY: events is a valid, correctly-sized out-array.
        let n = unsafe {
            libc::epoll_wait(
                self.epfd,
                events.as_mut_ptr(),
                events.len() as i32,
                timeout_ms,
            )
        };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                return Ok(Vec::new());
            }
            return Err(err.into());
        }
        let mut ready = Vec::with_capacity(n as usize);
        for ev in events.iter().take(n as usize) {
            let fd = ev.u64 as RawFd;
            let bits = ev.events;
            ready.push(ReadyEvent {
                fd,
                readable: bits & libc::EPOLLIN as u32 != 0,
                writable: bits & libc::EPOLLOUT as u32 != 0,
                closed: bits & (libc::EPOLLHUP as u32 | libc::EPOLLERR as u32) != 0,
            });
        }
        Ok(ready)
    }
}

impl Drop for EpollBackend {
    fn drop(&mut self) {
        // SAFETY: epfd is owned exclusively by this struct.
        unsafe {
            libc::close(self.epfd);
        }
    }
}

/// Creates a Linux `timerfd` armed for `delay`, optionally repeating.
/// The Reactor reads 8 bytes of fire count on each wake-up.
pub fn create_timerfd(delay: Duration, repeating: bool) -> Result<RawFd> {
    // SAFETY: constant, validated arguments.
    let fd = unsafe { libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_NONBLOCK) };
    if fd < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    let interval = if repeating { delay } else { Duration::ZERO };
    let spec = libc::itimerspec {
        it_interval: libc::timespec {
            tv_sec: interval.as_secs() as libc::time_t,
            tv_nsec: interval.subsec_nanos() as libc::c_long,
        },
        it_value: libc::timespec {
            tv_sec: delay.as_secs() as libc::time_t,
            tv_nsec: delay.subsec_nanos() as libc::c_long,
        },
    };
    // SAFETY: spec is a stack-local, correctly-sized itimerspec; old_spec
    // (null) is allowed by timerfd_settime.
    let rc = unsafe {
        libc::timerfd_settime(fd, 0, &spec, std::ptr::null_mut())
    };
    if rc < 0 {
        let err = std::io::Error::last_os_error();
        // SAFETY: fd was just created above.
        unsafe {
            libc::close(fd);
        }
        return Err(err.into());
    }
    Ok(fd)
}

/// Reads and sums the 8-byte fire count from a `timerfd`. Returns 0 (not an
/// error) when the fd would block, i.e. no expiry is pending yet.
pub fn drain_timerfd(fd: RawFd) -> usize {
    let mut count: u64 = 0;
    // SAFETY: count is a valid 8-byte out-buffer, the exact size a timerfd
    // read requires.
    let n = unsafe {
        libc::read(
            fd,
            std::ptr::addr_of_mut!(count).cast::<libc::c_void>(),
            std::mem::size_of::<u64>(),
        )
    };
    if n == std::mem::size_of::<u64>() as isize {
        count as usize
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timerfd_fires() {
        let fd = create_timerfd(Duration::from_millis(20), false).unwrap();
        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(drain_timerfd(fd), 1);
        // SAFETY: fd owned by this test.
        unsafe {
            libc::close(fd);
        }
    }

    #[test]
    fn register_and_wait_on_pipe() {
        let mut fds = [0_i32; 2];
        // SAFETY: fds is a valid two-element out-array for `pipe(2)`.
        unsafe {
            assert_eq!(libc::pipe(fds.as_mut_ptr()), 0);
        }
        let (r, w) = (fds[0], fds[1]);
        let mut backend = EpollBackend::new().unwrap();
        let interest = crate::types::Interest::none()
            .set(crate::types::EventKind::Read, crate::types::Mode::Enabled);
        backend.register(r, interest).unwrap();
        let byte = [1_u8];
        // SAFETY: byte is a valid 1-byte buffer; w is open.
        unsafe {
            libc::write(w, byte.as_ptr().cast(), 1);
        }
        let ready = backend.wait(Some(Duration::from_millis(200))).unwrap();
        assert_eq!(ready.len(), 1);
        assert!(ready[0].readable);
        // SAFETY: fds owned by this test.
        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }
}
