//! Poll-style backend: `poll(2)`, the lowest common denominator multiplexer.
//! Used on any POSIX target without a more specific backend, and as the
//! reference implementation new backends are checked against.

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::error::{NetError, Result};
use crate::reactor::backend::{Backend, ReadyEvent};
use crate::types::Interest;

pub struct PollBackend {
    /// fd -> index into `fds`, kept so `modify`/`unregister` don't need a
    /// linear scan.
    index: HashMap<RawFd, usize>,
    fds: Vec<libc::pollfd>,
}

impl PollBackend {
    pub fn new() -> Result<Self> {
        Ok(Self {
            index: HashMap::new(),
            fds: Vec::new(),
        })
    }

    fn events_for(interest: Interest) -> i16 {
        let mut events = 0;
        if interest.wants_read() {
            events |= libc::POLLIN;
        }
        if interest.wants_write() {
            events |= libc::POLLOUT;
        }
        events as i16
    }
}

impl Backend for PollBackend {
    fn register(&mut self, fd: RawFd, interest: Interest) -> Result<()> {
        if self.index.contains_key(&fd) {
            return self.modify(fd, interest);
        }
        let idx = self.fds.len();
        self.fds.push(libc::pollfd {
            fd,
            events: Self::events_for(interest),
            revents: 0,
        });
        self.index.insert(fd, idx);
        Ok(())
    }

    fn modify(&mut self, fd: RawFd, interest: Interest) -> Result<()> {
        let idx = *self
            .index
            .get(&fd)
            .ok_or_else(|| NetError::Registration {
                fd,
                reason: "fd not registered".into(),
            })?;
        self.fds[idx].events = Self::events_for(interest);
        Ok(())
    }

    fn unregister(&mut self, fd: RawFd) -> Result<()> {
        if let Some(idx) = self.index.remove(&fd) {
            self.fds.swap_remove(idx);
            // swap_remove moved the last element into `idx`; fix its index.
            if idx < self.fds.len() {
                self.index.insert(self.fds[idx].fd, idx);
            }
        }
        Ok(())
    }

    fn wait(&mut self, timeout: Option<Duration>) -> Result<Vec<ReadyEvent>> {
        let timeout_ms = match timeout {
            Some(d) => d.as_millis().min(i64::MAX as u128) as libc::c_int,
            None => -1,
        };
        // SAFETY: self.fds is a valid, correctly-sized pollfd array for the
        // duration of this call.
        let rc = unsafe {
            libc::poll(
                self.fds.as_mut_ptr(),
                self.fds.len() as libc::nfds_t,
                timeout_ms,
            )
        };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                return Ok(Vec::new());
            }
            return Err(err.into());
        }
        let mut ready = Vec::with_capacity(rc.max(0) as usize);
        for pfd in &self.fds {
            if pfd.revents == 0 {
                continue;
            }
            ready.push(ReadyEvent {
                fd: pfd.fd,
                readable: pfd.revents & libc::POLLIN != 0,
                writable: pfd.revents & libc::POLLOUT != 0,
                closed: pfd.revents & (libc::POLLHUP | libc::POLLERR | libc::POLLNVAL) != 0,
            });
        }
        Ok(ready)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EventKind, Mode};

    #[test]
    fn register_modify_unregister() {
        let mut fds = [0_i32; 2];
        // SAFETY: fds is a valid two-element out-array for `pipe(2)`.
        unsafe {
            assert_eq!(libc::pipe(fds.as_mut_ptr()), 0);
        }
        let (r, w) = (fds[0], fds[1]);
        let mut backend = PollBackend::new().unwrap();
        let interest = Interest::none().set(EventKind::Read, Mode::Enabled);
        backend.register(r, interest).unwrap();
        backend.modify(r, Interest::none()).unwrap();
        backend.unregister(r).unwrap();
        // SAFETY: closing fds owned by this test.
        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }
}
