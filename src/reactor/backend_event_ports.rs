//! illumos/Solaris event-ports backend (`port_create`/`port_associate`/
//! `port_getn`).
//!
//! Event ports are edge-once: a successful `port_get` automatically
//! disassociates the fd, so every fd must be re-associated after each
//! event it produces. `register`/`modify` always compute the *combined*
//! read+write bitmask and issue a single `port_associate` call for both,
//! rather than one call per interest bit, so a POLLIN and a POLLOUT change
//! arriving together can never race into two separate re-associate calls
//! that interleave with a `port_get` on another thread.
//!
//! Timer support here uses the self-pipe realization
//! ([`crate::timer::SelfPipeTimer`]), not a native event-ports timer source.

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::error::Result;
use crate::reactor::backend::{Backend, ReadyEvent};
use crate::types::Interest;

const PORT_SOURCE_FD: u16 = 4;

pub struct EventPortsBackend {
    port: RawFd,
    /// Last-associated interest per fd, needed to re-associate after each
    /// one-shot delivery even when the caller doesn't call `modify` again.
    registered: HashMap<RawFd, Interest>,
}

impl EventPortsBackend {
    pub fn new() -> Result<Self> {
        // SAFETY: no arguments to validate.
        let port = unsafe { libc::port_create() };
        if port < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(Self {
            port,
            registered: HashMap::new(),
        })
    }

    fn events_for(interest: Interest) -> i32 {
        let mut events = 0;
        if interest.wants_read() {
            events |= libc::POLLIN;
        }
        if interest.wants_write() {
            events |= libc::POLLOUT;
        }
        events
    }

    fn associate(&self, fd: RawFd, interest: Interest) -> Result<()> {
        let events = Self::events_for(interest);
        // SAFETY: fd is a valid, open descriptor owned by the caller; the
        // user pointer is unused — events are keyed by `portev_object`, the
        // fd itself, never a passed-through pointer.
        let rc = unsafe {
            libc::port_associate(
                self.port,
                PORT_SOURCE_FD as i32,
                fd as usize,
                events,
                std::ptr::null_mut(),
            )
        };
        if rc < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(())
    }
}

impl Backend for EventPortsBackend {
    fn register(&mut self, fd: RawFd, interest: Interest) -> Result<()> {
        self.associate(fd, interest)?;
        self.registered.insert(fd, interest);
        Ok(())
    }

    fn modify(&mut self, fd: RawFd, interest: Interest) -> Result<()> {
        self.associate(fd, interest)?;
        self.registered.insert(fd, interest);
        Ok(())
    }

    fn unregister(&mut self, fd: RawFd) -> Result<()> {
        if self.registered.remove(&fd).is_some() {
            // SAFETY: fd was previously associated by this struct; a
            // dissociate on an already-fired (and thus already-dissociated)
            // fd returns ENOENT, which we ignore.
            unsafe {
                libc::port_dissociate(self.port, PORT_SOURCE_FD as i32, fd as usize);
            }
        }
        Ok(())
    }

    fn wait(&mut self, timeout: Option<Duration>) -> Result<Vec<ReadyEvent>> {
        let mut ts = timeout.map(|d| libc::timespec {
            tv_sec: d.as_secs() as libc::time_t,
            tv_nsec: d.subsec_nanos() as libc::c_long,
        });
        let ts_ptr = ts
            .as_mut()
            .map_or(std::ptr::null_mut(), |t| t as *mut libc::timespec);
        let mut events: Vec<libc::port_event> = vec![
            libc::port_event {
                portev_events: 0,
                portev_source: 0,
                portev_pad: 0,
                portev_object: 0,
                portev_user: std::ptr::null_mut(),
            };
            256
        ];
        let mut nget: u32 = 1;
        // SAFETY: events is a valid, correctly-sized out-array; nget is a
        // valid in/out count initialized to request at least one event.
        let rc = unsafe {
            libc::port_getn(
                self.port,
                events.as_mut_ptr(),
                events.len() as u32,
                &mut nget,
                ts_ptr,
            )
        };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if matches!(
                err.raw_os_error(),
                Some(libc::ETIME) | Some(libc::EINTR)
            ) {
                // ETIME with nget > 0 still carries partial results.
                if nget == 0 {
                    return Ok(Vec::new());
                }
            } else {
                return Err(err.into());
            }
        }
        let mut ready = Vec::with_capacity(nget as usize);
        for ev in events.iter().take(nget as usize) {
            let fd = ev.portev_object as RawFd;
            let bits = ev.portev_events;
            ready.push(ReadyEvent {
                fd,
                readable: bits & libc::POLLIN != 0,
                writable: bits & libc::POLLOUT != 0,
                closed: bits & (libc::POLLHUP | libc::POLLERR | libc::POLLNVAL) != 0,
            });
            // The fd was implicitly dissociated by port_get; re-associate
            // with its last-known combined interest so a fd that's still
            // wanted for the other direction keeps delivering.
            if let Some(&interest) = self.registered.get(&fd) {
                let _ = self.associate(fd, interest);
            }
        }
        Ok(ready)
    }
}

impl Drop for EventPortsBackend {
    fn drop(&mut self) {
        // SAFETY: port is owned exclusively by this struct.
        unsafe {
            libc::close(self.port);
        }
    }
}
