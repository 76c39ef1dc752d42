//! BSD/macOS `kqueue` backend, including the backend-native timer filter
//! (`EVFILT_TIMER`).

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::error::Result;
use crate::reactor::backend::{Backend, ReadyEvent};
use crate::types::Interest;

pub struct KqueueBackend {
    kq: RawFd,
    /// Last-registered interest per fd, so `modify` can compute which
    /// filters to add/delete (kqueue has no single "modify" call; each
    /// filter is independently added/removed).
    registered: HashMap<RawFd, Interest>,
}

impl KqueueBackend {
    pub fn new() -> Result<Self> {
        // SAFETY: no arguments to validate.
        let kq = unsafe { libc::kqueue() };
        if kq < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(Self {
            kq,
            registered: HashMap::new(),
        })
    }

    fn apply_filter(&self, fd: RawFd, filter: i16, enable: bool) -> Result<()> {
        let flags = if enable {
            libc::EV_ADD | libc::EV_ENABLE
        } else {
            libc::EV_DELETE
        };
        let kev = libc::kevent {
            ident: fd as usize,
            filter,
            flags: flags as u16,
            fflags: 0,
            data: 0,
            udata: std::ptr::null_mut(),
        };
        let changes = [kev];
        // SAFETY: changes is a valid, single-element kevent array; no
        // output array is requested (nevents=0).
        let rc = unsafe {
            libc::kevent(
                self.kq,
                changes.as_ptr(),
                1,
                std::ptr::null_mut(),
                0,
                std::ptr::null(),
            )
        };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            // Deleting a filter that was never added returns ENOENT; that's
            // fine when tearing down an entry whose read/write side was
            // never enabled.
            if !(filter == libc::EVFILT_READ || filter == libc::EVFILT_WRITE)
                || err.raw_os_error() != Some(libc::ENOENT)
                || enable
            {
                return Err(err.into());
            }
        }
        Ok(())
    }

    fn diff_and_apply(&mut self, fd: RawFd, interest: Interest) -> Result<()> {
        let prev = self.registered.get(&fd).copied().unwrap_or(Interest::none());
        if prev.wants_read() != interest.wants_read() {
            self.apply_filter(fd, libc::EVFILT_READ, interest.wants_read())?;
        }
        if prev.wants_write() != interest.wants_write() {
            self.apply_filter(fd, libc::EVFILT_WRITE, interest.wants_write())?;
        }
        self.registered.insert(fd, interest);
        Ok(())
    }
}

impl Backend for KqueueBackend {
    fn register(&mut self, fd: RawFd, interest: Interest) -> Result<()> {
        self.diff_and_apply(fd, interest)
    }

    fn modify(&mut self, fd: RawFd, interest: Interest) -> Result<()> {
        self.diff_and_apply(fd, interest)
    }

    fn unregister(&mut self, fd: RawFd) -> Result<()> {
        if let Some(prev) = self.registered.remove(&fd) {
            if prev.wants_read() {
                self.apply_filter(fd, libc::EVFILT_READ, false)?;
            }
            if prev.wants_write() {
                self.apply_filter(fd, libc::EVFILT_WRITE, false)?;
            }
        }
        Ok(())
    }

    fn wait(&mut self, timeout: Option<Duration>) -> Result<Vec<ReadyEvent>> {
        let ts = timeout.map(|d| libc::timespec {
            tv_sec: d.as_secs() as libc::time_t,
            tv_nsec: d.subsec_nanos() as libc::c_long,
        });
        let mut events: Vec<libc::kevent> = vec![
            libc::kevent {
                ident: 0,
                filter: 0,
                flags: 0,
                fflags: 0,
                data: 0,
                udata: std::ptr::null_mut(),
            };
            256
        ];
        let ts_ptr = ts
            .as_ref()
            .map_or(std::ptr::null(), |t| t as *const libc::timespec);
        // SAFETY: events is a valid, correctly-sized out-array; ts_ptr is
        // either null (block forever) or points to a valid stack timespec.
        let n = unsafe {
            libc::kevent(
                self.kq,
                std::ptr::null(),
                0,
                events.as_mut_ptr(),
                events.len() as i32,
                ts_ptr,
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
            let fd = ev.ident as RawFd;
            let closed = ev.flags & (libc::EV_EOF as u16) != 0
                || ev.flags & (libc::EV_ERROR as u16) != 0;
            ready.push(ReadyEvent {
                fd,
                readable: ev.filter == libc::EVFILT_READ || ev.filter == libc::EVFILT_TIMER,
                writable: ev.filter == libc::EVFILT_WRITE,
                closed,
            });
        }
        Ok(ready)
    }
}

impl Drop for KqueueBackend {
    fn drop(&mut self) {
        // SAFETY: kq is owned exclusively by this struct.
        unsafe {
            libc::close(self.kq);
        }
    }
}

impl KqueueBackend {
    /// Arms the kernel's native timer filter (`EVFILT_TIMER`) keyed on the
    /// synthetic fd `ident` — no real descriptor is created. `ident` must be
    /// unique among currently-armed timers on this kqueue.
    pub fn arm_timer(&self, ident: u64, delay: Duration, repeating: bool) -> Result<()> {
        let mut flags = libc::EV_ADD | libc::EV_ENABLE;
        if !repeating {
            flags |= libc::EV_ONESHOT;
        }
        let kev = libc::kevent {
            ident: ident as usize,
            filter: libc::EVFILT_TIMER,
            flags: flags as u16,
            fflags: libc::NOTE_NSECONDS as u32,
            data: delay.as_nanos().min(i64::MAX as u128) as isize,
            udata: std::ptr::null_mut(),
        };
        let changes = [kev];
        // SAFETY: changes is a valid, single-element kevent array.
        let rc = unsafe {
            libc::kevent(
                self.kq,
                changes.as_ptr(),
                1,
                std::ptr::null_mut(),
                0,
                std::ptr::null(),
            )
        };
        if rc < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(())
    }

    pub fn disarm_timer(&self, ident: u64) -> Result<()> {
        let kev = libc::kevent {
            ident: ident as usize,
            filter: libc::EVFILT_TIMER,
            flags: libc::EV_DELETE as u16,
            fflags: 0,
            data: 0,
            udata: std::ptr::null_mut(),
        };
        let changes = [kev];
        // SAFETY: see `arm_timer`.
        unsafe {
            libc::kevent(
                self.kq,
                changes.as_ptr(),
                1,
                std::ptr::null_mut(),
                0,
                std::ptr::null(),
            );
        }
        Ok(())
    }
}
