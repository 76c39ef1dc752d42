//! The Event Reactor: owns the descriptor table, one of the four
//! [`backend::Backend`] implementations, and the dispatch loop that delivers
//! callbacks on its single owner thread.

pub mod backend;
pub mod entry;
pub mod wake;

#[cfg(target_os = "linux")]
pub mod backend_epoll;
#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
pub mod backend_kqueue;
#[cfg(any(target_os = "illumos", target_os = "solaris"))]
pub mod backend_event_ports;
#[cfg(not(any(
    target_os = "linux",
    target_os = "macos",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly",
    target_os = "illumos",
    target_os = "solaris"
)))]
pub mod backend_poll;
// Always compiled: the reference/fallback backend, usable even on platforms
// that also have a native one, and the one the integration tests exercise
// on every CI target.
#[cfg(any(
    target_os = "linux",
    target_os = "macos",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly",
    target_os = "illumos",
    target_os = "solaris"
))]
pub mod backend_poll;

use std::collections::{HashMap, HashSet};
use std::os::unix::io::RawFd;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{error, trace, warn};

use crate::error::{NetError, Result};
use crate::timer::SelfPipeTimer;
use crate::types::{EventKind, Interest, Kind, Mode, RegistrationToken};

use backend::{Backend, ReadyEvent};
use entry::{Callback, DescriptorEntry, TimerBacking};
use wake::WakePipe;

#[cfg(target_os = "linux")]
type PlatformBackend = backend_epoll::EpollBackend;
#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
type PlatformBackend = backend_kqueue::KqueueBackend;
#[cfg(any(target_os = "illumos", target_os = "solaris"))]
type PlatformBackend = backend_event_ports::EventPortsBackend;
#[cfg(not(any(
    target_os = "linux",
    target_os = "macos",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly",
    target_os = "illumos",
    target_os = "solaris"
)))]
type PlatformBackend = backend_poll::PollBackend;

struct Inner {
    backend: PlatformBackend,
    entries: HashMap<RawFd, DescriptorEntry>,
    /// Write ends of self-pipe timers and other companion fds the Reactor
    /// owns but does not hold a full entry for; phantom-fd cleanup must not
    /// close these when they show up unexpectedly ready.
    partner_fds: HashSet<RawFd>,
}

/// A single-threaded event reactor multiplexing sockets, timers, and
/// cross-thread wake-ups.
pub struct Reactor {
    inner: Mutex<Inner>,
    wake: Arc<WakePipe>,
    running: AtomicBool,
    owner_thread: Mutex<Option<ThreadId>>,
    easy: AtomicBool,
    freeze: AtomicBool,
    frequency_ms: AtomicU32,
    max_fds: u32,
}

impl Reactor {
    /// Creates a reactor backed by the platform's native multiplexer,
    /// capable of holding at most `max_fds` live entries.
    pub fn new(max_fds: u32) -> Result<Self> {
        let backend = PlatformBackend::new()?;
        let wake = Arc::new(WakePipe::new().map_err(NetError::from)?);
        Ok(Self {
            inner: Mutex::new(Inner {
                backend,
                entries: HashMap::new(),
                partner_fds: HashSet::new(),
            }),
            wake,
            running: AtomicBool::new(false),
            owner_thread: Mutex::new(None),
            easy: AtomicBool::new(false),
            freeze: AtomicBool::new(false),
            frequency_ms: AtomicU32::new(10),
            max_fds,
        })
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn on_owner_thread(&self) -> bool {
        match *self.owner_thread.lock() {
            Some(id) => id == thread::current().id(),
            None => true,
        }
    }

    fn require_owner_thread(&self) -> Result<()> {
        if self.on_owner_thread() {
            Ok(())
        } else {
            warn!("method called off the reactor's owner thread");
            Err(NetError::ThreadAffinity)
        }
    }

    /// Registers a new descriptor, or (if `id`/`fd` already identifies a
    /// live entry) replaces its callback — `add` is idempotent on
    /// reinsertion of the same fd.
    ///
    /// For `delay_ns == 0` this registers `fd` (already opened by the
    /// caller) as a `Stream` entry with `interest`. For `delay_ns != 0` a
    /// timer is created and `*fd` is overwritten with its descriptor (or
    /// synthetic id, for backends that don't need a real one); `interest`'s
    /// `Timer` bit controls whether the callback actually fires.
    pub fn add(
        &self,
        id: RegistrationToken,
        fd: &mut RawFd,
        interest: Interest,
        callback: Callback,
        delay_ns: u64,
        repeating: bool,
    ) -> Result<()> {
        self.require_owner_thread()?;
        let mut inner = self.inner.lock();
        if inner.entries.len() as u32 >= self.max_fds && !inner.entries.contains_key(fd) {
            return Err(NetError::CapacityExceeded { max: self.max_fds });
        }

        if delay_ns == 0 {
            if let Some(existing) = inner.entries.get_mut(fd) {
                existing.callback = callback;
                existing.generation += 1;
                return Ok(());
            }
            inner.backend.register(*fd, interest)?;
            inner.entries.insert(
                *fd,
                DescriptorEntry {
                    id,
                    fd: *fd,
                    peer_fd: None,
                    kind: Kind::Stream,
                    interest,
                    delay_ns: 0,
                    repeating: false,
                    callback,
                    timer: TimerBacking::None,
                    generation: 0,
                },
            );
            return Ok(());
        }

        let delay = Duration::from_nanos(delay_ns);
        let (timer_fd, peer_fd, backing) = self.arm_timer(&mut inner, delay, repeating)?;
        // The kqueue realization arms EVFILT_TIMER directly on a synthetic
        // id inside `arm_timer`; it isn't a real fd and must not also go
        // through the generic read/write registration path below.
        if !matches!(backing, TimerBacking::KernelFilter) {
            if let Err(e) =
                inner.backend.register(timer_fd, Interest::none().set(EventKind::Read, Mode::Enabled))
            {
                warn!(fd = timer_fd, "timer registration failed: {e}");
                match backing {
                    TimerBacking::NativeFd => {
                        // SAFETY: timer_fd was just created by arm_timer above
                        // and hasn't been shared with any other owner yet.
                        unsafe {
                            libc::close(timer_fd);
                        }
                    }
                    TimerBacking::SelfPipe(timer) => timer.cancel(),
                    TimerBacking::KernelFilter | TimerBacking::None => {}
                }
                return Err(e);
            }
        }
        if let Some(p) = peer_fd {
            inner.partner_fds.insert(p);
        }
        *fd = timer_fd;
        inner.entries.insert(
            timer_fd,
            DescriptorEntry {
                id,
                fd: timer_fd,
                peer_fd,
                kind: Kind::Timer,
                interest: interest.set(EventKind::Timer, Mode::Enabled),
                delay_ns,
                repeating,
                callback,
                timer: backing,
                generation: 0,
            },
        );
        Ok(())
    }

    #[cfg(target_os = "linux")]
    fn arm_timer(
        &self,
        _inner: &mut Inner,
        delay: Duration,
        repeating: bool,
    ) -> Result<(RawFd, Option<RawFd>, TimerBacking)> {
        let fd = backend_epoll::create_timerfd(delay, repeating)?;
        Ok((fd, None, TimerBacking::NativeFd))
    }

    #[cfg(any(
        target_os = "macos",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd",
        target_os = "dragonfly"
    ))]
    fn arm_timer(
        &self,
        inner: &mut Inner,
        delay: Duration,
        repeating: bool,
    ) -> Result<(RawFd, Option<RawFd>, TimerBacking)> {
        let ident = crate::timer::next_synthetic_id();
        inner.backend.arm_timer(ident, delay, repeating)?;
        Ok((ident as RawFd, None, TimerBacking::KernelFilter))
    }

    #[cfg(not(any(
        target_os = "linux",
        target_os = "macos",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd",
        target_os = "dragonfly"
    )))]
    fn arm_timer(
        &self,
        _inner: &mut Inner,
        delay: Duration,
        repeating: bool,
    ) -> Result<(RawFd, Option<RawFd>, TimerBacking)> {
        let timer = SelfPipeTimer::arm(delay, repeating)?;
        let read_fd = timer.read_fd;
        let write_fd = timer.write_fd();
        Ok((read_fd, Some(write_fd), TimerBacking::SelfPipe(timer)))
    }

    /// Removes the entry for `(id, fd)` entirely and closes its descriptor.
    pub fn del(&self, id: RegistrationToken, fd: RawFd) -> Result<()> {
        self.require_owner_thread()?;
        let mut inner = self.inner.lock();
        self.remove_entry(&mut inner, id, fd)
    }

    /// Disables one interest kind for `(id, fd)`; removes the entry entirely
    /// once the remaining interest set is empty.
    pub fn del_interest(&self, id: RegistrationToken, fd: RawFd, kind: EventKind) -> Result<()> {
        self.require_owner_thread()?;
        let mut inner = self.inner.lock();
        let should_remove = {
            let entry = match inner.entries.get_mut(&fd) {
                Some(e) if e.id == id => e,
                _ => return Ok(()),
            };
            entry.interest = entry.interest.set(kind, Mode::Disabled);
            entry.generation += 1;
            entry.interest.is_effectively_empty()
        };
        if should_remove {
            self.remove_entry(&mut inner, id, fd)
        } else {
            let interest = inner.entries[&fd].interest;
            inner.backend.modify(fd, interest)
        }
    }

    fn remove_entry(&self, inner: &mut Inner, id: RegistrationToken, fd: RawFd) -> Result<()> {
        if let Some(entry) = inner.entries.get(&fd) {
            if entry.id != id {
                return Ok(());
            }
        } else {
            return Ok(());
        }
        let entry = inner.entries.remove(&fd).expect("checked above");
        let _ = inner.backend.unregister(fd);
        if let Some(peer) = entry.peer_fd {
            inner.partner_fds.remove(&peer);
        }
        match entry.timer {
            TimerBacking::SelfPipe(timer) => timer.cancel(),
            TimerBacking::NativeFd => {
                // SAFETY: fd is a timerfd owned exclusively by this entry;
                // no other reference to it exists once removed above.
                unsafe {
                    libc::close(fd);
                }
            }
            TimerBacking::KernelFilter => {
                #[cfg(any(
                    target_os = "macos",
                    target_os = "freebsd",
                    target_os = "netbsd",
                    target_os = "openbsd",
                    target_os = "dragonfly"
                ))]
                {
                    let _ = inner.backend.disarm_timer(fd as u64);
                }
            }
            TimerBacking::None => {
                // SAFETY: Stream/Pipe fds are owned by the Reactor once
                // registered.
                unsafe {
                    libc::close(fd);
                }
            }
        }
        Ok(())
    }

    /// Toggles a single interest bit for a live entry.
    pub fn set_interest(
        &self,
        id: RegistrationToken,
        fd: RawFd,
        kind: EventKind,
        mode: Mode,
    ) -> Result<()> {
        self.require_owner_thread()?;
        let mut inner = self.inner.lock();
        let empty = {
            let entry = match inner.entries.get_mut(&fd) {
                Some(e) if e.id == id => e,
                _ => return Ok(()),
            };
            entry.interest = entry.interest.set(kind, mode);
            entry.generation += 1;
            entry.interest.is_effectively_empty()
        };
        if empty {
            self.remove_entry(&mut inner, id, fd)
        } else {
            let interest = inner.entries[&fd].interest;
            inner.backend.modify(fd, interest)
        }
    }

    /// Cross-thread-safe: interrupts a blocked `wait()` so the owner
    /// thread's loop re-evaluates promptly. This is the only method any
    /// thread other than the owner may call; it never touches the
    /// descriptor table itself, so the "preserve the entry set" duty is
    /// trivially satisfied — nothing is torn down in the first place (see
    /// DESIGN.md for the full rationale).
    pub fn kick(&self) {
        self.wake.wake();
    }

    pub fn freeze(&self, on: bool) {
        self.freeze.store(on, Ordering::Release);
    }

    pub fn easy(&self, on: bool) {
        self.easy.store(on, Ordering::Release);
    }

    pub fn set_frequency(&self, ms: u32) {
        self.frequency_ms.store(ms, Ordering::Release);
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        self.wake.wake();
    }

    /// Tears down and recreates the backend, re-registering every live
    /// entry. Forbidden off the owner thread.
    pub fn rebase(&self) -> Result<()> {
        self.require_owner_thread()?;
        let mut inner = self.inner.lock();
        let mut backend = PlatformBackend::new()?;
        for (&fd, entry) in &inner.entries {
            match entry.timer {
                TimerBacking::KernelFilter => {
                    #[cfg(any(
                        target_os = "macos",
                        target_os = "freebsd",
                        target_os = "netbsd",
                        target_os = "openbsd",
                        target_os = "dragonfly"
                    ))]
                    backend.arm_timer(fd as u64, Duration::from_nanos(entry.delay_ns), entry.repeating)?;
                }
                _ => backend.register(fd, entry.interest)?,
            }
        }
        backend.register(self.wake.read_fd, Interest::none().set(EventKind::Read, Mode::Enabled))?;
        inner.backend = backend;
        Ok(())
    }

    /// Runs the dispatch loop on the calling thread until `stop()` is
    /// called. This thread becomes the reactor's owner thread.
    pub fn start(&self) -> Result<()> {
        *self.owner_thread.lock() = Some(thread::current().id());
        self.running.store(true, Ordering::Release);
        {
            let mut inner = self.inner.lock();
            let _ = inner.backend.register(
                self.wake.read_fd,
                Interest::none().set(EventKind::Read, Mode::Enabled),
            );
        }

        while self.running.load(Ordering::Acquire) {
            if self.freeze.load(Ordering::Acquire) {
                thread::sleep(Duration::from_millis(100));
                continue;
            }
            let timeout = if self.easy.load(Ordering::Acquire) {
                Some(Duration::from_millis(
                    self.frequency_ms.load(Ordering::Acquire).max(10) as u64,
                ))
            } else {
                None
            };

            let events: Vec<ReadyEvent> = {
                let mut inner = self.inner.lock();
                inner.backend.wait(timeout)?
            };

            for ev in events {
                if ev.fd == self.wake.read_fd {
                    self.wake.drain_and_take();
                    continue;
                }
                self.dispatch_one(ev);
            }

            if self.easy.load(Ordering::Acquire) {
                thread::sleep(Duration::from_millis(
                    self.frequency_ms.load(Ordering::Acquire).max(10) as u64,
                ));
            }
        }
        Ok(())
    }

    fn dispatch_one(&self, ev: ReadyEvent) {
        let (id, kind, interest, generation, repeating, timer_drain) = {
            let mut inner = self.inner.lock();
            let Some(entry) = inner.entries.get_mut(&ev.fd) else {
                if !inner.partner_fds.contains(&ev.fd) {
                    // SAFETY: a fd reported ready but absent from the table
                    // belongs to nobody; phantom-fd cleanup.
                    unsafe {
                        libc::close(ev.fd);
                    }
                }
                return;
            };
            let drained = if ev.readable && entry.kind == Kind::Timer {
                Some(self.drain_timer(entry, ev.fd))
            } else {
                None
            };
            (
                entry.id,
                entry.kind,
                entry.interest,
                entry.generation,
                entry.repeating,
                drained,
            )
        };

        if ev.readable {
            if kind == Kind::Timer {
                if interest.wants_timer() && timer_drain.unwrap_or(0) > 0 {
                    self.invoke(id, ev.fd, generation, EventKind::Timer);
                }
                if !repeating {
                    let _ = self.del(id, ev.fd);
                }
            } else if interest.wants_read() {
                self.invoke(id, ev.fd, generation, EventKind::Read);
            }
        }
        if ev.writable && interest.wants_write() {
            self.invoke(id, ev.fd, generation, EventKind::Write);
        }
        if ev.closed {
            self.close_and_remove(id, ev.fd, generation, interest.wants_close());
        }
    }

    /// Unregisters `(id, fd)` first, then — if Close interest was enabled —
    /// invokes its callback with `Close`: unregister first, then invoke the
    /// callback, so a reentrant registration inside the callback sees a
    /// clean slate.
    /// The callback is extracted before the entry is dropped, since
    /// `invoke`'s table lookup would otherwise find nothing to call.
    fn close_and_remove(&self, id: RegistrationToken, fd: RawFd, generation: u64, deliver: bool) {
        let callback = {
            let mut inner = self.inner.lock();
            inner.entries.get_mut(&fd).and_then(|entry| {
                if entry.id == id && entry.generation == generation {
                    let noop: Callback = Box::new(|_, _| {});
                    Some(std::mem::replace(&mut entry.callback, noop))
                } else {
                    None
                }
            })
        };
        {
            let mut inner = self.inner.lock();
            let _ = self.remove_entry(&mut inner, id, fd);
        }
        if !deliver {
            return;
        }
        if let Some(mut cb) = callback {
            trace!(fd, "dispatching Close callback");
            let result = panic::catch_unwind(AssertUnwindSafe(|| cb(fd, EventKind::Close)));
            if let Err(panic) = result {
                error!(fd, id = id.0, "callback panicked: {:?}", panic_message(&panic));
            }
        }
    }

    fn drain_timer(&self, entry: &DescriptorEntry, fd: RawFd) -> usize {
        match &entry.timer {
            TimerBacking::NativeFd => {
                #[cfg(target_os = "linux")]
                {
                    backend_epoll::drain_timerfd(fd)
                }
                #[cfg(not(target_os = "linux"))]
                {
                    let _ = fd;
                    0
                }
            }
            TimerBacking::KernelFilter => 1,
            TimerBacking::SelfPipe(timer) => timer.drain(),
            TimerBacking::None => 0,
        }
    }

    /// Looks the entry back up by `(id, fd)` and invokes its callback iff
    /// the entry is still the one dispatch started with — the generation
    /// check guards against reentrant stale mutation.
    ///
    /// The callback is swapped out for a no-op and run without holding the
    /// table lock, since it may itself reenter `add`/`del`/`set_interest`;
    /// it is swapped back in afterward if the entry still matches.
    fn invoke(&self, id: RegistrationToken, fd: RawFd, generation: u64, kind: EventKind) {
        let taken = {
            let mut inner = self.inner.lock();
            let Some(entry) = inner.entries.get_mut(&fd) else {
                return;
            };
            if entry.id != id || entry.generation != generation {
                return;
            }
            let noop: Callback = Box::new(|_, _| {});
            std::mem::replace(&mut entry.callback, noop)
        };

        trace!(fd, ?kind, "dispatching callback");
        let mut callback = taken;
        let result = panic::catch_unwind(AssertUnwindSafe(|| callback(fd, kind)));
        if let Err(panic) = result {
            error!(fd, id = id.0, "callback panicked: {:?}", panic_message(&panic));
        }

        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries.get_mut(&fd) {
            if entry.id == id && entry.generation == generation {
                entry.callback = callback;
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        self.stop();
        let mut inner = self.inner.lock();
        let fds: Vec<RawFd> = inner.entries.keys().copied().collect();
        for fd in fds {
            if let Some(entry) = inner.entries.remove(&fd) {
                match entry.timer {
                    TimerBacking::SelfPipe(timer) => timer.cancel(),
                    TimerBacking::NativeFd | TimerBacking::None => {
                        // SAFETY: fd owned exclusively by this entry.
                        unsafe {
                            libc::close(fd);
                        }
                    }
                    TimerBacking::KernelFilter => {}
                }
            }
        }
    }
}
