//! The `Backend` trait factors the multiplexer into a seam so the Reactor
//! itself stays OS-agnostic. Four implementations exist, one per kernel
//! family; [`super::platform`] selects the right one at compile time via
//! `cfg`.
//!
//! A `setup()` step resolves the chicken-egg resource dependency between a
//! worker and its waker once, up front, rather than on every call; `Backend`
//! plays the analogous role for the Reactor's blocking-wait primitive — the
//! trait is OS-agnostic, concrete resource creation (epoll_create1, kqueue,
//! etc.) is not.

use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::error::Result;
use crate::types::Interest;

/// One fd's readiness, as returned by a single `wait()` call.
///
/// `token` carries the stable numeric key — a stable index or small numeric
/// token, never a pointer whose lifetime is entangled with hash-map
/// rehashing — the Reactor uses to look the entry back up. For every real
/// backend this equals the fd itself, since fds are already a stable,
/// non-reused-while-open key within this crate's descriptor table.
#[derive(Debug, Clone, Copy)]
pub struct ReadyEvent {
    pub fd: RawFd,
    pub readable: bool,
    pub writable: bool,
    /// Hangup or error condition reported by the kernel.
    pub closed: bool,
}

/// A kernel readiness multiplexer.
///
/// Implementations own their change-list/descriptor-set representation
/// internally; the Reactor only ever calls `register`/`modify`/`unregister`/
/// `wait` and never reaches into backend-private state.
pub trait Backend: Send {
    /// Registers `fd` for the given `interest`. Read/Write/Close map to the
    /// backend's native readiness bits; `Timer` is never passed here (timer
    /// fds are registered for `Read`, since their readiness *is* the timer
    /// firing).
    fn register(&mut self, fd: RawFd, interest: Interest) -> Result<()>;

    /// Changes the interest bits already registered for `fd`.
    fn modify(&mut self, fd: RawFd, interest: Interest) -> Result<()>;

    /// Removes `fd` from the backend's interest set. Does not close `fd`;
    /// the Reactor owns the close.
    fn unregister(&mut self, fd: RawFd) -> Result<()>;

    /// Blocks until at least one registered fd is ready, or `timeout`
    /// elapses (`None` blocks forever). Returns the ready set in whatever
    /// order the kernel returned it — events for distinct fds are delivered
    /// in the kernel's returned order.
    fn wait(&mut self, timeout: Option<Duration>) -> Result<Vec<ReadyEvent>>;
}
