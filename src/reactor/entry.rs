//! The descriptor entry: one record per registered fd.

use std::os::unix::io::RawFd;

use crate::timer::SelfPipeTimer;
use crate::types::{Interest, Kind, RegistrationToken};

/// How a `Kind::Timer` entry's expiry is realized. Populated by whichever
/// [`crate::reactor::backend::Backend`] created the entry; see
/// [`crate::timer`] for the rationale behind each variant.
pub enum TimerBacking {
    /// Not a timer entry.
    None,
    /// Linux `timerfd`: the entry's `fd` itself is the timer descriptor;
    /// reading it yields an 8-byte fire count.
    NativeFd,
    /// kqueue `EVFILT_TIMER`: the entry's `fd` is a synthetic id registered
    /// as the filter's `ident`; no real descriptor exists.
    KernelFilter,
    /// Self-pipe plus sleeper thread (poll-style and event-ports backends).
    SelfPipe(SelfPipeTimer),
}

impl std::fmt::Debug for TimerBacking {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimerBacking::None => f.write_str("None"),
            TimerBacking::NativeFd => f.write_str("NativeFd"),
            TimerBacking::KernelFilter => f.write_str("KernelFilter"),
            TimerBacking::SelfPipe(_) => f.write_str("SelfPipe(..)"),
        }
    }
}

/// User callback signature: `(fd, event_kind)`.
pub type Callback = Box<dyn FnMut(RawFd, crate::types::EventKind) + Send>;

/// One entry in the Reactor's descriptor table.
pub struct DescriptorEntry {
    pub id: RegistrationToken,
    pub fd: RawFd,
    pub peer_fd: Option<RawFd>,
    pub kind: Kind,
    pub interest: Interest,
    pub delay_ns: u64,
    pub repeating: bool,
    pub callback: Callback,
    pub timer: TimerBacking,
    /// Bumped on every `set_interest`/re-registration; used to detect a
    /// stale mutation queued by a callback against an entry that was
    /// removed and re-added under the same fd during the same dispatch
    /// pass.
    pub generation: u64,
}

impl std::fmt::Debug for DescriptorEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DescriptorEntry")
            .field("id", &self.id)
            .field("fd", &self.fd)
            .field("peer_fd", &self.peer_fd)
            .field("kind", &self.kind)
            .field("interest", &self.interest)
            .field("generation", &self.generation)
            .field("timer", &self.timer)
            .finish_non_exhaustive()
    }
}
