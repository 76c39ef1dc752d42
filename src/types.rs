//! Shared vocabulary types: event kinds, interest masks, and the
//! application-protocol enum negotiated by the TLS transport.

use std::fmt;

/// The four kinds of event a registered descriptor can be notified about.
///
/// `Close` is a pseudo-event: its `Enabled` bit only selects whether
/// peer-hangup invokes the user callback; when disabled the reactor
/// unregisters the descriptor silently instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Read,
    Write,
    Close,
    Timer,
}

/// Whether a given [`EventKind`] is enabled for a descriptor entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Enabled,
    Disabled,
}

impl Mode {
    #[must_use]
    pub fn is_enabled(self) -> bool {
        matches!(self, Mode::Enabled)
    }
}

/// The interest set for one descriptor entry: a mapping from each
/// [`EventKind`] to [`Mode`], kept as four bits rather than a `HashMap` since
/// the key set is fixed and small.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interest {
    bits: u8,
}

const READ_BIT: u8 = 0b0001;
const WRITE_BIT: u8 = 0b0010;
const CLOSE_BIT: u8 = 0b0100;
const TIMER_BIT: u8 = 0b1000;

impl Interest {
    #[must_use]
    pub fn none() -> Self {
        Self { bits: 0 }
    }

    #[must_use]
    pub fn set(mut self, kind: EventKind, mode: Mode) -> Self {
        let bit = Self::bit_for(kind);
        if mode.is_enabled() {
            self.bits |= bit;
        } else {
            self.bits &= !bit;
        }
        self
    }

    #[must_use]
    pub fn get(self, kind: EventKind) -> Mode {
        if self.bits & Self::bit_for(kind) != 0 {
            Mode::Enabled
        } else {
            Mode::Disabled
        }
    }

    /// True when the interest set is empty, or contains only a disabled
    /// Close bit — the condition under which the entry must be removed. An
    /// enabled Close bit keeps the entry alive even with no Read/Write/Timer
    /// interest, since the entry must still stick around to deliver it.
    #[must_use]
    pub fn is_effectively_empty(self) -> bool {
        self.bits & (READ_BIT | WRITE_BIT | TIMER_BIT | CLOSE_BIT) == 0
    }

    #[must_use]
    pub fn wants_read(self) -> bool {
        self.bits & READ_BIT != 0
    }

    #[must_use]
    pub fn wants_write(self) -> bool {
        self.bits & WRITE_BIT != 0
    }

    #[must_use]
    pub fn wants_close(self) -> bool {
        self.bits & CLOSE_BIT != 0
    }

    #[must_use]
    pub fn wants_timer(self) -> bool {
        self.bits & TIMER_BIT != 0
    }

    fn bit_for(kind: EventKind) -> u8 {
        match kind {
            EventKind::Read => READ_BIT,
            EventKind::Write => WRITE_BIT,
            EventKind::Close => CLOSE_BIT,
            EventKind::Timer => TIMER_BIT,
        }
    }
}

/// What kind of resource a descriptor entry represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Stream,
    Timer,
    Pipe,
}

/// Application protocol negotiated (or requested) over a TLS transport.
///
/// Ordering matters: the ALPN superset table is keyed on this enum, and
/// `negotiated_proto()` compares the OpenSSL-returned wire token against the
/// *exact* bytes for the desired variant via a `memcmp`-equivalent check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Proto {
    Http10,
    Http11,
    Spdy1,
    Http2,
    Http3,
}

impl Proto {
    /// The ALPN wire token for this protocol, as advertised/compared during
    /// negotiation.
    #[must_use]
    pub fn wire_token(self) -> &'static [u8] {
        match self {
            Proto::Http10 => b"http/1",
            Proto::Http11 => b"http/1.1",
            Proto::Spdy1 => b"spdy/1",
            Proto::Http2 => b"h2",
            Proto::Http3 => b"h3",
        }
    }
}

impl Default for Proto {
    fn default() -> Self {
        Proto::Http11
    }
}

impl fmt::Display for Proto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Proto::Http10 => "HTTP/1.0",
            Proto::Http11 => "HTTP/1.1",
            Proto::Spdy1 => "SPDY/1",
            Proto::Http2 => "HTTP/2",
            Proto::Http3 => "HTTP/3",
        };
        f.write_str(s)
    }
}

/// Monotonically unique registration token; never reused within the
/// lifetime of a `Reactor`. Wrapped in a newtype so call sites cannot
/// confuse it with a raw `fd`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegistrationToken(pub u64);

/// Role a TLS/DTLS transport context plays in the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
    None,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interest_close_disabled_is_effectively_empty() {
        let i = Interest::none().set(EventKind::Close, Mode::Disabled);
        assert!(i.is_effectively_empty());
    }

    #[test]
    fn interest_close_enabled_is_not_effectively_empty() {
        let i = Interest::none().set(EventKind::Close, Mode::Enabled);
        assert!(!i.is_effectively_empty());
        assert!(i.wants_close());
    }

    #[test]
    fn interest_read_makes_nonempty() {
        let i = Interest::none().set(EventKind::Read, Mode::Enabled);
        assert!(!i.is_effectively_empty());
        assert!(i.wants_read());
        assert!(!i.wants_write());
    }

    #[test]
    fn interest_toggle_roundtrip() {
        let i = Interest::none()
            .set(EventKind::Read, Mode::Enabled)
            .set(EventKind::Write, Mode::Enabled)
            .set(EventKind::Read, Mode::Disabled);
        assert_eq!(i.get(EventKind::Read), Mode::Disabled);
        assert_eq!(i.get(EventKind::Write), Mode::Enabled);
    }

    #[test]
    fn proto_default_is_http11() {
        assert_eq!(Proto::default(), Proto::Http11);
    }
}
