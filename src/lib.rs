//! `netcore`: a single-threaded event reactor (poll/epoll/kqueue/event-ports)
//! paired with a TLS/DTLS transport that negotiates ALPN application
//! protocols.
//!
//! The [`reactor`] module multiplexes sockets, timers, and cross-thread
//! wake-ups on one owner thread; the [`tls`] module wraps an accepted or
//! connected socket with a handshake, ALPN negotiation, and hostname
//! verification. Neither drives the other: the reactor tells the
//! application a descriptor is ready, and the application calls
//! [`tls::Context::read`]/[`tls::Context::write`].

pub mod error;
pub mod logging;
pub mod reactor;
pub mod socket;
pub mod timer;
pub mod tls;
pub mod types;

pub use error::{NetError, Result};
pub use reactor::Reactor;
pub use types::{EventKind, Interest, Kind, Mode, Proto, RegistrationToken, Role};
