//! Crate-wide error type.
//!
//! Every fallible public operation returns [`NetError`] via [`Result`]. It
//! bounds on `std::error::Error + Send + Sync + 'static` so the type
//! composes with `miette::IntoDiagnostic` at call sites that want rich
//! reports.

use std::io;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, NetError>;

/// Error kinds surfaced by the reactor, socket facilities, and TLS transport.
///
/// Covers registration, I/O, TLS, protocol, and thread-affinity errors.
/// Protocol errors (ALPN mismatch) are not modeled here because they are
/// not fatal — they silently downgrade the negotiated protocol instead of
/// producing an error.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    /// The descriptor table is full, or the kernel refused registration.
    #[error("registration failed for fd {fd}: {reason}")]
    Registration { fd: i32, reason: String },

    /// A system call failed.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// TLS/DTLS handshake, verification, or CRL load failure.
    #[error("tls error: {0}")]
    Tls(String),

    /// A method that may only be called on the reactor's owner thread was
    /// invoked from elsewhere.
    #[error("method called off the reactor's owner thread")]
    ThreadAffinity,

    /// `Reactor::new` or `add` was asked to exceed `max_fds`.
    #[error("descriptor capacity ({max}) exceeded")]
    CapacityExceeded { max: u32 },

    /// A timer was registered with `delay_ns == 0`, which is forbidden.
    #[error("timer delay_ns must be nonzero")]
    ZeroDelayTimer,

    /// Library-init failure: process-wide CSPRNG seed or TLS library
    /// mismatch. Spec §7 names this the only path allowed to abort; the
    /// crate itself never aborts — it returns this error and lets the
    /// caller decide.
    #[error("library initialization failed: {0}")]
    InitFailure(String),
}

impl From<openssl::error::ErrorStack> for NetError {
    fn from(e: openssl::error::ErrorStack) -> Self {
        NetError::Tls(e.to_string())
    }
}
