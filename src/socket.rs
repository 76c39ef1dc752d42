//! Socket Facilities: a thin, platform-neutral wrapper over
//! non-blocking mode, keep-alive, `SO_REUSEADDR`, buffer sizing,
//! cork/nodelay, `SIGPIPE` suppression, peer introspection, and portable
//! error text.
//!
//! `mio` hides epoll/kqueue differences behind one API; this module applies
//! the same idea one layer down, at the socket-option level, using `libc`
//! directly rather than depending on a higher-level async socket crate (the
//! Reactor, not Socket Facilities, owns readiness).

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::os::unix::io::RawFd;
use std::sync::Once;

use crate::error::{NetError, Result};

/// Address family for a new socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Inet,
    Inet6,
}

/// Socket type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockKind {
    Stream,
    Dgram,
}

/// Which side of the connection a buffer/timeout operation applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Read,
    Write,
}

static SIGPIPE_ONCE: Once = Once::new();

/// Creates a new non-blocking-capable socket. Protocol is always 0 (let the
/// kernel pick based on `kind`).
pub fn new_socket(family: Family, kind: SockKind) -> Result<RawFd> {
    let domain = match family {
        Family::Inet => libc::AF_INET,
        Family::Inet6 => libc::AF_INET6,
    };
    let ty = match kind {
        SockKind::Stream => libc::SOCK_STREAM,
        SockKind::Dgram => libc::SOCK_DGRAM,
    };
    // SAFETY: `socket(2)` with constant, validated arguments; the returned
    // fd is owned by the caller and checked for failure below.
    let fd = unsafe { libc::socket(domain, ty, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error().into());
    }
    Ok(fd)
}

/// Closes `fd`. Idempotent-unsafe: calling twice on the same value after a
/// fd has been reused by the kernel closes an unrelated descriptor, so
/// callers must only call this once per `new_socket`/`accept` result.
pub fn close(fd: RawFd) -> Result<()> {
    // SAFETY: fd is a valid, caller-owned descriptor per this module's
    // contract.
    let rc = unsafe { libc::close(fd) };
    if rc < 0 {
        return Err(io::Error::last_os_error().into());
    }
    Ok(())
}

pub fn set_nonblocking(fd: RawFd, enable: bool) -> Result<()> {
    // SAFETY: fd is caller-owned; `fcntl` with F_GETFL/F_SETFL never
    // mutates memory outside its return value.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags < 0 {
            return Err(io::Error::last_os_error().into());
        }
        let new_flags = if enable {
            flags | libc::O_NONBLOCK
        } else {
            flags & !libc::O_NONBLOCK
        };
        if libc::fcntl(fd, libc::F_SETFL, new_flags) < 0 {
            return Err(io::Error::last_os_error().into());
        }
    }
    Ok(())
}

fn setsockopt_bool(fd: RawFd, level: i32, name: i32, enable: bool) -> Result<()> {
    let value: libc::c_int = i32::from(enable);
    // SAFETY: value lives for the duration of the call and its size matches
    // the `size_of` argument.
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            std::ptr::addr_of!(value).cast::<libc::c_void>(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error().into());
    }
    Ok(())
}

pub fn set_reuseaddr(fd: RawFd, enable: bool) -> Result<()> {
    setsockopt_bool(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, enable)
}

pub fn set_ipv6_only(fd: RawFd, enable: bool) -> Result<()> {
    setsockopt_bool(fd, libc::IPPROTO_IPV6, libc::IPV6_V6ONLY, enable)
}

/// Enables TCP keepalive with the given probe `count`, idle time, and probe
/// interval (seconds). Idle/interval knobs are Linux/BSD-specific
/// (`TCP_KEEPIDLE`/`TCP_KEEPINTVL`); on platforms lacking them only
/// `SO_KEEPALIVE` and `TCP_KEEPCNT` are set, a silent degradation consistent
/// with this module's "report success as a bool" error policy.
pub fn set_keepalive(fd: RawFd, count: i32, idle_s: i32, interval_s: i32) -> Result<()> {
    setsockopt_bool(fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, true)?;
    set_int_opt(fd, libc::IPPROTO_TCP, libc::TCP_KEEPCNT, count)?;
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        set_int_opt(fd, libc::IPPROTO_TCP, libc::TCP_KEEPIDLE, idle_s)?;
        set_int_opt(fd, libc::IPPROTO_TCP, libc::TCP_KEEPINTVL, interval_s)?;
    }
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    {
        let _ = (idle_s, interval_s);
    }
    Ok(())
}

fn set_int_opt(fd: RawFd, level: i32, name: i32, value: i32) -> Result<()> {
    // SAFETY: see `setsockopt_bool`.
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            std::ptr::addr_of!(value).cast::<libc::c_void>(),
            std::mem::size_of::<i32>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error().into());
    }
    Ok(())
}

/// TCP_CORK (Linux) / TCP_NOPUSH (BSD): batch small writes into full
/// segments.
pub fn set_cork(fd: RawFd, enable: bool) -> Result<()> {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        set_int_opt(fd, libc::IPPROTO_TCP, libc::TCP_CORK, i32::from(enable))
    }
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    {
        let _ = (fd, enable);
        Ok(())
    }
}

pub fn set_nodelay(fd: RawFd, enable: bool) -> Result<()> {
    setsockopt_bool(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, enable)
}

pub fn set_buffer_size(fd: RawFd, side: Side, bytes: i32) -> Result<()> {
    let name = match side {
        Side::Read => libc::SO_RCVBUF,
        Side::Write => libc::SO_SNDBUF,
    };
    set_int_opt(fd, libc::SOL_SOCKET, name, bytes)
}

pub fn get_buffer_size(fd: RawFd, side: Side) -> Result<i32> {
    let name = match side {
        Side::Read => libc::SO_RCVBUF,
        Side::Write => libc::SO_SNDBUF,
    };
    let mut value: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    // SAFETY: value/len are valid, correctly-sized out-parameters.
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            name,
            std::ptr::addr_of_mut!(value).cast::<libc::c_void>(),
            &mut len,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error().into());
    }
    Ok(value)
}

/// Bytes currently queued on `side` (Linux `SIOCINQ`/`SIOCOUTQ`; elsewhere
/// unsupported and reported as 0).
pub fn get_pending(fd: RawFd, side: Side) -> Result<i32> {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        let request: libc::c_ulong = match side {
            Side::Read => libc::FIONREAD as libc::c_ulong,
            Side::Write => libc::TIOCOUTQ as libc::c_ulong,
        };
        let mut value: libc::c_int = 0;
        // SAFETY: value is a correctly-sized out-parameter for this ioctl.
        let rc = unsafe { libc::ioctl(fd, request, std::ptr::addr_of_mut!(value)) };
        if rc < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(value)
    }
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    {
        let _ = (fd, side);
        Ok(0)
    }
}

/// `SO_RCVTIMEO`/`SO_SNDTIMEO` in milliseconds.
pub fn set_timeout(fd: RawFd, side: Side, ms: u32) -> Result<()> {
    let name = match side {
        Side::Read => libc::SO_RCVTIMEO,
        Side::Write => libc::SO_SNDTIMEO,
    };
    let tv = libc::timeval {
        tv_sec: (ms / 1000) as libc::time_t,
        tv_usec: ((ms % 1000) * 1000) as libc::suseconds_t,
    };
    // SAFETY: tv is a validly-sized, stack-local `timeval`.
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            name,
            std::ptr::addr_of!(tv).cast::<libc::c_void>(),
            std::mem::size_of::<libc::timeval>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error().into());
    }
    Ok(())
}

/// Ignores `SIGPIPE` process-wide, once. Writing to a peer that has reset
/// the connection then surfaces as `EPIPE` on the write call instead of
/// terminating the process — required because the reactor classifies
/// `EPIPE` as a fatal, recoverable I/O error, not a signal.
pub fn suppress_sigpipe() {
    SIGPIPE_ONCE.call_once(|| {
        // SAFETY: installing a signal disposition with fixed, valid
        // arguments; idempotent and process-wide by design.
        unsafe {
            libc::signal(libc::SIGPIPE, libc::SIG_IGN);
        }
    });
}

/// `SO_NOSIGPIPE` on platforms that support a per-socket suppression
/// (BSD/macOS); a no-op elsewhere, where `suppress_sigpipe()` is the only
/// mechanism.
pub fn suppress_sigpipe_on(fd: RawFd) -> Result<()> {
    #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
    {
        setsockopt_bool(fd, libc::SOL_SOCKET, libc::SO_NOSIGPIPE, true)
    }
    #[cfg(not(any(target_os = "macos", target_os = "ios", target_os = "freebsd")))]
    {
        let _ = fd;
        Ok(())
    }
}

/// Human-readable text for the last `errno` set on this thread.
#[must_use]
pub fn last_error_text() -> String {
    io::Error::last_os_error().to_string()
}

#[must_use]
pub fn errno_value() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

/// Peer address of a connected socket. MAC address introspection requires
/// walking ARP/neighbor tables, which is platform-specific and out of scope
/// for a portable core; callers that need it should resolve it themselves
/// from `ip` via an external collaborator — DNS resolution and similar
/// lookups are left to external collaborators by design.
pub fn peer_of(fd: RawFd) -> Result<(IpAddr, u16, Option<String>)> {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    // SAFETY: storage/len are a correctly-sized out-parameter pair for
    // `getpeername`.
    let rc = unsafe {
        libc::getpeername(
            fd,
            std::ptr::addr_of_mut!(storage).cast::<libc::sockaddr>(),
            &mut len,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error().into());
    }
    let sockaddr = sockaddr_storage_to_std(&storage)?;
    Ok((sockaddr.ip(), sockaddr.port(), None))
}

fn sockaddr_storage_to_std(storage: &libc::sockaddr_storage) -> Result<SocketAddr> {
    match i32::from(storage.ss_family) {
        f if f == libc::AF_INET => {
            // SAFETY: family tag guarantees this reinterpretation is valid.
            let addr_in: libc::sockaddr_in =
                unsafe { *(std::ptr::addr_of!(*storage).cast::<libc::sockaddr_in>()) };
            let ip = std::net::Ipv4Addr::from(u32::from_be(addr_in.sin_addr.s_addr));
            let port = u16::from_be(addr_in.sin_port);
            Ok(SocketAddr::new(IpAddr::V4(ip), port))
        }
        f if f == libc::AF_INET6 => {
            // SAFETY: family tag guarantees this reinterpretation is valid.
            let addr_in6: libc::sockaddr_in6 =
                unsafe { *(std::ptr::addr_of!(*storage).cast::<libc::sockaddr_in6>()) };
            let ip = std::net::Ipv6Addr::from(addr_in6.sin6_addr.s6_addr);
            let port = u16::from_be(addr_in6.sin6_port);
            Ok(SocketAddr::new(IpAddr::V6(ip), port))
        }
        other => Err(NetError::Io(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unsupported address family {other}"),
        ))),
    }
}

/// Local address assigned to `family`'s default route, resolved by opening
/// a UDP socket and "connecting" it to a well-known off-host address
/// without sending any packets (the conventional portable trick for
/// learning the outbound interface address).
pub fn ip_of_iface(family: Family) -> Result<String> {
    let probe = match family {
        Family::Inet => "8.8.8.8:80",
        Family::Inet6 => "[2001:4860:4860::8888]:80",
    };
    let sock = std::net::UdpSocket::bind(match family {
        Family::Inet => "0.0.0.0:0",
        Family::Inet6 => "[::]:0",
    })?;
    sock.connect(probe)?;
    Ok(sock.local_addr()?.ip().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_socket_and_close_roundtrip() {
        let fd = new_socket(Family::Inet, SockKind::Stream).unwrap();
        assert!(fd >= 0);
        set_nonblocking(fd, true).unwrap();
        set_reuseaddr(fd, true).unwrap();
        close(fd).unwrap();
    }

    #[test]
    fn buffer_size_roundtrip_is_at_least_requested() {
        let fd = new_socket(Family::Inet, SockKind::Stream).unwrap();
        set_buffer_size(fd, Side::Read, 64 * 1024).unwrap();
        let got = get_buffer_size(fd, Side::Read).unwrap();
        // The kernel doubles/rounds the requested value; just assert it's
        // not rejected outright.
        assert!(got > 0);
        close(fd).unwrap();
    }

    #[test]
    fn suppress_sigpipe_is_idempotent() {
        suppress_sigpipe();
        suppress_sigpipe();
    }
}
