//! TLS/DTLS Transport: wraps an accepted or connected socket, performs the
//! handshake, negotiates ALPN, verifies the peer hostname, and
//! presents a uniform `read/write/blocking/cork/nodelay/timeout/buffer`
//! contract regardless of whether the underlying bytes are encrypted.
//!
//! Built on the `openssl` crate, since the public vocabulary this module
//! exposes — `SSL_CTX`, BIO, `DTLSv1_listen` cookies,
//! `X509_VERIFY_PARAM_set1_host` — is OpenSSL's C API, which `rustls` (no
//! DTLS support) cannot satisfy.

pub mod alpn;
pub mod cookie;
pub mod verify;

use std::io::{self, Read, Write};
use std::net::IpAddr;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};

use openssl::error::ErrorStack;
use openssl::ssl::{
    AlpnError, HandshakeError, MidHandshakeSslStream, Ssl, SslContextBuilder, SslFiletype,
    SslMethod, SslMode, SslStream, SslVerifyMode,
};
use openssl::x509::store::X509StoreBuilder;
use openssl::x509::verify::X509VerifyFlags;
use openssl::x509::X509Crl;
use tracing::{debug, trace, warn};

use crate::error::Result;
use crate::socket::{self, Side};
use crate::types::{Proto, Role};

/// Fatal OS errors: any of these transitions the transport's address status
/// to Disconnected.
const FATAL_ERRNOS: &[i32] = &[
    libc::ECONNRESET,
    libc::EPIPE,
    libc::ENOTCONN,
    libc::ETIMEDOUT,
    libc::ENETDOWN,
    libc::ENETUNREACH,
];

/// A non-owning `Read + Write` view of a fd; `Context` alone closes it.
struct RawFdStream {
    fd: RawFd,
}

impl Read for RawFdStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        // SAFETY: buf is valid for its stated length for the call's duration.
        let n = unsafe { libc::read(self.fd, buf.as_mut_ptr().cast(), buf.len()) };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }
}

impl Write for RawFdStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // SAFETY: buf is valid for its stated length for the call's duration.
        let n = unsafe { libc::write(self.fd, buf.as_ptr().cast(), buf.len()) };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Builds per-connection `SSL_CTX`-equivalents from a shared trust
/// configuration; each [`Context`] gets its own so its desired ALPN
/// protocol can differ from its siblings'.
pub struct Engine {
    trust_dir: Option<PathBuf>,
    ciphers: Vec<String>,
    crl_path: Option<PathBuf>,
    identity: Option<(PathBuf, PathBuf)>,
}

impl Engine {
    pub fn new(trust_dir: Option<&Path>, ciphers: &[&str]) -> Result<Self> {
        socket::suppress_sigpipe();
        Ok(Self {
            trust_dir: trust_dir.map(Path::to_path_buf),
            ciphers: ciphers.iter().map(|s| (*s).to_string()).collect(),
            crl_path: None,
            identity: None,
        })
    }

    /// Loads a PEM-encoded CRL; every `Context` wrapped after this call
    /// consults it alongside SAN/CN hostname checks.
    pub fn set_crl(&mut self, path: &Path) -> Result<()> {
        // Touch the file now so a bad path fails here, not on first wrap.
        let pem = std::fs::read(path)?;
        X509Crl::from_pem(&pem)?;
        self.crl_path = Some(path.to_path_buf());
        Ok(())
    }

    /// Loads the certificate chain and private key a server-role context
    /// presents during the handshake. Not a certificate *store* (no
    /// per-SNI lookup, no hot reload) — every server context this engine
    /// wraps presents the same identity.
    pub fn set_identity(&mut self, cert_chain_pem: &Path, private_key_pem: &Path) -> Result<()> {
        self.identity = Some((cert_chain_pem.to_path_buf(), private_key_pem.to_path_buf()));
        Ok(())
    }

    fn base_builder(&self, method: SslMethod) -> Result<SslContextBuilder> {
        let mut builder = SslContextBuilder::new(method)?;
        if !self.ciphers.is_empty() {
            builder.set_cipher_list(&self.ciphers.join(":"))?;
        }
        builder.set_verify(SslVerifyMode::PEER);
        if let Some(dir) = &self.trust_dir {
            builder.load_verify_locations(None, Some(dir))?;
        }
        if let Some(crl_path) = &self.crl_path {
            let pem = std::fs::read(crl_path)?;
            let crl = X509Crl::from_pem(&pem)?;
            let mut store = X509StoreBuilder::new()?;
            store.add_crl(crl)?;
            store.set_flags(X509VerifyFlags::CRL_CHECK)?;
            builder.set_cert_store(store.build());
        }
        Ok(builder)
    }

    fn server_builder(&self, method: SslMethod) -> Result<SslContextBuilder> {
        let mut builder = self.base_builder(method)?;
        // Advertise the widest superset; `Context::negotiated_proto`
        // downgrades to HTTP/1.1 after handshake if the actual negotiated
        // value doesn't exactly match this connection's desired proto.
        builder.set_alpn_select_callback(|_, client_offered| {
            let server_order = alpn::wire_advertisement(Proto::Http3);
            openssl::ssl::select_next_proto(&server_order, client_offered).ok_or(AlpnError::NOACK)
        });
        builder.set_cookie_generate_cb(|_, buf| {
            let generated = cookie::generate().map_err(|_| ErrorStack::get())?;
            let len = generated.len().min(buf.len());
            buf[..len].copy_from_slice(&generated[..len]);
            Ok(len)
        });
        builder.set_cookie_verify_cb(|_, buf| cookie::verify(buf));
        if let Some((chain, key)) = &self.identity {
            builder.set_certificate_chain_file(chain)?;
            builder.set_private_key_file(key, SslFiletype::PEM)?;
            builder.check_private_key()?;
        }
        Ok(builder)
    }

    /// Wraps an already-accepted TCP fd as a server-role TLS context.
    pub fn wrap_server(&self, fd: RawFd, proto: Proto) -> Result<Context> {
        let builder = self.server_builder(SslMethod::tls())?;
        let ssl_ctx = builder.build();
        let ssl = Ssl::new(&ssl_ctx)?;
        Ok(Context::new_server(fd, ssl, proto, None))
    }

    /// Wraps a listening UDP fd for DTLS, awaiting the stateless cookie
    /// exchange from `peer` via `DTLSv1_listen`. `peer` is the address
    /// `recvfrom` reported for the first datagram on this fd; a
    /// production multi-peer listener would demux many peers on one
    /// socket, which this crate doesn't attempt (see DESIGN.md).
    pub fn wrap_server_for_listen(
        &self,
        fd: RawFd,
        peer: (IpAddr, u16),
        proto: Proto,
    ) -> Result<Context> {
        let builder = self.server_builder(SslMethod::dtls())?;
        let ssl_ctx = builder.build();
        let ssl = Ssl::new(&ssl_ctx)?;
        Ok(Context::new_server(fd, ssl, proto, Some(peer)))
    }

    /// Moves an accepted fd into a fresh context derived from `listening`'s
    /// configuration, for once the cookie round-trip has succeeded.
    pub fn attach(&self, listening: &Context, fd: RawFd) -> Result<Context> {
        let builder = self.server_builder(listening.method())?;
        let ssl_ctx = builder.build();
        let ssl = Ssl::new(&ssl_ctx)?;
        Ok(Context::new_server(fd, ssl, listening.desired_proto, listening.peer))
    }

    pub fn wrap_client(&self, fd: RawFd, sni_host: &str, proto: Proto) -> Result<Context> {
        let mut builder = self.base_builder(SslMethod::tls())?;
        builder.set_alpn_protos(&alpn::wire_advertisement(proto))?;
        let host = sni_host.to_string();
        builder.set_verify_callback(SslVerifyMode::PEER, move |preverify_ok, x509_ctx| {
            preverify_ok
                && x509_ctx
                    .current_cert()
                    .is_some_and(|cert| verify::matches_hostname(cert, &host))
        });
        let ssl_ctx = builder.build();
        let mut ssl = Ssl::new(&ssl_ctx)?;
        ssl.set_hostname(sni_host)?;
        Ok(Context::new_client(fd, ssl, proto))
    }
}

enum Phase {
    /// Not yet driven; server role awaiting cookie exchange before accept,
    /// or the pre-handshake state before the first `wait_handshake` call.
    NotStarted(Ssl),
    MidHandshake(MidHandshakeSslStream<RawFdStream>),
    Established(SslStream<RawFdStream>),
    Cleared,
}

/// One TLS/DTLS-wrapped (or, when `encrypted` is false, plain) connection.
pub struct Context {
    fd: RawFd,
    role: Role,
    desired_proto: Proto,
    negotiated: Option<Proto>,
    encrypted: bool,
    peer: Option<(IpAddr, u16)>,
    dtls: bool,
    phase: Phase,
    /// Set once `read`/`write` observes a fatal I/O condition; the address
    /// is no longer usable and the caller should tear the context down.
    disconnected: bool,
}

impl Context {
    fn new_server(fd: RawFd, ssl: Ssl, proto: Proto, peer: Option<(IpAddr, u16)>) -> Self {
        let dtls = peer.is_some();
        Self {
            fd,
            role: Role::Server,
            desired_proto: proto,
            negotiated: None,
            encrypted: true,
            peer,
            dtls,
            phase: Phase::NotStarted(ssl),
            disconnected: false,
        }
    }

    fn new_client(fd: RawFd, ssl: Ssl, proto: Proto) -> Self {
        Self {
            fd,
            role: Role::Client,
            desired_proto: proto,
            negotiated: None,
            encrypted: true,
            peer: None,
            dtls: false,
            phase: Phase::NotStarted(ssl),
            disconnected: false,
        }
    }

    fn method(&self) -> SslMethod {
        if self.dtls {
            SslMethod::dtls()
        } else {
            SslMethod::tls()
        }
    }

    /// Advances the handshake (or, for DTLS listen contexts, the stateless
    /// cookie exchange) by one non-blocking step. Returns `true` once the
    /// handshake is complete.
    pub fn wait_handshake(&mut self) -> bool {
        if let Some((ip, port)) = self.peer {
            cookie::set_current_peer((ip, port));
        }
        let phase = std::mem::replace(&mut self.phase, Phase::Cleared);
        let (done, next) = match phase {
            Phase::NotStarted(ssl) => self.drive(HandshakeStart::Fresh(ssl)),
            Phase::MidHandshake(mid) => self.drive(HandshakeStart::Resume(mid)),
            Phase::Established(stream) => (true, Phase::Established(stream)),
            Phase::Cleared => (false, Phase::Cleared),
        };
        self.phase = next;
        if done {
            if let Phase::Established(stream) = &self.phase {
                let wire = stream.ssl().selected_alpn_protocol().unwrap_or(&[]);
                self.negotiated = Some(alpn::negotiated_or_downgrade(wire, self.desired_proto));
            }
        }
        done
    }

    fn drive(&self, start: HandshakeStart) -> (bool, Phase) {
        let stream = RawFdStream { fd: self.fd };
        let attempt = match (self.role, start) {
            (Role::Server, HandshakeStart::Fresh(ssl)) => ssl.accept(stream),
            (Role::Client, HandshakeStart::Fresh(ssl)) => {
                ssl.connect(stream)
            }
            (_, HandshakeStart::Resume(mid)) => mid.handshake(),
            (Role::None, _) => return (false, Phase::Cleared),
        };
        match attempt {
            Ok(stream) => (true, Phase::Established(stream)),
            Err(HandshakeError::WouldBlock(mid)) => (false, Phase::MidHandshake(mid)),
            Err(HandshakeError::Failure(mid)) => {
                warn!(fd = self.fd, "handshake failed: {}", mid.error());
                (false, Phase::Cleared)
            }
            Err(HandshakeError::SetupFailure(e)) => {
                warn!(fd = self.fd, "handshake setup failed: {e}");
                (false, Phase::Cleared)
            }
        }
    }

    /// `-1` with no bytes consumed exactly when the library reports
    /// WANT_READ/WANT_WRITE, `0` on orderly close or any fatal condition
    /// (which also flips [`Context::is_disconnected`]), otherwise the byte
    /// count.
    pub fn read(&mut self, buf: &mut [u8]) -> i64 {
        if !self.encrypted {
            return self.read_plain(buf);
        }
        let Phase::Established(stream) = &mut self.phase else {
            return -1;
        };
        match stream.ssl_read(buf) {
            Ok(0) => {
                self.disconnected = true;
                0
            }
            Ok(n) => n as i64,
            Err(e) => {
                let (ret, fatal) = classify_ssl_io_error(&e);
                if fatal {
                    self.disconnected = true;
                }
                ret
            }
        }
    }

    pub fn write(&mut self, buf: &[u8]) -> i64 {
        if !self.encrypted {
            return self.write_plain(buf);
        }
        let Phase::Established(stream) = &mut self.phase else {
            return -1;
        };
        match stream.ssl_write(buf) {
            Ok(n) => n as i64,
            Err(e) => {
                let (ret, fatal) = classify_ssl_io_error(&e);
                if fatal {
                    self.disconnected = true;
                }
                ret
            }
        }
    }

    fn read_plain(&mut self, buf: &mut [u8]) -> i64 {
        // SAFETY: buf is valid for its stated length for the call's duration.
        let n = unsafe { libc::read(self.fd, buf.as_mut_ptr().cast(), buf.len()) };
        if n < 0 {
            let (ret, fatal) = classify_errno(io::Error::last_os_error().raw_os_error());
            if fatal {
                self.disconnected = true;
            }
            ret
        } else if n == 0 {
            self.disconnected = true;
            0
        } else {
            n as i64
        }
    }

    fn write_plain(&mut self, buf: &[u8]) -> i64 {
        // SAFETY: buf is valid for its stated length for the call's duration.
        let n = unsafe { libc::write(self.fd, buf.as_ptr().cast(), buf.len()) };
        if n < 0 {
            let (ret, fatal) = classify_errno(io::Error::last_os_error().raw_os_error());
            if fatal {
                self.disconnected = true;
            }
            ret
        } else {
            n as i64
        }
    }

    /// The fd's own non-blocking flag governs the TLS stream's BIO; on a
    /// live handshake also toggles `SSL_MODE_AUTO_RETRY` (blocking reads
    /// transparently retry on a renegotiation) and
    /// `SSL_MODE_ACCEPT_MOVING_WRITE_BUFFER` (needed once writes may come
    /// from a buffer that moves between retries, which only happens in
    /// non-blocking mode).
    pub fn set_blocking(&self, blocking: bool) -> Result<()> {
        socket::set_nonblocking(self.fd, !blocking)?;
        if let Phase::Established(stream) = &self.phase {
            let ssl = stream.ssl();
            if blocking {
                ssl.set_mode(SslMode::AUTO_RETRY);
                ssl.clear_mode(SslMode::ACCEPT_MOVING_WRITE_BUFFER);
            } else {
                ssl.clear_mode(SslMode::AUTO_RETRY);
                ssl.set_mode(SslMode::ACCEPT_MOVING_WRITE_BUFFER);
            }
        }
        Ok(())
    }

    /// Enabling cork disables `SSL_MODE_ENABLE_PARTIAL_WRITE` so a write is
    /// never split at the TLS-record layer while the kernel is asked to
    /// hold the segment; disabling it re-enables partial writes.
    pub fn set_cork(&self, enable: bool) -> Result<()> {
        socket::set_cork(self.fd, enable)?;
        if let Phase::Established(stream) = &self.phase {
            let ssl = stream.ssl();
            if enable {
                ssl.clear_mode(SslMode::ENABLE_PARTIAL_WRITE);
            } else {
                ssl.set_mode(SslMode::ENABLE_PARTIAL_WRITE);
            }
        }
        Ok(())
    }

    /// Enabling nodelay sets `SSL_MODE_ENABLE_PARTIAL_WRITE` so a write
    /// returns as soon as some of the buffer was flushed, rather than
    /// waiting to batch it all into one record.
    pub fn set_nodelay(&self, enable: bool) -> Result<()> {
        socket::set_nodelay(self.fd, enable)?;
        if let Phase::Established(stream) = &self.phase {
            let ssl = stream.ssl();
            if enable {
                ssl.set_mode(SslMode::ENABLE_PARTIAL_WRITE);
            } else {
                ssl.clear_mode(SslMode::ENABLE_PARTIAL_WRITE);
            }
        }
        Ok(())
    }

    pub fn set_timeout(&self, ms: u32, side: Side) -> Result<()> {
        socket::set_timeout(self.fd, side, ms)
    }

    pub fn set_buffer(&self, read_bytes: i32, write_bytes: i32) -> Result<()> {
        socket::set_buffer_size(self.fd, Side::Read, read_bytes)?;
        socket::set_buffer_size(self.fd, Side::Write, write_bytes)
    }

    pub fn get_buffer(&self, side: Side) -> Result<i32> {
        socket::get_buffer_size(self.fd, side)
    }

    pub fn get_pending(&self, side: Side) -> Result<i32> {
        socket::get_pending(self.fd, side)
    }

    #[must_use]
    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    /// True once `read`/`write` has observed a fatal I/O condition on this
    /// address; the fd should be treated as gone even if not yet `clear()`-ed.
    #[must_use]
    pub fn is_disconnected(&self) -> bool {
        self.disconnected
    }

    pub fn set_encrypted(&mut self, on: bool) {
        self.encrypted = on;
    }

    pub fn set_proto(&mut self, proto: Proto) {
        self.desired_proto = proto;
    }

    /// The negotiated protocol; defaults to HTTP/1.1 before a successful
    /// handshake.
    #[must_use]
    pub fn negotiated_proto(&self) -> Proto {
        self.negotiated.unwrap_or_default()
    }

    /// Shuts the TLS session down and closes the fd; the context is left in
    /// `Phase::Cleared` and its fd is no longer valid for use.
    pub fn clear(&mut self) {
        if let Phase::Established(mut stream) = std::mem::replace(&mut self.phase, Phase::Cleared)
        {
            let _ = stream.shutdown();
        }
        // SAFETY: fd is owned exclusively by this context.
        unsafe {
            libc::close(self.fd);
        }
        self.negotiated = None;
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        if !matches!(self.phase, Phase::Cleared) {
            self.clear();
        }
    }
}

enum HandshakeStart {
    Fresh(Ssl),
    Resume(MidHandshakeSslStream<RawFdStream>),
}

/// Classifies an `openssl::ssl::Error` into the `read`/`write` return
/// convention: `-1` is returned exactly when the library reports
/// WANT_READ/WANT_WRITE (the only retryable case); orderly close, any other
/// SSL-level error, and a fatal syscall errno all return `0`, matching a
/// plain socket's end-of-stream return. The second element is `true` when
/// the condition is fatal (everything but WANT_READ/WANT_WRITE and
/// non-fatal syscall errnos), telling the caller to mark the address
/// disconnected.
fn classify_ssl_io_error(e: &openssl::ssl::Error) -> (i64, bool) {
    use openssl::ssl::ErrorCode;
    match e.code() {
        ErrorCode::WANT_READ | ErrorCode::WANT_WRITE => (-1, false),
        ErrorCode::ZERO_RETURN => (0, true),
        ErrorCode::SYSCALL => {
            let errno = e.io_error().and_then(io::Error::raw_os_error);
            classify_errno(errno)
        }
        other => {
            debug!("tls io error: {other:?}");
            (0, true)
        }
    }
}

/// `-1` for a retryable plain-socket errno (`EAGAIN`/`EWOULDBLOCK`/`EINTR`),
/// `0` and `true` for any errno in `FATAL_ERRNOS`.
fn classify_errno(errno: Option<i32>) -> (i64, bool) {
    match errno {
        Some(code) if FATAL_ERRNOS.contains(&code) => {
            trace!(errno = code, "fatal transport error");
            (0, true)
        }
        _ => (-1, false),
    }
}
