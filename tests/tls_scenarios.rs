//! TLS end-to-end scenarios: ALPN negotiation over a real loopback socket,
//! and handshake failure against a hostname the certificate wasn't issued
//! for.

use std::io::Write as _;
use std::net::{TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::hash::MessageDigest;
use openssl::pkey::PKey;
use openssl::rsa::Rsa;
use openssl::x509::extension::SubjectAlternativeName;
use openssl::x509::{X509Name, X509};

use netcore::tls::Engine;
use netcore::types::Proto;

struct TempDir(PathBuf);

impl TempDir {
    fn new(label: &str) -> Self {
        let mut path = std::env::temp_dir();
        path.push(format!(
            "netcore-test-{label}-{}-{}",
            std::process::id(),
            thread::current().id().as_u64()
        ));
        std::fs::create_dir_all(&path).unwrap();
        Self(path)
    }

    fn path(&self) -> &Path {
        &self.0
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.0);
    }
}

trait ThreadIdExt {
    fn as_u64(&self) -> u64;
}

impl ThreadIdExt for thread::ThreadId {
    fn as_u64(&self) -> u64 {
        // `ThreadId` has no stable numeric accessor; hash its Debug text
        // instead, which is unique enough for a temp-dir suffix.
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        format!("{self:?}").hash(&mut hasher);
        hasher.finish()
    }
}

/// Issues a self-signed cert for `cn`, valid for one day, writes the cert
/// and key as PEM, and symlinks the cert under its OpenSSL subject-hash name
/// inside `trust_dir` (the `c_rehash` layout `load_verify_locations`'s
/// `ca_path` argument expects).
fn issue_self_signed(cn: &str, cert_path: &Path, key_path: &Path, trust_dir: &Path) {
    let rsa = Rsa::generate(2048).unwrap();
    let pkey = PKey::from_rsa(rsa).unwrap();

    let mut name_builder = X509Name::builder().unwrap();
    name_builder.append_entry_by_text("CN", cn).unwrap();
    let name = name_builder.build();

    let mut builder = X509::builder().unwrap();
    builder.set_version(2).unwrap();
    let mut serial = BigNum::new().unwrap();
    serial.rand(64, MsbOption::MAYBE_ZERO, false).unwrap();
    builder
        .set_serial_number(&serial.to_asn1_integer().unwrap())
        .unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();
    builder.set_pubkey(&pkey).unwrap();
    builder
        .set_not_before(&Asn1Time::days_from_now(0).unwrap())
        .unwrap();
    builder
        .set_not_after(&Asn1Time::days_from_now(1).unwrap())
        .unwrap();
    let san = SubjectAlternativeName::new()
        .dns(cn)
        .build(&builder.x509v3_context(None, None))
        .unwrap();
    builder.append_extension(san).unwrap();
    builder.sign(&pkey, MessageDigest::sha256()).unwrap();
    let cert = builder.build();

    std::fs::write(cert_path, cert.to_pem().unwrap()).unwrap();
    std::fs::write(key_path, pkey.private_key_to_pem_pkcs8().unwrap()).unwrap();

    let hash = format!("{:08x}", cert.subject_name_hash());
    let link = trust_dir.join(format!("{hash}.0"));
    #[cfg(unix)]
    std::os::unix::fs::symlink(cert_path, link).unwrap();
}

#[test]
fn tls_client_negotiates_http2_over_loopback() {
    let trust_dir = TempDir::new("trust");
    let work_dir = TempDir::new("work");
    let cert_path = work_dir.path().join("server.pem");
    let key_path = work_dir.path().join("server.key");
    issue_self_signed("localhost", &cert_path, &key_path, trust_dir.path());

    let mut server_engine = Engine::new(Some(trust_dir.path()), &[]).unwrap();
    server_engine.set_identity(&cert_path, &key_path).unwrap();
    let client_engine = Engine::new(Some(trust_dir.path()), &[]).unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let server = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        stream.set_nonblocking(true).unwrap();
        let fd = stream.as_raw_fd();
        std::mem::forget(stream);
        let mut ctx = server_engine.wrap_server(fd, Proto::Http2).unwrap();
        for _ in 0..200 {
            if ctx.wait_handshake() {
                return ctx.negotiated_proto();
            }
            thread::sleep(Duration::from_millis(5));
        }
        panic!("server handshake never completed");
    });

    thread::sleep(Duration::from_millis(20));
    let stream = TcpStream::connect(addr).unwrap();
    stream.set_nonblocking(true).unwrap();
    let fd = stream.as_raw_fd();
    std::mem::forget(stream);
    let mut client_ctx = client_engine.wrap_client(fd, "localhost", Proto::Http2).unwrap();

    let mut client_proto = None;
    for _ in 0..200 {
        if client_ctx.wait_handshake() {
            client_proto = Some(client_ctx.negotiated_proto());
            break;
        }
        thread::sleep(Duration::from_millis(5));
    }

    let server_proto = server.join().unwrap();
    assert_eq!(client_proto, Some(Proto::Http2));
    assert_eq!(server_proto, Proto::Http2);
}

#[test]
fn tls_client_rejects_hostname_mismatch() {
    let trust_dir = TempDir::new("trust-mismatch");
    let work_dir = TempDir::new("work-mismatch");
    let cert_path = work_dir.path().join("server.pem");
    let key_path = work_dir.path().join("server.key");
    // Certificate is issued for "example.internal"; the client will connect
    // expecting "localhost", which must fail `verify::matches_hostname`.
    issue_self_signed("example.internal", &cert_path, &key_path, trust_dir.path());

    let mut server_engine = Engine::new(Some(trust_dir.path()), &[]).unwrap();
    server_engine.set_identity(&cert_path, &key_path).unwrap();
    let client_engine = Engine::new(Some(trust_dir.path()), &[]).unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let server = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        stream.set_nonblocking(true).unwrap();
        let fd = stream.as_raw_fd();
        std::mem::forget(stream);
        let mut ctx = server_engine.wrap_server(fd, Proto::Http11).unwrap();
        for _ in 0..100 {
            if ctx.wait_handshake() {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
    });

    thread::sleep(Duration::from_millis(20));
    let stream = TcpStream::connect(addr).unwrap();
    stream.set_nonblocking(true).unwrap();
    let fd = stream.as_raw_fd();
    std::mem::forget(stream);
    let mut client_ctx = client_engine
        .wrap_client(fd, "localhost", Proto::Http11)
        .unwrap();

    let mut completed = false;
    for _ in 0..100 {
        if client_ctx.wait_handshake() {
            completed = true;
            break;
        }
        thread::sleep(Duration::from_millis(5));
    }

    // The verify callback rejects the cert, so the handshake never reaches
    // `Phase::Established`; `wait_handshake` keeps returning `false`.
    assert!(!completed, "handshake should never complete against a mismatched hostname");
    let _ = server.join();
}
