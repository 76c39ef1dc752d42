//! DTLS stateless cookie exchange: an HMAC-SHA1 over the peer's `(ip, port)`
//! keyed by a 16-byte secret initialized once, process-wide, from the TLS
//! library's CSPRNG.
//!
//! The secret and its init flag are global mutable state, modeled here as a
//! [`once_cell::sync::OnceCell`] rather than a `static mut` guarded by a
//! hand-rolled flag.

use std::cell::Cell;
use std::net::IpAddr;

use hmac::{Hmac, Mac};
use once_cell::sync::OnceCell;
use sha1::Sha1;

use crate::error::{NetError, Result};

type HmacSha1 = Hmac<Sha1>;

static SECRET: OnceCell<[u8; 16]> = OnceCell::new();

fn secret() -> Result<&'static [u8; 16]> {
    SECRET.get_or_try_init(|| {
        let mut buf = [0_u8; 16];
        openssl::rand::rand_bytes(&mut buf)
            .map_err(|e| NetError::InitFailure(format!("CSPRNG seed failed: {e}")))?;
        Ok(buf)
    })
}

thread_local! {
    /// The peer address the next cookie generate/verify callback should use.
    /// OpenSSL's cookie callbacks receive only the `SSL*`/BIO, not a Rust
    /// peer-address value; the context sets this immediately before handing
    /// control to the handshake so the callback (invoked synchronously, on
    /// the same thread, during that call) can read it back.
    static CURRENT_PEER: Cell<Option<(IpAddr, u16)>> = const { Cell::new(None) };
}

pub fn set_current_peer(peer: (IpAddr, u16)) {
    CURRENT_PEER.with(|c| c.set(Some(peer)));
}

fn current_peer() -> Option<(IpAddr, u16)> {
    CURRENT_PEER.with(Cell::get)
}

fn encode_peer(ip: IpAddr, port: u16) -> Vec<u8> {
    let mut buf = match ip {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    };
    buf.extend_from_slice(&port.to_be_bytes());
    buf
}

fn hmac_over(ip: IpAddr, port: u16) -> Result<[u8; 20]> {
    let mut mac = HmacSha1::new_from_slice(secret()?).expect("16-byte key always valid for HMAC");
    mac.update(&encode_peer(ip, port));
    let digest = mac.finalize().into_bytes();
    let mut out = [0_u8; 20];
    out.copy_from_slice(&digest);
    Ok(out)
}

/// Called from the `SSL_CTX` cookie-generate callback: produces the 20-byte
/// cookie for whatever peer `set_current_peer` was last called with.
pub fn generate() -> Result<[u8; 20]> {
    let (ip, port) = current_peer().ok_or_else(|| {
        NetError::Tls("cookie generate called with no current peer set".into())
    })?;
    hmac_over(ip, port)
}

/// Called from the `SSL_CTX` cookie-verify callback.
#[must_use]
pub fn verify(cookie: &[u8]) -> bool {
    let Some((ip, port)) = current_peer() else {
        return false;
    };
    let Ok(expected) = hmac_over(ip, port) else {
        return false;
    };
    constant_time_eq(cookie, &expected)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0_u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::net::Ipv4Addr;

    #[test]
    #[serial]
    fn cookie_round_trips_for_same_peer() {
        set_current_peer((IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 4433));
        let cookie = generate().unwrap();
        assert!(verify(&cookie));
    }

    #[test]
    #[serial]
    fn cookie_rejects_different_peer() {
        set_current_peer((IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 4433));
        let cookie = generate().unwrap();
        set_current_peer((IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 4434));
        assert!(!verify(&cookie));
    }
}
