//! ALPN wire encoding and the protocol superset table.

use crate::types::Proto;

/// Ordered list of wire tokens a context advertises/accepts for `proto`,
/// widest-first: requesting HTTP/2 still accepts a downgrade to SPDY/1 or
/// HTTP/1.1 if that's all the peer supports.
fn superset(proto: Proto) -> &'static [&'static [u8]] {
    match proto {
        Proto::Http10 => &[b"http/1"],
        Proto::Http11 => &[b"http/1", b"http/1.1"],
        Proto::Spdy1 => &[b"spdy/1", b"http/1", b"http/1.1"],
        Proto::Http2 => &[b"h2", b"spdy/1", b"http/1", b"http/1.1"],
        Proto::Http3 => &[b"h2", b"h3", b"spdy/1", b"http/1", b"http/1.1"],
    }
}

/// Builds the length-prefixed ALPN wire advertisement for `proto`, per
/// RFC 7301: `[len][bytes]*`.
#[must_use]
pub fn wire_advertisement(proto: Proto) -> Vec<u8> {
    let mut wire = Vec::new();
    for token in superset(proto) {
        wire.push(token.len() as u8);
        wire.extend_from_slice(token);
    }
    wire
}

/// Picks the first entry in `server_order` that also appears in
/// `client_offered` (RFC 7301 selection is server-preference by convention;
/// `openssl::ssl::select_next_proto` implements exactly this scan).
#[must_use]
pub fn select(server_order: &[u8], client_offered: &[u8]) -> Option<Vec<u8>> {
    openssl::ssl::select_next_proto(server_order, client_offered)
        .ok()
        .map(<[u8]>::to_vec)
}

/// The downgrade rule: the negotiated wire token must match `desired`'s
/// token byte-for-byte (not a prefix or substring) or the negotiated
/// protocol silently becomes HTTP/1.1, mirroring an exact-size `memcmp`.
#[must_use]
pub fn negotiated_or_downgrade(wire: &[u8], desired: Proto) -> Proto {
    if wire == desired.wire_token() {
        desired
    } else {
        Proto::Http11
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http2_superset_includes_downgrades() {
        let wire = wire_advertisement(Proto::Http2);
        assert_eq!(wire, b"\x02h2\x06spdy/1\x06http/1\x08http/1.1");
    }

    #[test]
    fn exact_match_required_for_negotiated() {
        assert_eq!(negotiated_or_downgrade(b"h2", Proto::Http2), Proto::Http2);
        assert_eq!(negotiated_or_downgrade(b"h2x", Proto::Http2), Proto::Http11);
        assert_eq!(negotiated_or_downgrade(b"http/1.1", Proto::Http2), Proto::Http11);
    }

    #[test]
    fn select_picks_server_preference() {
        let server = wire_advertisement(Proto::Http2);
        let client = wire_advertisement(Proto::Http11);
        let picked = select(&server, &client).unwrap();
        assert_eq!(picked, b"http/1.1");
    }
}
