//! Hostname verification: walks `subjectAltName` DNS entries, falling back
//! to the Common Name, with RFC 6125-style wildcard matching that excludes
//! IDN (`xn--`) labels and never matches an embedded wildcard.

use openssl::nid::Nid;
use openssl::x509::X509Ref;

/// True if `cert` is valid for `host` under SAN-first, CN-fallback matching.
#[must_use]
pub fn matches_hostname(cert: &X509Ref, host: &str) -> bool {
    if let Some(sans) = cert.subject_alt_names() {
        let dns_names: Vec<&str> = sans.iter().filter_map(|gn| gn.dnsname()).collect();
        if !dns_names.is_empty() {
            return dns_names.iter().any(|pattern| label_matches(pattern, host));
        }
    }
    cert.subject_name()
        .entries_by_nid(Nid::COMMONNAME)
        .next()
        .and_then(|entry| entry.data().as_utf8().ok())
        .is_some_and(|cn| label_matches(cn.as_ref(), host))
}

/// A wildcard `*` matches any single leading label, except when the
/// candidate label is itself a punycode (`xn--`) label; a `*` embedded
/// inside a larger label (e.g. `f*o.example.com`) is not treated as a
/// wildcard at all and can only match literally.
fn label_matches(pattern: &str, host: &str) -> bool {
    if pattern.eq_ignore_ascii_case(host) {
        return true;
    }
    let mut p_iter = pattern.split('.');
    let mut h_iter = host.split('.');
    let (Some(p_first), Some(h_first)) = (p_iter.next(), h_iter.next()) else {
        return false;
    };
    if p_first != "*" || h_first.starts_with("xn--") {
        return false;
    }
    let p_rest: Vec<&str> = p_iter.collect();
    let h_rest: Vec<&str> = h_iter.collect();
    p_rest.len() == h_rest.len()
        && p_rest
            .iter()
            .zip(h_rest.iter())
            .all(|(a, b)| a.eq_ignore_ascii_case(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match() {
        assert!(label_matches("example.com", "example.com"));
    }

    #[test]
    fn wildcard_matches_one_label() {
        assert!(label_matches("*.example.com", "api.example.com"));
        assert!(!label_matches("*.example.com", "a.b.example.com"));
    }

    #[test]
    fn wildcard_rejects_idn_candidate() {
        assert!(!label_matches("*.example.com", "xn--p1ai.example.com"));
    }

    #[test]
    fn embedded_wildcard_never_matches() {
        assert!(!label_matches("f*o.example.com", "foo.example.com"));
    }

    #[test]
    fn mismatched_domain_fails() {
        assert!(!label_matches("*.example.com", "api.example.org"));
    }
}
