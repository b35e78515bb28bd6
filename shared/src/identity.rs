//! Tunnel and request identifiers, host parsing and token comparison.

use subtle::ConstantTimeEq;

use crate::{Error, Result};

/// Shortest accepted stable tunnel id.
pub const MIN_ID_LEN: usize = 8;
/// Longest accepted stable tunnel id.
pub const MAX_ID_LEN: usize = 64;

const MAX_HOST_LEN: usize = 253;
const MAX_LABEL_LEN: usize = 63;

/// Fresh request id (UUID v4).
pub fn new_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Random token usable as a stable tunnel id.
pub fn random_stable_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(16);
    id
}

/// Drop everything except ASCII alphanumerics and lowercase the rest.
pub fn sanitize_stable_id(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// Lowercase alphanumeric, `MIN_ID_LEN..=MAX_ID_LEN` characters.
pub fn is_valid_stable_id(id: &str) -> bool {
    (MIN_ID_LEN..=MAX_ID_LEN).contains(&id.len())
        && id
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
}

/// Sanitize a client-supplied id and check it is usable as a DNS label.
pub fn validate_stable_id(raw: &str) -> Result<String> {
    let id = sanitize_stable_id(raw);
    if is_valid_stable_id(&id) {
        Ok(id)
    } else {
        Err(Error::InvalidStableId(format!(
            "'{}' must be {}-{} alphanumeric characters",
            raw, MIN_ID_LEN, MAX_ID_LEN
        )))
    }
}

/// Extract the stable id from the first label of a `Host` header value.
///
/// Returns `None` for anything that is not `<id>.<domain>[:port]` with a
/// valid id label.
pub fn stable_id_from_host(host: &str) -> Option<String> {
    let host = host.trim().to_ascii_lowercase();
    let host = match host.rsplit_once(':') {
        Some((name, port)) if port.bytes().all(|b| b.is_ascii_digit()) => name.to_string(),
        _ => host,
    };
    if host.is_empty() || host.len() > MAX_HOST_LEN {
        return None;
    }

    let mut labels = host.split('.');
    let label = labels.next()?;
    labels.next()?;

    if label.is_empty() || label.len() > MAX_LABEL_LEN || !is_dns_label(label) {
        return None;
    }
    is_valid_stable_id(label).then(|| label.to_string())
}

fn is_dns_label(label: &str) -> bool {
    let bytes = label.as_bytes();
    let edge_ok = |b: &u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    bytes.first().map_or(false, edge_ok)
        && bytes.last().map_or(false, edge_ok)
        && bytes.iter().all(|b| edge_ok(b) || *b == b'-')
}

/// Compare a provided secret against the expected one in constant time.
///
/// When the lengths differ the expected token is still compared against a
/// zeroed buffer of its own length, so the work done depends only on the
/// expected token.
pub fn constant_time_eq(provided: &str, expected: &str) -> bool {
    tokens_match(provided.as_bytes(), expected.as_bytes(), |a, b| a.ct_eq(b).into())
}

fn tokens_match<F>(provided: &[u8], expected: &[u8], eq: F) -> bool
where
    F: Fn(&[u8], &[u8]) -> bool,
{
    if provided.len() != expected.len() {
        let dummy = vec![0u8; expected.len()];
        let _ = std::hint::black_box(eq(expected, &dummy));
        return false;
    }
    eq(provided, expected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[test]
    fn test_sanitize_and_validate() {
        assert_eq!(sanitize_stable_id("AbC-123_def!"), "abc123def");
        assert_eq!(validate_stable_id("My-Tunnel-01").unwrap(), "mytunnel01");
        assert!(validate_stable_id("abc123").is_err());
        assert!(validate_stable_id(&"a".repeat(65)).is_err());
        assert!(is_valid_stable_id(&"a".repeat(64)));
        assert!(!is_valid_stable_id("ABCDEFGH"));
    }

    #[test]
    fn test_random_stable_id_is_valid() {
        let id = random_stable_id();
        assert_eq!(id.len(), 16);
        assert!(is_valid_stable_id(&id));
        assert_ne!(id, random_stable_id());
    }

    #[test]
    fn test_stable_id_from_host() {
        assert_eq!(
            stable_id_from_host("abc123ab.example.com"),
            Some("abc123ab".to_string())
        );
        assert_eq!(
            stable_id_from_host("ABC123AB.Example.com:8080"),
            Some("abc123ab".to_string())
        );
        assert_eq!(stable_id_from_host("localhost"), None);
        assert_eq!(stable_id_from_host("abc.example.com"), None);
        assert_eq!(stable_id_from_host("abc-1234.example.com"), None);
        assert_eq!(stable_id_from_host("-abc12345.example.com"), None);
        assert_eq!(stable_id_from_host(""), None);
    }

    #[test]
    fn test_constant_time_eq_values() {
        assert!(constant_time_eq("secret-token", "secret-token"));
        assert!(!constant_time_eq("secret-tok3n", "secret-token"));
        assert!(!constant_time_eq("Xecret-token", "secret-token"));
        assert!(!constant_time_eq("short", "secret-token"));
        assert!(!constant_time_eq("", "secret-token"));
    }

    #[test]
    fn test_length_mismatch_still_compares_expected_length() {
        let calls = RefCell::new(Vec::new());
        let eq = |a: &[u8], b: &[u8]| {
            calls.borrow_mut().push((a.len(), b.len()));
            bool::from(a.ct_eq(b))
        };

        assert!(!tokens_match(b"wrong", b"secret-token", eq));
        assert_eq!(calls.borrow().as_slice(), &[(12, 12)]);

        calls.borrow_mut().clear();
        assert!(!tokens_match(b"wrong-token!", b"secret-token", eq));
        assert!(tokens_match(b"secret-token", b"secret-token", eq));
        assert_eq!(calls.borrow().as_slice(), &[(12, 12), (12, 12)]);
    }
}
