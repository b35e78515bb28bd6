//! Header rewriting between the public HTTP side and the tunnel.

use std::net::IpAddr;

use axum::http::header::{HeaderMap, HeaderName, HeaderValue};
use proxyhub_shared::protocol::{HeaderList, HOP_BY_HOP};

/// Conditional request headers removed so the local service always answers
/// with a full body.
const CONDITIONAL: &[&str] = &["if-none-match", "if-modified-since"];

/// Context of the inbound public request.
#[derive(Debug, Clone)]
pub struct ForwardContext<'a> {
    pub peer: Option<IpAddr>,
    pub proto: &'a str,
    pub host: &'a str,
}

/// Request headers as sent to the tunnel client: lower-cased pairs in
/// arrival order, caching disabled, forwarding headers added.
pub fn forward_request_headers(headers: &HeaderMap, ctx: &ForwardContext<'_>) -> HeaderList {
    let mut out: HeaderList = headers
        .iter()
        .map(|(name, value)| (name.as_str().to_string(), header_text(value)))
        .filter(|(name, _)| !CONDITIONAL.contains(&name.as_str()))
        .collect();

    upsert(&mut out, "cache-control", "no-store");

    if let Some(ip) = ctx.peer {
        let chain = match find(&out, "x-forwarded-for") {
            Some(existing) => format!("{}, {}", existing, ip),
            None => ip.to_string(),
        };
        upsert(&mut out, "x-forwarded-for", &chain);
    }
    upsert(&mut out, "x-forwarded-proto", ctx.proto);
    if !ctx.host.is_empty() {
        upsert(&mut out, "x-forwarded-host", ctx.host);
    }
    out
}

/// Response headers from the tunnel client as an axum header map. Hop-by-hop
/// and malformed entries are skipped; repeated names are kept.
pub fn response_header_map(headers: &HeaderList) -> HeaderMap {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let lower = name.to_ascii_lowercase();
        if HOP_BY_HOP.contains(&lower.as_str()) {
            continue;
        }
        let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(lower.as_bytes()),
            HeaderValue::from_str(value),
        ) else {
            continue;
        };
        map.append(name, value);
    }
    map
}

fn header_text(value: &HeaderValue) -> String {
    match value.to_str() {
        Ok(s) => s.to_string(),
        Err(_) => String::from_utf8_lossy(value.as_bytes()).into_owned(),
    }
}

fn find<'h>(headers: &'h HeaderList, key: &str) -> Option<&'h str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(key))
        .map(|(_, v)| v.as_str())
}

/// Insert or update a header
fn upsert(headers: &mut HeaderList, key: &str, value: &str) {
    if let Some(h) = headers.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(key)) {
        h.1 = value.to_string();
    } else {
        headers.push((key.to_string(), value.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(peer: Option<&str>) -> ForwardContext<'static> {
        ForwardContext {
            peer: peer.map(|p| p.parse().unwrap()),
            proto: "https",
            host: "abc12345.example.com",
        }
    }

    #[test]
    fn test_forward_headers() {
        let mut h = HeaderMap::new();
        h.insert("host", "abc12345.example.com".parse().unwrap());
        h.insert("origin", "https://app.example.com".parse().unwrap());
        h.insert("If-None-Match", "\"etag\"".parse().unwrap());
        h.insert("if-modified-since", "yesterday".parse().unwrap());
        h.insert("cache-control", "max-age=60".parse().unwrap());
        h.append("accept", "text/html".parse().unwrap());
        h.append("accept", "application/json".parse().unwrap());

        let out = forward_request_headers(&h, &ctx(Some("10.0.0.1")));

        assert_eq!(find(&out, "host"), Some("abc12345.example.com"));
        assert_eq!(find(&out, "origin"), Some("https://app.example.com"));
        assert_eq!(find(&out, "if-none-match"), None);
        assert_eq!(find(&out, "if-modified-since"), None);
        assert_eq!(find(&out, "cache-control"), Some("no-store"));
        assert_eq!(out.iter().filter(|(k, _)| k == "accept").count(), 2);
        assert_eq!(find(&out, "x-forwarded-for"), Some("10.0.0.1"));
        assert_eq!(find(&out, "x-forwarded-proto"), Some("https"));
        assert_eq!(find(&out, "x-forwarded-host"), Some("abc12345.example.com"));
    }

    #[test]
    fn test_forwarded_for_chain_is_extended() {
        let mut h = HeaderMap::new();
        h.insert("x-forwarded-for", "1.2.3.4".parse().unwrap());
        let out = forward_request_headers(&h, &ctx(Some("10.0.0.1")));
        assert_eq!(find(&out, "x-forwarded-for"), Some("1.2.3.4, 10.0.0.1"));

        let out = forward_request_headers(&h, &ctx(None));
        assert_eq!(find(&out, "x-forwarded-for"), Some("1.2.3.4"));
    }

    #[test]
    fn test_response_headers_drop_hop_by_hop() {
        let list: HeaderList = vec![
            ("Content-Type".into(), "text/plain".into()),
            ("transfer-encoding".into(), "chunked".into()),
            ("Connection".into(), "keep-alive".into()),
            ("set-cookie".into(), "a=1".into()),
            ("set-cookie".into(), "b=2".into()),
            ("bad header".into(), "x".into()),
        ];
        let map = response_header_map(&list);
        assert_eq!(map.get("content-type").unwrap(), "text/plain");
        assert!(map.get("transfer-encoding").is_none());
        assert!(map.get("connection").is_none());
        assert_eq!(map.get_all("set-cookie").iter().count(), 2);
        assert_eq!(map.len(), 3);
    }
}
