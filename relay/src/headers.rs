//! Header rewriting for forwarded traffic
//!
//! Strips hop-by-hop headers in both directions and injects the standard
//! forwarding headers on requests sent through a tunnel.

/// Headers that describe a single connection and must not be forwarded.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

#[derive(Debug, Clone)]
pub struct HeaderRewriter {
    /// Inject X-Forwarded-* headers
    pub inject_forwarded: bool,
}

impl Default for HeaderRewriter {
    fn default() -> Self {
        Self { inject_forwarded: true }
    }
}

impl HeaderRewriter {
    /// Rewrite request headers before they go through the tunnel
    pub fn rewrite_request(
        &self,
        headers: &mut Vec<(String, String)>,
        client_ip: Option<&str>,
        host: &str,
    ) {
        strip_hop_by_hop(headers);

        if self.inject_forwarded {
            if let Some(ip) = client_ip {
                append(headers, "X-Forwarded-For", ip);
            }
            if !host.is_empty() {
                upsert(headers, "X-Forwarded-Host", host);
            }
            upsert(headers, "X-Forwarded-Proto", "http");
        }
    }

    /// Rewrite response headers before they reach the external caller.
    ///
    /// Content-Length is dropped as well; the relay frames the body itself.
    pub fn rewrite_response(&self, headers: &mut Vec<(String, String)>) {
        strip_hop_by_hop(headers);
        headers.retain(|(name, _)| !name.eq_ignore_ascii_case("content-length"));
    }
}

fn strip_hop_by_hop(headers: &mut Vec<(String, String)>) {
    // Headers named in Connection are connection-scoped too.
    let listed: Vec<String> = headers
        .iter()
        .filter(|(k, _)| k.eq_ignore_ascii_case("connection"))
        .flat_map(|(_, v)| v.split(',').map(|s| s.trim().to_ascii_lowercase()))
        .filter(|s| !s.is_empty())
        .collect();

    headers.retain(|(name, _)| {
        let name = name.to_ascii_lowercase();
        !HOP_BY_HOP.contains(&name.as_str()) && !listed.contains(&name)
    });
}

/// Insert or update a header
fn upsert(headers: &mut Vec<(String, String)>, key: &str, value: &str) {
    if let Some(h) = headers.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(key)) {
        h.1 = value.to_string();
    } else {
        headers.push((key.to_string(), value.to_string()));
    }
}

/// Extend a comma-separated header, or insert it
fn append(headers: &mut Vec<(String, String)>, key: &str, value: &str) {
    if let Some(h) = headers.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(key)) {
        h.1 = format!("{}, {}", h.1, value);
    } else {
        headers.push((key.to_string(), value.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forwarded_headers() {
        let rw = HeaderRewriter::default();
        let mut h = vec![("Host".into(), "demo".into())];
        rw.rewrite_request(&mut h, Some("1.2.3.4"), "demo");
        assert!(h.iter().any(|(k, v)| k == "X-Forwarded-For" && v == "1.2.3.4"));
        assert!(h.iter().any(|(k, v)| k == "X-Forwarded-Host" && v == "demo"));
        assert!(h.iter().any(|(k, v)| k == "X-Forwarded-Proto" && v == "http"));
    }

    #[test]
    fn test_forwarded_for_chain() {
        let rw = HeaderRewriter::default();
        let mut h = vec![("x-forwarded-for".into(), "10.0.0.1".into())];
        rw.rewrite_request(&mut h, Some("1.2.3.4"), "");
        assert_eq!(h[0].1, "10.0.0.1, 1.2.3.4");
        assert!(!h.iter().any(|(k, _)| k == "X-Forwarded-Host"));
    }

    #[test]
    fn test_hop_by_hop_removed() {
        let rw = HeaderRewriter { inject_forwarded: false };
        let mut h = vec![
            ("Connection".into(), "keep-alive, X-Trace".into()),
            ("Keep-Alive".into(), "timeout=5".into()),
            ("X-Trace".into(), "abc".into()),
            ("Accept".into(), "*/*".into()),
        ];
        rw.rewrite_request(&mut h, None, "demo");
        assert_eq!(h, vec![("Accept".to_string(), "*/*".to_string())]);
    }

    #[test]
    fn test_response_drops_framing_headers() {
        let rw = HeaderRewriter::default();
        let mut h = vec![
            ("Content-Length".into(), "5".into()),
            ("Transfer-Encoding".into(), "chunked".into()),
            ("Content-Type".into(), "text/plain".into()),
        ];
        rw.rewrite_response(&mut h);
        assert_eq!(h, vec![("Content-Type".to_string(), "text/plain".to_string())]);
    }
}
