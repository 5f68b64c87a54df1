//! Proxy header rewriting
//!
//! Hop-by-hop headers (RFC 7230 §6.1) are stripped in both directions,
//! including any tokens named by the Connection header. Forwarding metadata
//! is added on the way in.

use http::header::{HeaderMap, HeaderName};

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

/// Convert a header map to the wire representation, dropping hop-by-hop
/// headers and anything listed in `Connection`.
pub fn to_wire_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    let connection_tokens: Vec<String> = headers
        .get_all(http::header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|t| t.trim().to_ascii_lowercase())
        .collect();

    headers
        .iter()
        .filter(|(name, _)| {
            let name = name.as_str().to_ascii_lowercase();
            !HOP_BY_HOP.contains(&name.as_str()) && !connection_tokens.contains(&name)
        })
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

/// Append the forwarding metadata the client's local service expects.
pub fn add_forwarding_headers(
    wire: &mut Vec<(String, String)>,
    client_ip: &str,
    proto: &str,
    host: &str,
) {
    match wire
        .iter_mut()
        .find(|(name, _)| name.eq_ignore_ascii_case("x-forwarded-for"))
    {
        Some((_, value)) => {
            value.push_str(", ");
            value.push_str(client_ip);
        }
        None => wire.push(("x-forwarded-for".to_string(), client_ip.to_string())),
    }
    wire.retain(|(name, _)| {
        !name.eq_ignore_ascii_case("x-forwarded-proto")
            && !name.eq_ignore_ascii_case("x-forwarded-host")
    });
    wire.push(("x-forwarded-proto".to_string(), proto.to_string()));
    wire.push(("x-forwarded-host".to_string(), host.to_string()));
}

/// Rebuild a response header map from wire headers, dropping hop-by-hop.
pub fn from_wire_headers(wire: &[(String, String)]) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in wire {
        let lowered = name.to_ascii_lowercase();
        if HOP_BY_HOP.contains(&lowered.as_str()) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            lowered.parse::<HeaderName>(),
            value.parse::<http::HeaderValue>(),
        ) {
            headers.append(name, value);
        }
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::HeaderValue;

    #[test]
    fn test_hop_by_hop_stripped() {
        let mut headers = HeaderMap::new();
        headers.insert("host", HeaderValue::from_static("api.example.com"));
        headers.insert("connection", HeaderValue::from_static("keep-alive"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("accept", HeaderValue::from_static("*/*"));

        let wire = to_wire_headers(&headers);
        let names: Vec<&str> = wire.iter().map(|(n, _)| n.as_str()).collect();
        assert!(names.contains(&"host"));
        assert!(names.contains(&"accept"));
        assert!(!names.contains(&"connection"));
        assert!(!names.contains(&"keep-alive"));
        assert!(!names.contains(&"transfer-encoding"));
    }

    #[test]
    fn test_connection_tokens_stripped() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("x-custom-hop"));
        headers.insert("x-custom-hop", HeaderValue::from_static("1"));
        headers.insert("x-keep", HeaderValue::from_static("2"));

        let wire = to_wire_headers(&headers);
        let names: Vec<&str> = wire.iter().map(|(n, _)| n.as_str()).collect();
        assert!(!names.contains(&"x-custom-hop"));
        assert!(names.contains(&"x-keep"));
    }

    #[test]
    fn test_forwarded_for_appends() {
        let mut wire = vec![("x-forwarded-for".to_string(), "10.0.0.1".to_string())];
        add_forwarding_headers(&mut wire, "203.0.113.9", "https", "api.grok.sh");

        let xff = wire
            .iter()
            .find(|(n, _)| n == "x-forwarded-for")
            .map(|(_, v)| v.clone())
            .unwrap();
        assert_eq!(xff, "10.0.0.1, 203.0.113.9");

        assert!(wire
            .iter()
            .any(|(n, v)| n == "x-forwarded-proto" && v == "https"));
        assert!(wire
            .iter()
            .any(|(n, v)| n == "x-forwarded-host" && v == "api.grok.sh"));
    }

    #[test]
    fn test_forwarded_for_created() {
        let mut wire = vec![];
        add_forwarding_headers(&mut wire, "203.0.113.9", "http", "api.grok.sh");
        assert!(wire
            .iter()
            .any(|(n, v)| n == "x-forwarded-for" && v == "203.0.113.9"));
    }

    #[test]
    fn test_from_wire_drops_hop_by_hop() {
        let wire = vec![
            ("content-type".to_string(), "text/plain".to_string()),
            ("connection".to_string(), "close".to_string()),
            ("upgrade".to_string(), "h2c".to_string()),
        ];
        let headers = from_wire_headers(&wire);
        assert!(headers.contains_key("content-type"));
        assert!(!headers.contains_key("connection"));
        assert!(!headers.contains_key("upgrade"));
    }
}
