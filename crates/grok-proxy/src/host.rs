//! Host header parsing
//!
//! Public hosts look like `{label}.{base_domain}`. The leftmost label is the
//! full tunnel subdomain; labels ending in `-webhook` divert to the fan-out
//! router.

/// Where a public request should go
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostTarget {
    /// `{subdomain}.{base}` -> tunnel lookup by full subdomain
    Tunnel(String),
    /// `{app}-{org}-webhook.{base}` -> webhook app `{app}-{org}`
    Webhook(String),
    /// Host does not belong to the configured base domain
    Unrecognized,
}

/// Classify a Host header value against the configured base domain.
pub fn classify(host: &str, base_domain: &str) -> HostTarget {
    // Strip the port, tolerating IPv6 literals (which never match anyway)
    let host = host.rsplit_once(':').map_or(host, |(h, port)| {
        if port.chars().all(|c| c.is_ascii_digit()) {
            h
        } else {
            host
        }
    });
    let host = host.to_ascii_lowercase();
    let base = base_domain.to_ascii_lowercase();

    let Some(prefix) = host.strip_suffix(&base) else {
        return HostTarget::Unrecognized;
    };
    let Some(prefix) = prefix.strip_suffix('.') else {
        return HostTarget::Unrecognized;
    };
    if prefix.is_empty() || prefix.contains('.') {
        // Bare base domain, or more than one label deep
        return HostTarget::Unrecognized;
    }

    match prefix.strip_suffix("-webhook") {
        Some(app) if !app.is_empty() => HostTarget::Webhook(app.to_string()),
        _ => HostTarget::Tunnel(prefix.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tunnel_host() {
        assert_eq!(
            classify("api-acme.grok.sh", "grok.sh"),
            HostTarget::Tunnel("api-acme".to_string())
        );
    }

    #[test]
    fn test_tunnel_host_with_port() {
        assert_eq!(
            classify("api-acme.grok.sh:8000", "grok.sh"),
            HostTarget::Tunnel("api-acme".to_string())
        );
    }

    #[test]
    fn test_webhook_host() {
        assert_eq!(
            classify("pay-acme-webhook.grok.sh", "grok.sh"),
            HostTarget::Webhook("pay-acme".to_string())
        );
    }

    #[test]
    fn test_case_insensitive() {
        assert_eq!(
            classify("API-ACME.Grok.SH", "grok.sh"),
            HostTarget::Tunnel("api-acme".to_string())
        );
    }

    #[test]
    fn test_bare_domain_unrecognized() {
        assert_eq!(classify("grok.sh", "grok.sh"), HostTarget::Unrecognized);
    }

    #[test]
    fn test_foreign_domain_unrecognized() {
        assert_eq!(classify("api.other.io", "grok.sh"), HostTarget::Unrecognized);
        // Suffix match must be on a label boundary
        assert_eq!(classify("api.notgrok.sh", "grok.sh"), HostTarget::Unrecognized);
    }

    #[test]
    fn test_deep_subdomain_unrecognized() {
        assert_eq!(
            classify("a.b.grok.sh", "grok.sh"),
            HostTarget::Unrecognized
        );
    }

    #[test]
    fn test_bare_webhook_suffix_is_tunnel() {
        // "-webhook" alone has no app part; treat as an ordinary subdomain
        assert_eq!(
            classify("-webhook.grok.sh", "grok.sh"),
            HostTarget::Tunnel("-webhook".to_string())
        );
    }
}
