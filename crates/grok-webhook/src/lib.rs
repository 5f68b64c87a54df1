//! Webhook fan-out: one inbound request delivered concurrently to every
//! enabled route of a webhook app, with response aggregation, per-route
//! health tracking, and event capture.

pub mod health;
pub mod router;

pub use health::{route_health_after, HealthStatus, UNHEALTHY_THRESHOLD};
pub use router::{WebhookRouter, WebhookSettings};

/// Webhook app names are lowercase slugs: `[a-z0-9][a-z0-9-]*`.
pub fn validate_app_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c.is_ascii_digit() => {}
        _ => return false,
    }
    name.len() <= 63
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_app_name() {
        assert!(validate_app_name("pay"));
        assert!(validate_app_name("pay-2"));
        assert!(validate_app_name("0pay"));
        assert!(!validate_app_name(""));
        assert!(!validate_app_name("-pay"));
        assert!(!validate_app_name("Pay"));
        assert!(!validate_app_name("pay_roll"));
        assert!(!validate_app_name(&"a".repeat(64)));
    }
}
