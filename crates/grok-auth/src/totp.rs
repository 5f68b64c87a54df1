//! TOTP second factor

use thiserror::Error;
use totp_rs::{Algorithm, Secret, TOTP};

/// TOTP errors
#[derive(Debug, Error)]
pub enum TotpError {
    #[error("Invalid TOTP secret: {0}")]
    InvalidSecret(String),
}

/// Generate a fresh base32 secret for 2FA enrollment.
pub fn generate_totp_secret() -> String {
    Secret::generate_secret().to_encoded().to_string()
}

/// Verify a 6-digit code against a stored base32 secret.
///
/// Accepts one 30-second step of clock skew in either direction.
pub fn verify_totp(secret_b32: &str, code: &str) -> Result<bool, TotpError> {
    let secret = Secret::Encoded(secret_b32.to_string())
        .to_bytes()
        .map_err(|e| TotpError::InvalidSecret(format!("{e:?}")))?;

    let totp = TOTP::new(Algorithm::SHA1, 6, 1, 30, secret)
        .map_err(|e| TotpError::InvalidSecret(e.to_string()))?;

    totp.check_current(code)
        .map_err(|e| TotpError::InvalidSecret(e.to_string()))
}
