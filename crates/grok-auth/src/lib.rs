//! Authentication helpers: session JWTs, password hashing, client tokens, TOTP

pub mod jwt;
pub mod password;
pub mod token;
pub mod totp;

pub use jwt::{JwtClaims, JwtError, JwtValidator};
pub use password::{hash_password, verify_password, PasswordError};
pub use token::{generate_client_token, hash_token};
pub use totp::{generate_totp_secret, verify_totp, TotpError};
