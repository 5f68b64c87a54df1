//! Admin REST handlers

pub mod auth;
pub mod orgs;
pub mod sse;
pub mod system;
pub mod tokens;
pub mod tunnels;
pub mod webhooks;
