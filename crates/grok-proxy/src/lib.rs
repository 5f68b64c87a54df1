//! Public-facing proxy front-ends
//!
//! The HTTP front-end resolves a request's host to a live tunnel and streams
//! the exchange through the client channel; the TCP front-end bridges raw
//! byte streams on allocated ports. The webhook fan-out router plugs in via
//! [`WebhookHandler`].

pub mod body;
pub mod forward;
pub mod headers;
pub mod host;
pub mod http;
pub mod tcp;
pub mod tls;

pub use crate::http::{HttpFrontend, ProxySettings, WebhookHandler};
pub use body::ProxyBody;
pub use forward::{forward_once, ForwardError, TunnelResponse};
pub use host::HostTarget;
pub use tcp::TcpFrontend;
