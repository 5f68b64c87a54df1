//! Control plane: client authentication, tunnel registration and lifecycle,
//! and the framed TCP listener driving each client channel.

pub mod connection;
pub mod handler;
pub mod recovery;

pub use connection::{ControlListener, ControlListenerConfig};
pub use handler::{RegisterError, ServiceSettings, TunnelService};
pub use recovery::recover_pool;
