//! Live-tunnel authority: TCP port pool, channel handles, and the registry
//! mapping public addresses (subdomain or port) to connected clients.

pub mod handle;
pub mod pool;
pub mod registry;

pub use handle::{
    ChannelError, ResponseChunk, TcpStreamEvent, TunnelCounters, TunnelHandle, TunnelMeta,
    OUTBOUND_QUEUE_CAPACITY,
};
pub use pool::{PoolError, PoolStats, PortPool};
pub use registry::{RegistryError, TunnelRegistry};
