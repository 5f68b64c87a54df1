//! Control-channel protocol for the grok relay
//!
//! Messages are bincode-serialized and carried one per length-delimited frame.
//! The contract is message-at-a-time with request correlation ids; nothing in
//! here assumes FIFO responses from the client.

pub mod frame;
pub mod messages;

pub use frame::{codec, decode_message, encode_message, ProtoError};
pub use messages::{
    ControlMessage, EndpointRequest, RegisterOptions, TunnelStatus, TunnelType,
};

/// Maximum payload carried by a single frame (1 MiB).
///
/// Larger HTTP bodies are split into multiple body frames by the sender.
pub const MAX_FRAME_SIZE: u32 = 1024 * 1024;

/// Stream id space for TCP bridging; 0 is never issued.
pub const FIRST_TCP_STREAM_ID: u32 = 1;
