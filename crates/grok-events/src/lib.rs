//! In-process eventing: the bus carrying tunnel/webhook events and the SSE
//! broker fanning them out to dashboard subscribers.

pub mod broker;
pub mod bus;

pub use broker::{Subscriber, SseBroker, DEFAULT_CLIENT_BUFFER};
pub use bus::{Event, EventBus, BUS_CAPACITY};
