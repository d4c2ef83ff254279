//! UDP live-stream distribution.
//!
//! Subscribers announce themselves with `login` datagrams and keep their
//! subscription alive with `ping`. The [`BroadcastLoop`] starts the camera
//! stream when the first subscriber joins, fans encoded bytes out to every
//! subscriber, and stops the stream once the last one times out.

mod broadcast;
mod config;
mod error;
mod protocol;
mod registry;
mod stats;

pub use broadcast::BroadcastLoop;
pub use config::BroadcastConfig;
pub use error::TransportError;
pub use protocol::{ControlMessage, MAX_CONTROL_DATAGRAM};
pub use registry::SubscriptionRegistry;
pub use stats::{BroadcastSnapshot, BroadcastStats};

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Well-known server port.
pub const DEFAULT_PORT: u16 = 8442;

/// Largest payload a single UDP datagram can carry over IPv4.
pub const MAX_UDP_PAYLOAD: usize = 65_507;
