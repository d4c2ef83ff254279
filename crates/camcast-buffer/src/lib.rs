//! Bounded relay buffer between capture output and network fan-out.
//!
//! The capture device pushes encoded bytes into a [`RelayBuffer`] from its
//! own thread; the broadcast loop drains it. A bounded buffer truncates
//! writes instead of blocking the producer, so a slow or absent consumer
//! never stalls real-time capture.

mod relay;
mod sink;

pub use relay::{BufferStats, RelayBuffer, RelayStream};
pub use sink::{ByteSink, RecordingControl};
