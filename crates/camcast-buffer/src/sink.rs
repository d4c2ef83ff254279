//! Producer-side traits.

/// Push-style consumer of encoded bytes.
///
/// Implementations must never block the caller for longer than a short
/// critical section. A return value smaller than `chunk.len()` is the only
/// backpressure signal: the unaccepted tail is the producer's to drop.
pub trait ByteSink: Send + Sync {
    /// Offer a chunk. Returns the number of leading bytes accepted.
    fn write(&self, chunk: &[u8]) -> usize;
}

/// Halts whatever is currently producing into a sink.
pub trait RecordingControl: Send + Sync {
    /// Stop the producer. Must be idempotent.
    fn stop_recording(&self);
}
