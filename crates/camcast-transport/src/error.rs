//! Error types for the transport module.

use std::net::SocketAddr;

use camcast_capture::CaptureError;
use thiserror::Error;

/// Errors that can occur during transport operations.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The broadcast socket could not be bound.
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The capture session could not be started.
    #[error("Capture error: {0}")]
    Capture(#[from] CaptureError),
}
