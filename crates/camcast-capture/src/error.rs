//! Error types for the capture module.

use std::process::ExitStatus;

use thiserror::Error;

/// Errors that can occur during capture operations.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// The device could not be opened.
    #[error("Capture device unavailable: {0}")]
    DeviceUnavailable(String),

    /// A device operation failed.
    #[error("Capture device error: {0}")]
    Device(String),

    /// Another capture operation holds the device.
    #[error("Capture device busy: {0}")]
    Busy(&'static str),

    /// An external capture tool exited unsuccessfully.
    #[error("Capture command `{command}` failed with {status}")]
    CommandFailed { command: String, status: ExitStatus },

    /// Recording was requested while already recording.
    #[error("Recording already started")]
    AlreadyRecording,

    /// The manager has been shut down.
    #[error("Capture manager shut down")]
    ShutDown,

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
