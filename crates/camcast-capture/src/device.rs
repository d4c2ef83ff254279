//! Camera device abstraction.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use camcast_buffer::ByteSink;
use serde::{Deserialize, Serialize};

use crate::CaptureResult;

/// Frame dimensions in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    /// Create a new resolution.
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl From<(u32, u32)> for Resolution {
    fn from((width, height): (u32, u32)) -> Self {
        Self { width, height }
    }
}

/// Sensor mode applied before a capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureSettings {
    pub resolution: Resolution,
    pub frame_rate: u32,
}

/// Where a recording goes.
#[derive(Clone)]
pub enum RecordingOutput {
    /// Encode into a file.
    File(PathBuf),

    /// Push encoded bytes into a sink.
    Sink(Arc<dyn ByteSink>),
}

impl fmt::Debug for RecordingOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File(path) => f.debug_tuple("File").field(path).finish(),
            Self::Sink(_) => f.write_str("Sink(..)"),
        }
    }
}

/// An opened camera.
///
/// Calls are serialized by [`CaptureManager`](crate::CaptureManager); a
/// device never sees two operations at once.
pub trait CameraDevice: Send {
    /// Apply resolution and frame rate for the next capture.
    fn configure(&mut self, settings: CaptureSettings) -> CaptureResult<()>;

    /// Capture a single JPEG still into `path`.
    fn capture_still(&mut self, path: &Path) -> CaptureResult<()>;

    /// Start continuous H.264 encoding into `output`. Returns immediately.
    fn start_recording(&mut self, output: RecordingOutput) -> CaptureResult<()>;

    /// Stop the current recording. No-op when not recording.
    fn stop_recording(&mut self) -> CaptureResult<()>;

    /// Whether a recording is in progress.
    ///
    /// A recording whose encoder ended on its own reports `false` but still
    /// needs [`stop_recording`](Self::stop_recording) to release it.
    fn is_recording(&mut self) -> bool;

    /// Release the hardware. The device is not used afterwards.
    fn close(&mut self) -> CaptureResult<()>;

    /// Device name for diagnostics.
    fn name(&self) -> &'static str;
}

/// Opens a fresh device on demand.
pub type DeviceFactory = Arc<dyn Fn() -> CaptureResult<Box<dyn CameraDevice>> + Send + Sync>;
