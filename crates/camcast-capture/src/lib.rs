//! Camera capture lifecycle.
//!
//! [`CaptureManager`] owns a single camera device. The device is opened on
//! first use, shared by still, clip and live-stream operations, and closed
//! again once nothing has used it for the configured idle period.

mod config;
mod device;
mod error;
mod libcamera;
mod manager;
mod schedule;
mod synthetic;

pub use config::{CaptureConfig, DeviceConfig, LibcameraConfig, SyntheticConfig};
pub use device::{CameraDevice, CaptureSettings, DeviceFactory, RecordingOutput, Resolution};
pub use error::CaptureError;
pub use libcamera::LibcameraDevice;
pub use manager::{Activity, CaptureManager, DeviceStatus};
pub use schedule::ScheduledTask;
pub use synthetic::{SyntheticCamera, SyntheticProbe};

/// Result type for capture operations.
pub type CaptureResult<T> = Result<T, CaptureError>;

/// Build the factory for a configured device kind.
pub fn device_factory(config: &DeviceConfig) -> DeviceFactory {
    match config {
        DeviceConfig::Synthetic(synthetic) => {
            SyntheticCamera::factory(synthetic.clone(), SyntheticProbe::new())
        }
        DeviceConfig::Libcamera(libcamera) => LibcameraDevice::factory(libcamera.clone()),
    }
}
