//! Capture configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::device::{CaptureSettings, Resolution};

/// Lifecycle and sensor-mode settings for [`CaptureManager`](crate::CaptureManager).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Directory for still and clip artifacts.
    pub artifact_dir: PathBuf,

    /// Default still resolution.
    pub still_resolution: Resolution,

    /// Frame rate applied for stills.
    pub still_frame_rate: u32,

    /// A still younger than this is reused instead of recaptured.
    pub image_freshness_ms: u64,

    /// Clip resolution.
    pub clip_resolution: Resolution,

    /// Clip frame rate.
    pub clip_frame_rate: u32,

    /// Length of a clip.
    pub clip_duration_ms: u64,

    /// Delay before an auto-deleted clip is removed.
    pub clip_delete_delay_ms: u64,

    /// Live stream resolution.
    pub stream_resolution: Resolution,

    /// Live stream frame rate.
    pub stream_frame_rate: u32,

    /// Unused device is closed after this long.
    pub idle_timeout_ms: u64,

    /// Idle countdown granularity.
    pub idle_tick_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            artifact_dir: std::env::temp_dir(),
            still_resolution: Resolution::new(2592, 1944),
            still_frame_rate: 15,
            image_freshness_ms: 1000 / 15,
            clip_resolution: Resolution::new(1920, 1080),
            clip_frame_rate: 30,
            clip_duration_ms: 15_000,
            clip_delete_delay_ms: 2_000,
            stream_resolution: Resolution::new(1920, 1080),
            stream_frame_rate: 30,
            idle_timeout_ms: 300_000,
            idle_tick_ms: 10_000,
        }
    }
}

impl CaptureConfig {
    /// Set the artifact directory.
    pub fn artifact_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.artifact_dir = dir.into();
        self
    }

    /// Set the still freshness window.
    pub fn image_freshness(mut self, window: Duration) -> Self {
        self.image_freshness_ms = window.as_millis() as u64;
        self
    }

    /// Set the clip length.
    pub fn clip_duration(mut self, duration: Duration) -> Self {
        self.clip_duration_ms = duration.as_millis() as u64;
        self
    }

    /// Set the clip deletion delay.
    pub fn clip_delete_delay(mut self, delay: Duration) -> Self {
        self.clip_delete_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Set the idle timeout and countdown tick.
    pub fn idle_timeout(mut self, timeout: Duration, tick: Duration) -> Self {
        self.idle_timeout_ms = timeout.as_millis() as u64;
        self.idle_tick_ms = tick.as_millis() as u64;
        self
    }

    pub fn image_freshness_window(&self) -> Duration {
        Duration::from_millis(self.image_freshness_ms)
    }

    pub fn clip_duration_time(&self) -> Duration {
        Duration::from_millis(self.clip_duration_ms)
    }

    pub fn clip_delete_delay_time(&self) -> Duration {
        Duration::from_millis(self.clip_delete_delay_ms)
    }

    pub fn idle_timeout_time(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Tick interval, never zero.
    pub fn idle_tick_time(&self) -> Duration {
        Duration::from_millis(self.idle_tick_ms.max(1))
    }

    /// Settings for a still, with an optional resolution override.
    pub fn still_settings(&self, resolution: Option<Resolution>) -> CaptureSettings {
        CaptureSettings {
            resolution: resolution.unwrap_or(self.still_resolution),
            frame_rate: self.still_frame_rate,
        }
    }

    pub fn clip_settings(&self) -> CaptureSettings {
        CaptureSettings {
            resolution: self.clip_resolution,
            frame_rate: self.clip_frame_rate,
        }
    }

    pub fn stream_settings(&self) -> CaptureSettings {
        CaptureSettings {
            resolution: self.stream_resolution,
            frame_rate: self.stream_frame_rate,
        }
    }
}

/// Which camera implementation to open.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum DeviceConfig {
    /// Software pattern generator.
    Synthetic(SyntheticConfig),

    /// Raspberry Pi camera through the libcamera apps.
    Libcamera(LibcameraConfig),
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self::Libcamera(LibcameraConfig::default())
    }
}

impl DeviceConfig {
    /// Short name of the device kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Synthetic(_) => "synthetic",
            Self::Libcamera(_) => "libcamera",
        }
    }
}

/// Settings for [`SyntheticCamera`](crate::SyntheticCamera).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyntheticConfig {
    /// Bytes per produced chunk.
    pub chunk_size: usize,

    /// Delay between chunks.
    pub chunk_interval_ms: u64,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            chunk_size: 4096,
            chunk_interval_ms: 33,
        }
    }
}

/// Settings for [`LibcameraDevice`](crate::LibcameraDevice).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LibcameraConfig {
    /// Still capture tool.
    pub still_command: String,

    /// Video capture tool.
    pub video_command: String,

    /// Extra arguments appended to every invocation.
    pub extra_args: Vec<String>,
}

impl Default for LibcameraConfig {
    fn default() -> Self {
        Self {
            still_command: "libcamera-still".to_string(),
            video_command: "libcamera-vid".to_string(),
            extra_args: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CaptureConfig::default();

        assert_eq!(config.still_resolution, Resolution::new(2592, 1944));
        assert_eq!(config.still_frame_rate, 15);
        assert_eq!(config.image_freshness_window(), Duration::from_millis(66));
        assert_eq!(config.clip_duration_time(), Duration::from_secs(15));
        assert_eq!(config.idle_timeout_time(), Duration::from_secs(300));
        assert_eq!(config.idle_tick_time(), Duration::from_secs(10));
    }

    #[test]
    fn test_still_settings_override() {
        let config = CaptureConfig::default();

        let low = config.still_settings(Some(Resolution::new(648, 486)));
        assert_eq!(low.resolution, Resolution::new(648, 486));
        assert_eq!(low.frame_rate, 15);

        let full = config.still_settings(None);
        assert_eq!(full.resolution, config.still_resolution);
    }

    #[test]
    fn test_builder_chaining() {
        let config = CaptureConfig::default()
            .artifact_dir("/ram")
            .image_freshness(Duration::from_millis(10))
            .clip_duration(Duration::from_millis(200))
            .idle_timeout(Duration::from_millis(500), Duration::from_millis(50));

        assert_eq!(config.artifact_dir, PathBuf::from("/ram"));
        assert_eq!(config.image_freshness_ms, 10);
        assert_eq!(config.clip_duration_ms, 200);
        assert_eq!(config.idle_timeout_ms, 500);
        assert_eq!(config.idle_tick_ms, 50);
    }

    #[test]
    fn test_zero_tick_is_clamped() {
        let config = CaptureConfig {
            idle_tick_ms: 0,
            ..Default::default()
        };

        assert_eq!(config.idle_tick_time(), Duration::from_millis(1));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: CaptureConfig =
            serde_json::from_str(r#"{ "clip_duration_ms": 5000 }"#).unwrap();

        assert_eq!(config.clip_duration_ms, 5000);
        assert_eq!(config.still_frame_rate, 15);
    }

    #[test]
    fn test_device_config_tagged() {
        let device: DeviceConfig =
            serde_json::from_str(r#"{ "kind": "synthetic", "chunk_size": 128 }"#).unwrap();

        assert_eq!(
            device,
            DeviceConfig::Synthetic(SyntheticConfig {
                chunk_size: 128,
                chunk_interval_ms: 33,
            })
        );

        let device: DeviceConfig = serde_json::from_str(r#"{ "kind": "libcamera" }"#).unwrap();
        assert_eq!(device, DeviceConfig::Libcamera(LibcameraConfig::default()));
    }
}
