//! camcast application wiring: configuration file and logging setup.

use std::path::Path;

use anyhow::{Context, Result};
use camcast_capture::{device_factory, CaptureConfig, CaptureManager, DeviceConfig};
use camcast_transport::BroadcastConfig;
use serde::{Deserialize, Serialize};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Log filter used when `RUST_LOG` is unset.
pub const DEFAULT_LOG_FILTER: &str =
    "camcast=info,camcast_capture=info,camcast_transport=info,camcast_buffer=info";

/// Server configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Camera implementation.
    pub device: DeviceConfig,

    /// Capture lifecycle settings.
    pub capture: CaptureConfig,

    /// Broadcast loop settings.
    pub broadcast: BroadcastConfig,
}

impl AppConfig {
    /// Load from a JSON file, or defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };

        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::from_json(&text).with_context(|| format!("Invalid config {}", path.display()))
    }

    /// Parse a JSON document. Missing keys take their defaults.
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Build the capture manager for the configured device.
    pub fn capture_manager(&self) -> CaptureManager {
        CaptureManager::new(self.capture.clone(), device_factory(&self.device))
    }
}

/// Install the global tracing subscriber.
pub fn init_logging() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
