//! Raspberry Pi camera driven through the libcamera apps.

use std::io::{ErrorKind, Read};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use camcast_buffer::ByteSink;
use tracing::{debug, info, instrument, trace, warn};

use crate::config::LibcameraConfig;
use crate::device::{CameraDevice, CaptureSettings, DeviceFactory, RecordingOutput};
use crate::error::CaptureError;
use crate::CaptureResult;

/// Read size for the encoder's stdout.
const PUMP_CHUNK_SIZE: usize = 64 * 1024;

struct ChildRecording {
    child: Child,
    pump: Option<JoinHandle<()>>,
}

/// Camera backed by `libcamera-still` and `libcamera-vid` subprocesses.
pub struct LibcameraDevice {
    config: LibcameraConfig,
    settings: Option<CaptureSettings>,
    recording: Option<ChildRecording>,
}

impl LibcameraDevice {
    /// Probe for a camera and open the device.
    #[instrument(name = "libcamera_open", skip_all)]
    pub fn open(config: LibcameraConfig) -> CaptureResult<Self> {
        let output = Command::new(&config.video_command)
            .arg("--list-cameras")
            .stdin(Stdio::null())
            .output()
            .map_err(|e| {
                if e.kind() == ErrorKind::NotFound {
                    CaptureError::DeviceUnavailable(format!(
                        "{} not found",
                        config.video_command
                    ))
                } else {
                    CaptureError::Io(e)
                }
            })?;

        let listing = String::from_utf8_lossy(&output.stdout);
        let errors = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() || listing.contains("No cameras") || errors.contains("No cameras") {
            return Err(CaptureError::DeviceUnavailable(
                "no camera detected by libcamera".to_string(),
            ));
        }

        info!(command = %config.video_command, "Camera opened");
        Ok(Self {
            config,
            settings: None,
            recording: None,
        })
    }

    /// Factory opening a new device per call.
    pub fn factory(config: LibcameraConfig) -> DeviceFactory {
        Arc::new(move || {
            let device = LibcameraDevice::open(config.clone())?;
            Ok(Box::new(device) as Box<dyn CameraDevice>)
        })
    }

    fn mode_args(&self) -> Vec<String> {
        let mut args = vec!["-n".to_string()];
        if let Some(settings) = self.settings {
            args.extend([
                "--width".to_string(),
                settings.resolution.width.to_string(),
                "--height".to_string(),
                settings.resolution.height.to_string(),
                "--framerate".to_string(),
                settings.frame_rate.to_string(),
            ]);
        }
        args.extend(self.config.extra_args.iter().cloned());
        args
    }
}

impl CameraDevice for LibcameraDevice {
    fn configure(&mut self, settings: CaptureSettings) -> CaptureResult<()> {
        debug!(resolution = %settings.resolution, fps = settings.frame_rate, "Configure");
        self.settings = Some(settings);
        Ok(())
    }

    #[instrument(name = "libcamera_still", skip(self))]
    fn capture_still(&mut self, path: &Path) -> CaptureResult<()> {
        let status = Command::new(&self.config.still_command)
            .args(self.mode_args())
            .args(["-t", "1", "-e", "jpg", "-o"])
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()?;

        if !status.success() {
            return Err(CaptureError::CommandFailed {
                command: self.config.still_command.clone(),
                status,
            });
        }
        Ok(())
    }

    #[instrument(name = "libcamera_record", skip(self))]
    fn start_recording(&mut self, output: RecordingOutput) -> CaptureResult<()> {
        if self.recording.is_some() {
            return Err(CaptureError::AlreadyRecording);
        }

        let mut command = Command::new(&self.config.video_command);
        // --inline repeats SPS/PPS so late subscribers can decode.
        command
            .args(self.mode_args())
            .args(["-t", "0", "--codec", "h264", "--inline", "-o"])
            .stdin(Stdio::null())
            .stderr(Stdio::null());

        let recording = match output {
            RecordingOutput::File(path) => {
                let child = command.arg(path).stdout(Stdio::null()).spawn()?;
                ChildRecording { child, pump: None }
            }
            RecordingOutput::Sink(sink) => {
                let mut child = command.arg("-").stdout(Stdio::piped()).spawn()?;
                let stdout = child.stdout.take().ok_or_else(|| {
                    CaptureError::Device("encoder stdout unavailable".to_string())
                })?;
                let pump = thread::Builder::new()
                    .name("libcamera-pump".to_string())
                    .spawn(move || pump_into_sink(stdout, sink))?;
                ChildRecording {
                    child,
                    pump: Some(pump),
                }
            }
        };

        info!(pid = recording.child.id(), "Recording started");
        self.recording = Some(recording);
        Ok(())
    }

    fn stop_recording(&mut self) -> CaptureResult<()> {
        let Some(mut recording) = self.recording.take() else {
            return Ok(());
        };

        match recording.child.try_wait()? {
            Some(status) => debug!(%status, "Encoder already exited"),
            None => {
                recording.child.kill()?;
                recording.child.wait()?;
            }
        }

        // Stdout hits EOF once the child is gone.
        if let Some(pump) = recording.pump.take() {
            if pump.join().is_err() {
                warn!("Pump thread panicked");
            }
        }

        info!("Recording stopped");
        Ok(())
    }

    fn is_recording(&mut self) -> bool {
        let Some(recording) = self.recording.as_mut() else {
            return false;
        };
        let pump_done = recording.pump.as_ref().is_some_and(JoinHandle::is_finished);
        !pump_done && matches!(recording.child.try_wait(), Ok(None))
    }

    fn close(&mut self) -> CaptureResult<()> {
        self.stop_recording()?;
        info!("Camera closed");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "libcamera"
    }
}

impl Drop for LibcameraDevice {
    fn drop(&mut self) {
        if let Err(e) = self.stop_recording() {
            warn!(error = %e, "Failed to stop recording on drop");
        }
    }
}

fn pump_into_sink(mut source: impl Read, sink: Arc<dyn ByteSink>) {
    let mut chunk = vec![0u8; PUMP_CHUNK_SIZE];
    let mut dropped: u64 = 0;

    loop {
        match source.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                let accepted = sink.write(&chunk[..n]);
                if accepted < n {
                    dropped += (n - accepted) as u64;
                    trace!(dropped = n - accepted, "Sink full, dropping encoder output");
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!(error = %e, "Encoder output read failed");
                break;
            }
        }
    }

    debug!(total_dropped = dropped, "Encoder pump finished");
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use camcast_buffer::RelayBuffer;

    use super::*;

    #[test]
    fn test_missing_tool_is_device_unavailable() {
        let config = LibcameraConfig {
            video_command: "camcast-no-such-libcamera-vid".to_string(),
            ..Default::default()
        };

        let result = LibcameraDevice::open(config);
        assert!(matches!(result, Err(CaptureError::DeviceUnavailable(_))));
    }

    #[test]
    fn test_pump_copies_until_eof() {
        let buffer = Arc::new(RelayBuffer::unbounded());
        let source = Cursor::new(vec![42u8; PUMP_CHUNK_SIZE * 2 + 10]);

        pump_into_sink(source, buffer.clone());
        assert_eq!(buffer.len(), PUMP_CHUNK_SIZE * 2 + 10);
    }

    #[test]
    fn test_pump_drops_what_sink_refuses() {
        let buffer = Arc::new(RelayBuffer::bounded(100));
        let source = Cursor::new(vec![1u8; 1000]);

        pump_into_sink(source, buffer.clone());
        let stats = buffer.stats();
        assert_eq!(stats.buffered, 100);
        assert_eq!(stats.bytes_dropped, 900);
    }

    #[cfg(unix)]
    #[test]
    fn test_encoder_exit_ends_recording() {
        let config = LibcameraConfig {
            video_command: "true".to_string(),
            ..Default::default()
        };
        let mut device = LibcameraDevice::open(config).unwrap();
        let buffer = Arc::new(RelayBuffer::unbounded());

        device
            .start_recording(RecordingOutput::Sink(buffer))
            .unwrap();

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        while device.is_recording() && std::time::Instant::now() < deadline {
            thread::sleep(std::time::Duration::from_millis(10));
        }
        assert!(!device.is_recording());

        device.stop_recording().unwrap();
        assert!(!device.is_recording());
    }

    #[test]
    fn test_mode_args_include_settings() {
        let mut device = LibcameraDevice {
            config: LibcameraConfig {
                extra_args: vec!["--hflip".to_string()],
                ..Default::default()
            },
            settings: None,
            recording: None,
        };
        device
            .configure(CaptureSettings {
                resolution: (1920, 1080).into(),
                frame_rate: 30,
            })
            .unwrap();

        let args = device.mode_args();
        assert_eq!(
            args,
            ["-n", "--width", "1920", "--height", "1080", "--framerate", "30", "--hflip"]
        );
    }
}
