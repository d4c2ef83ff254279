//! Camera lifecycle management.

use std::collections::HashMap;
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use camcast_buffer::{RecordingControl, RelayBuffer};
use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::config::CaptureConfig;
use crate::device::{CameraDevice, DeviceFactory, RecordingOutput, Resolution};
use crate::error::CaptureError;
use crate::schedule::ScheduledTask;
use crate::CaptureResult;

/// What the device is currently producing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activity {
    /// Opened, no output attached.
    Idle,

    /// Encoding into a relay buffer.
    Streaming,

    /// Recording a fixed-length clip.
    RecordingClip,
}

/// Externally visible lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    /// No device handle; the next operation opens one.
    Uninitialized,

    /// Device open.
    Active(Activity),
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uninitialized => f.write_str("uninitialized"),
            Self::Active(Activity::Idle) => f.write_str("idle"),
            Self::Active(Activity::Streaming) => f.write_str("streaming"),
            Self::Active(Activity::RecordingClip) => f.write_str("recording clip"),
        }
    }
}

struct CachedImage {
    path: PathBuf,
    captured_at: Instant,
}

struct DeviceState {
    device: Option<Box<dyn CameraDevice>>,
    activity: Activity,
    idle_remaining: Duration,
    /// Bumped on every open so a stale ticker can tell it is stale.
    generation: u64,
    /// Bumped on every stream start.
    stream_id: u64,
    last_image: Option<CachedImage>,
    ticker: Option<ScheduledTask>,
    pending_deletions: HashMap<PathBuf, ScheduledTask>,
    shut_down: bool,
}

impl DeviceState {
    fn device_mut(&mut self) -> CaptureResult<&mut (dyn CameraDevice + 'static)> {
        self.device
            .as_deref_mut()
            .ok_or_else(|| CaptureError::DeviceUnavailable("device not open".to_string()))
    }

    fn ensure_idle(&self) -> CaptureResult<()> {
        match self.activity {
            Activity::Idle => Ok(()),
            Activity::Streaming => Err(CaptureError::Busy("live stream in progress")),
            Activity::RecordingClip => Err(CaptureError::Busy("clip recording in progress")),
        }
    }
}

struct Shared {
    config: CaptureConfig,
    factory: DeviceFactory,
    state: Mutex<DeviceState>,
}

impl Shared {
    /// Reset the idle countdown and open the device if needed.
    fn acquire(self: &Arc<Self>, state: &mut DeviceState) -> CaptureResult<()> {
        if state.shut_down {
            return Err(CaptureError::ShutDown);
        }

        state.idle_remaining = self.config.idle_timeout_time();

        self.reap_dead_stream(state);

        if state.device.is_none() {
            let device = (self.factory)()?;
            state.generation += 1;
            info!(
                device = device.name(),
                generation = state.generation,
                "Capture device opened"
            );
            state.device = Some(device);
            state.ticker = Some(self.spawn_idle_ticker(state.generation));
        }

        Ok(())
    }

    fn spawn_idle_ticker(self: &Arc<Self>, generation: u64) -> ScheduledTask {
        let weak = Arc::downgrade(self);
        let tick = self.config.idle_tick_time();

        ScheduledTask::every("camera-idle", tick, move || match weak.upgrade() {
            Some(shared) => shared.idle_tick(generation, tick),
            None => false,
        })
    }

    /// One countdown step. Returns whether the ticker should keep running.
    fn idle_tick(&self, generation: u64, tick: Duration) -> bool {
        let mut state = self.state.lock();

        if state.device.is_none() || state.generation != generation {
            return false;
        }
        self.reap_dead_stream(&mut state);
        if state.activity != Activity::Idle {
            return true;
        }

        state.idle_remaining = state.idle_remaining.saturating_sub(tick);
        if !state.idle_remaining.is_zero() {
            return true;
        }

        self.teardown(&mut state, "idle timeout");
        // Detach our own handle; we are about to exit.
        state.ticker.take();
        false
    }

    /// Return a stream whose encoder ended on its own to idle.
    fn reap_dead_stream(&self, state: &mut DeviceState) {
        if state.activity != Activity::Streaming {
            return;
        }
        let Some(device) = state.device.as_deref_mut() else {
            return;
        };
        if device.is_recording() {
            return;
        }

        warn!(stream_id = state.stream_id, "Encoder exited, stream reset");
        if let Err(e) = device.stop_recording() {
            warn!(error = %e, "Failed to reap encoder");
        }
        state.activity = Activity::Idle;
        state.idle_remaining = self.config.idle_timeout_time();
    }

    fn teardown(&self, state: &mut DeviceState, reason: &str) {
        if let Some(mut device) = state.device.take() {
            if let Err(e) = device.close() {
                warn!(error = %e, "Capture device close failed");
            }
            info!(reason, "Capture device closed");
        }
        state.activity = Activity::Idle;
        state.last_image = None;
    }

    fn schedule_deletion(&self, state: &mut DeviceState, path: PathBuf, delay: Duration) {
        state.pending_deletions.retain(|_, task| !task.is_finished());

        let target = path.clone();
        let task = ScheduledTask::once("artifact-delete", delay, move || remove_artifact(&target));
        state.pending_deletions.insert(path, task);
    }

    #[instrument(name = "stop_stream", skip(self))]
    fn stop_stream(&self, stream_id: Option<u64>) -> CaptureResult<()> {
        let mut state = self.state.lock();

        if state.activity != Activity::Streaming {
            return Ok(());
        }
        if stream_id.is_some_and(|id| id != state.stream_id) {
            debug!("Ignoring stop from a superseded stream");
            return Ok(());
        }

        state.activity = Activity::Idle;
        state.idle_remaining = self.config.idle_timeout_time();
        if let Some(device) = state.device.as_deref_mut() {
            device.stop_recording()?;
        }

        info!("Streaming stopped");
        Ok(())
    }
}

/// Stops the stream a relay buffer was attached to.
struct StreamControl {
    shared: Weak<Shared>,
    stream_id: u64,
}

impl RecordingControl for StreamControl {
    fn stop_recording(&self) {
        if let Some(shared) = self.shared.upgrade() {
            if let Err(e) = shared.stop_stream(Some(self.stream_id)) {
                warn!(error = %e, "Failed to stop streaming");
            }
        }
    }
}

/// Owns the camera: opens it lazily, serializes every operation behind one
/// lock and closes it after an idle period.
///
/// The idle countdown only runs while no output is active.
pub struct CaptureManager {
    shared: Arc<Shared>,
}

impl CaptureManager {
    /// Create a manager. No device is opened until first use.
    pub fn new(config: CaptureConfig, factory: DeviceFactory) -> Self {
        let idle_remaining = config.idle_timeout_time();
        Self {
            shared: Arc::new(Shared {
                config,
                factory,
                state: Mutex::new(DeviceState {
                    device: None,
                    activity: Activity::Idle,
                    idle_remaining,
                    generation: 0,
                    stream_id: 0,
                    last_image: None,
                    ticker: None,
                    pending_deletions: HashMap::new(),
                    shut_down: false,
                }),
            }),
        }
    }

    /// Capture a JPEG still and return its path.
    ///
    /// A still younger than the freshness window is returned as is. With
    /// `auto_delete` the file is removed after twice the freshness window.
    #[instrument(name = "capture_image", skip(self))]
    pub fn capture_image(
        &self,
        auto_delete: bool,
        resolution: Option<Resolution>,
    ) -> CaptureResult<PathBuf> {
        let shared = &self.shared;
        let config = &shared.config;
        let mut state = shared.state.lock();
        shared.acquire(&mut state)?;

        if let Some(cached) = &state.last_image {
            if cached.captured_at.elapsed() < config.image_freshness_window() {
                debug!(path = %cached.path.display(), "Reusing fresh still");
                return Ok(cached.path.clone());
            }
        }

        state.ensure_idle()?;

        let path = new_artifact(&config.artifact_dir, ".jpg")?;
        let device = state.device_mut()?;
        let captured = device
            .configure(config.still_settings(resolution))
            .and_then(|()| device.capture_still(&path));
        if let Err(e) = captured {
            remove_artifact(&path);
            return Err(e);
        }

        state.last_image = Some(CachedImage {
            path: path.clone(),
            captured_at: Instant::now(),
        });
        if auto_delete {
            shared.schedule_deletion(&mut state, path.clone(), config.image_freshness_window() * 2);
        }

        debug!(path = %path.display(), "Still captured");
        Ok(path)
    }

    /// Record a fixed-length H.264 clip and return its path.
    ///
    /// The device lock is released while the clip records; concurrent
    /// operations fail with [`CaptureError::Busy`] meanwhile.
    #[instrument(name = "capture_video_clip", skip(self))]
    pub fn capture_video_clip(&self, auto_delete: bool) -> CaptureResult<PathBuf> {
        let shared = &self.shared;
        let config = &shared.config;

        let path = {
            let mut state = shared.state.lock();
            shared.acquire(&mut state)?;
            state.ensure_idle()?;

            let path = new_artifact(&config.artifact_dir, ".h264")?;
            let device = state.device_mut()?;
            let started = device
                .configure(config.clip_settings())
                .and_then(|()| device.start_recording(RecordingOutput::File(path.clone())));
            if let Err(e) = started {
                remove_artifact(&path);
                return Err(e);
            }

            state.activity = Activity::RecordingClip;
            path
        };

        info!(
            path = %path.display(),
            duration_ms = config.clip_duration_ms,
            "Recording clip"
        );
        thread::sleep(config.clip_duration_time());

        let mut state = shared.state.lock();
        if state.activity == Activity::RecordingClip {
            state.activity = Activity::Idle;
        }
        state.idle_remaining = config.idle_timeout_time();

        let stopped = match state.device.as_deref_mut() {
            Some(device) => device.stop_recording(),
            None => Err(CaptureError::ShutDown),
        };
        if let Err(e) = stopped {
            remove_artifact(&path);
            return Err(e);
        }

        if auto_delete {
            shared.schedule_deletion(&mut state, path.clone(), config.clip_delete_delay_time());
        }

        Ok(path)
    }

    /// Start continuous encoding into `buffer`. Returns immediately.
    ///
    /// The stream runs until [`RelayBuffer::stop`] or
    /// [`stop_streaming`](Self::stop_streaming).
    #[instrument(name = "start_streaming", skip_all)]
    pub fn start_streaming(&self, buffer: Arc<RelayBuffer>) -> CaptureResult<()> {
        let shared = &self.shared;
        let mut state = shared.state.lock();
        shared.acquire(&mut state)?;
        state.ensure_idle()?;

        let device = state.device_mut()?;
        device.configure(shared.config.stream_settings())?;
        device.start_recording(RecordingOutput::Sink(buffer.clone()))?;

        state.activity = Activity::Streaming;
        state.stream_id += 1;
        buffer.attach(Arc::new(StreamControl {
            shared: Arc::downgrade(shared),
            stream_id: state.stream_id,
        }));

        info!(
            resolution = %shared.config.stream_resolution,
            fps = shared.config.stream_frame_rate,
            "Streaming started"
        );
        Ok(())
    }

    /// Stop the live stream, if any.
    pub fn stop_streaming(&self) -> CaptureResult<()> {
        self.shared.stop_stream(None)
    }

    /// Cancel a pending auto-deletion of `path`.
    ///
    /// Returns `true` if the file was still scheduled, in which case the
    /// caller now owns it.
    pub fn retain(&self, path: &Path) -> bool {
        let task = self.shared.state.lock().pending_deletions.remove(path);
        // Cancel outside the lock: the job may be waiting on it.
        task.is_some_and(ScheduledTask::cancel)
    }

    /// Current lifecycle state.
    pub fn status(&self) -> DeviceStatus {
        let mut state = self.shared.state.lock();
        self.shared.reap_dead_stream(&mut state);
        match state.device {
            Some(_) => DeviceStatus::Active(state.activity),
            None => DeviceStatus::Uninitialized,
        }
    }

    /// Whether a live stream is running.
    pub fn is_streaming(&self) -> bool {
        self.status() == DeviceStatus::Active(Activity::Streaming)
    }

    /// Capture configuration.
    pub fn config(&self) -> &CaptureConfig {
        &self.shared.config
    }

    /// Close the device and stop background tasks. Idempotent.
    ///
    /// Files still scheduled for deletion are removed now.
    #[instrument(name = "capture_shutdown", skip(self))]
    pub fn shutdown(&self) {
        let (ticker, deletions) = {
            let mut state = self.shared.state.lock();
            if state.shut_down {
                return;
            }
            state.shut_down = true;
            self.shared.teardown(&mut state, "shutdown");
            (
                state.ticker.take(),
                std::mem::take(&mut state.pending_deletions),
            )
        };

        if let Some(ticker) = ticker {
            ticker.cancel();
        }
        for (path, task) in deletions {
            if task.cancel() {
                remove_artifact(&path);
            }
        }
    }
}

impl Drop for CaptureManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn new_artifact(dir: &Path, suffix: &str) -> CaptureResult<PathBuf> {
    let file = tempfile::Builder::new()
        .prefix("camcast-")
        .suffix(suffix)
        .tempfile_in(dir)?;
    let (_file, path) = file.keep().map_err(|e| CaptureError::Io(e.error))?;
    Ok(path)
}

fn remove_artifact(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "Artifact removed"),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove artifact"),
    }
}
