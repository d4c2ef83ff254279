//! Software camera for tests and hardware-less runs.

use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::config::SyntheticConfig;
use crate::device::{CameraDevice, CaptureSettings, DeviceFactory, RecordingOutput};
use crate::error::CaptureError;
use crate::CaptureResult;

/// Counters shared by every [`SyntheticCamera`] opened from one factory.
#[derive(Debug, Default)]
pub struct SyntheticProbe {
    pub opened: AtomicUsize,
    pub closed: AtomicUsize,
    pub stills: AtomicUsize,
    pub recordings_started: AtomicUsize,
    pub recordings_stopped: AtomicUsize,
    pub bytes_produced: AtomicU64,
    pub bytes_dropped: AtomicU64,
    fail_open: AtomicBool,
    chunks_per_recording: AtomicUsize,
    last_settings: Mutex<Option<CaptureSettings>>,
}

impl SyntheticProbe {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make subsequent opens fail.
    pub fn set_fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }

    /// End each subsequent recording by itself after `chunks` chunks.
    /// Zero records until stopped.
    pub fn set_chunks_per_recording(&self, chunks: usize) {
        self.chunks_per_recording.store(chunks, Ordering::SeqCst);
    }

    /// Settings from the most recent `configure`.
    pub fn last_settings(&self) -> Option<CaptureSettings> {
        *self.last_settings.lock()
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn stills(&self) -> usize {
        self.stills.load(Ordering::SeqCst)
    }

    pub fn recordings_started(&self) -> usize {
        self.recordings_started.load(Ordering::SeqCst)
    }

    pub fn recordings_stopped(&self) -> usize {
        self.recordings_stopped.load(Ordering::SeqCst)
    }
}

struct Recording {
    stop_tx: Sender<()>,
    handle: JoinHandle<()>,
}

/// A camera that emits Annex-B shaped filler at a fixed pace.
pub struct SyntheticCamera {
    config: SyntheticConfig,
    probe: Arc<SyntheticProbe>,
    settings: Option<CaptureSettings>,
    recording: Option<Recording>,
}

impl SyntheticCamera {
    /// Open a synthetic camera.
    pub fn open(config: SyntheticConfig, probe: Arc<SyntheticProbe>) -> CaptureResult<Self> {
        if probe.fail_open.load(Ordering::SeqCst) {
            return Err(CaptureError::DeviceUnavailable(
                "synthetic camera configured to fail".to_string(),
            ));
        }

        probe.opened.fetch_add(1, Ordering::SeqCst);
        debug!(chunk_size = config.chunk_size, "Synthetic camera opened");

        Ok(Self {
            config,
            probe,
            settings: None,
            recording: None,
        })
    }

    /// Factory opening a new synthetic camera per call.
    pub fn factory(config: SyntheticConfig, probe: Arc<SyntheticProbe>) -> DeviceFactory {
        Arc::new(move || {
            let camera = SyntheticCamera::open(config.clone(), Arc::clone(&probe))?;
            Ok(Box::new(camera) as Box<dyn CameraDevice>)
        })
    }
}

impl CameraDevice for SyntheticCamera {
    fn configure(&mut self, settings: CaptureSettings) -> CaptureResult<()> {
        self.settings = Some(settings);
        *self.probe.last_settings.lock() = Some(settings);
        Ok(())
    }

    fn capture_still(&mut self, path: &Path) -> CaptureResult<()> {
        let label = self
            .settings
            .map(|s| s.resolution.to_string())
            .unwrap_or_default();

        let mut file = File::create(path)?;
        file.write_all(&[0xFF, 0xD8])?;
        file.write_all(label.as_bytes())?;
        file.write_all(&[0xFF, 0xD9])?;

        self.probe.stills.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    #[instrument(name = "synthetic_start", skip(self))]
    fn start_recording(&mut self, output: RecordingOutput) -> CaptureResult<()> {
        if self.recording.is_some() {
            return Err(CaptureError::AlreadyRecording);
        }

        let mut writer = ChunkWriter::new(output)?;
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(0);
        let interval = Duration::from_millis(self.config.chunk_interval_ms);
        let chunk_size = self.config.chunk_size.max(8);
        let probe = Arc::clone(&self.probe);
        let limit = probe.chunks_per_recording.load(Ordering::SeqCst);

        let handle = thread::Builder::new()
            .name("synthetic-camera".to_string())
            .spawn(move || {
                let mut sequence: u32 = 0;
                loop {
                    let chunk = synthetic_chunk(sequence, chunk_size);
                    match writer.write(&chunk) {
                        Ok(accepted) => {
                            probe
                                .bytes_produced
                                .fetch_add(chunk.len() as u64, Ordering::Relaxed);
                            // The unaccepted tail is dropped, never retried.
                            probe
                                .bytes_dropped
                                .fetch_add((chunk.len() - accepted) as u64, Ordering::Relaxed);
                        }
                        Err(e) => {
                            warn!(error = %e, "Synthetic recording write failed");
                            break;
                        }
                    }
                    sequence = sequence.wrapping_add(1);
                    if limit != 0 && sequence as usize >= limit {
                        debug!(chunks = sequence, "Synthetic recording ended");
                        break;
                    }

                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => continue,
                        _ => break,
                    }
                }
            })?;

        self.recording = Some(Recording { stop_tx, handle });
        self.probe.recordings_started.fetch_add(1, Ordering::SeqCst);
        info!("Synthetic recording started");
        Ok(())
    }

    fn stop_recording(&mut self) -> CaptureResult<()> {
        let Some(recording) = self.recording.take() else {
            return Ok(());
        };

        drop(recording.stop_tx);
        if recording.handle.join().is_err() {
            warn!("Synthetic recording thread panicked");
        }

        self.probe.recordings_stopped.fetch_add(1, Ordering::SeqCst);
        info!("Synthetic recording stopped");
        Ok(())
    }

    fn is_recording(&mut self) -> bool {
        self.recording
            .as_ref()
            .is_some_and(|recording| !recording.handle.is_finished())
    }

    fn close(&mut self) -> CaptureResult<()> {
        self.stop_recording()?;
        self.probe.closed.fetch_add(1, Ordering::SeqCst);
        debug!("Synthetic camera closed");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "synthetic"
    }
}

impl Drop for SyntheticCamera {
    fn drop(&mut self) {
        if let Err(e) = self.stop_recording() {
            warn!(error = %e, "Failed to stop recording on drop");
        }
    }
}

enum ChunkWriter {
    File(File),
    Sink(Arc<dyn camcast_buffer::ByteSink>),
}

impl ChunkWriter {
    fn new(output: RecordingOutput) -> CaptureResult<Self> {
        Ok(match output {
            RecordingOutput::File(path) => Self::File(File::create(path)?),
            RecordingOutput::Sink(sink) => Self::Sink(sink),
        })
    }

    fn write(&mut self, chunk: &[u8]) -> std::io::Result<usize> {
        match self {
            Self::File(file) => file.write_all(chunk).map(|()| chunk.len()),
            Self::Sink(sink) => Ok(sink.write(chunk)),
        }
    }
}

/// Start code, an IDR/non-IDR NAL header, sequence number, then filler.
fn synthetic_chunk(sequence: u32, size: usize) -> Vec<u8> {
    let nal_type = if sequence % 30 == 0 { 0x65 } else { 0x41 };
    let mut chunk = Vec::with_capacity(size);
    chunk.extend_from_slice(&[0x00, 0x00, 0x00, 0x01, nal_type]);
    chunk.extend_from_slice(&sequence.to_be_bytes()[1..]);
    chunk.resize(size, (sequence & 0xFF) as u8);
    chunk
}
