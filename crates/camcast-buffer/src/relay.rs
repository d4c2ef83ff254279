//! The relay buffer itself.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use parking_lot::{Condvar, Mutex};
use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::sink::{ByteSink, RecordingControl};

struct BufferState {
    data: BytesMut,
    recorder: Option<Arc<dyn RecordingControl>>,
}

/// Thread-safe FIFO byte buffer with optional capacity.
///
/// Writers never block: bytes beyond the remaining capacity are dropped and
/// the short count is returned. Readers either block on [`read`](Self::read)
/// or await [`readable`](Self::readable) from an async loop.
pub struct RelayBuffer {
    state: Mutex<BufferState>,
    data_ready: Condvar,
    notify: Notify,
    capacity: Option<usize>,
    bytes_accepted: AtomicU64,
    bytes_dropped: AtomicU64,
}

/// Point-in-time buffer counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferStats {
    /// Bytes currently buffered.
    pub buffered: usize,

    /// Capacity cap, if any.
    pub capacity: Option<usize>,

    /// Total bytes accepted since creation.
    pub bytes_accepted: u64,

    /// Total bytes truncated because the buffer was full.
    pub bytes_dropped: u64,
}

impl RelayBuffer {
    /// Create a buffer with no capacity cap.
    pub fn unbounded() -> Self {
        Self::with_capacity(None)
    }

    /// Create a buffer capped at `capacity` bytes.
    pub fn bounded(capacity: usize) -> Self {
        Self::with_capacity(Some(capacity))
    }

    /// Create a buffer with an optional cap.
    pub fn with_capacity(capacity: Option<usize>) -> Self {
        Self {
            state: Mutex::new(BufferState {
                data: BytesMut::new(),
                recorder: None,
            }),
            data_ready: Condvar::new(),
            notify: Notify::new(),
            capacity,
            bytes_accepted: AtomicU64::new(0),
            bytes_dropped: AtomicU64::new(0),
        }
    }

    /// Append up to the remaining capacity of `chunk`.
    ///
    /// Returns the number of bytes accepted; anything less than
    /// `chunk.len()` means the tail was dropped.
    pub fn write(&self, chunk: &[u8]) -> usize {
        if chunk.is_empty() {
            return 0;
        }

        let accepted = {
            let mut state = self.state.lock();
            let accepted = match self.capacity {
                Some(cap) => cap.saturating_sub(state.data.len()).min(chunk.len()),
                None => chunk.len(),
            };
            state.data.extend_from_slice(&chunk[..accepted]);
            accepted
        };

        let dropped = chunk.len() - accepted;
        if dropped > 0 {
            self.bytes_dropped.fetch_add(dropped as u64, Ordering::Relaxed);
            trace!(dropped, "Relay buffer full, write truncated");
        }

        if accepted > 0 {
            self.bytes_accepted
                .fetch_add(accepted as u64, Ordering::Relaxed);
            self.data_ready.notify_one();
            // Stores a permit when nobody is waiting yet.
            self.notify.notify_one();
        }

        accepted
    }

    /// Block until at least one byte is buffered, then remove and return up
    /// to `max_size` bytes (everything when `None`).
    pub fn read(&self, max_size: Option<usize>) -> Bytes {
        let mut state = self.state.lock();
        while state.data.is_empty() {
            self.data_ready.wait(&mut state);
        }
        take_front(&mut state.data, max_size)
    }

    /// Like [`read`](Self::read) but gives up after `timeout`.
    pub fn read_timeout(&self, max_size: Option<usize>, timeout: Duration) -> Option<Bytes> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.data.is_empty() {
            if self.data_ready.wait_until(&mut state, deadline).timed_out() {
                if state.data.is_empty() {
                    return None;
                }
                break;
            }
        }
        Some(take_front(&mut state.data, max_size))
    }

    /// Remove up to `max_size` bytes without waiting.
    pub fn try_read(&self, max_size: Option<usize>) -> Option<Bytes> {
        let mut state = self.state.lock();
        if state.data.is_empty() {
            None
        } else {
            Some(take_front(&mut state.data, max_size))
        }
    }

    /// Resolve once the buffer holds data.
    ///
    /// Cancel-safe, so it can sit in a `select!` next to a socket.
    pub async fn readable(&self) {
        loop {
            if !self.is_empty() {
                return;
            }
            self.notify.notified().await;
        }
    }

    /// Associate the producer that feeds this buffer.
    ///
    /// [`stop`](Self::stop) will halt it.
    pub fn attach(&self, recorder: Arc<dyn RecordingControl>) {
        self.state.lock().recorder = Some(recorder);
    }

    /// Halt the attached producer, if any, and discard buffered bytes.
    ///
    /// Idempotent.
    pub fn stop(&self) {
        let recorder = self.state.lock().recorder.take();
        // The producer may call back into `write` while stopping.
        if let Some(recorder) = recorder {
            recorder.stop_recording();
        }

        let discarded = {
            let mut state = self.state.lock();
            let len = state.data.len();
            state.data.clear();
            len
        };

        debug!(discarded, "Relay buffer stopped");
    }

    /// Bytes currently buffered.
    pub fn len(&self) -> usize {
        self.state.lock().data.len()
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.state.lock().data.is_empty()
    }

    /// Capacity cap, if any.
    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    /// Snapshot of the buffer counters.
    pub fn stats(&self) -> BufferStats {
        BufferStats {
            buffered: self.len(),
            capacity: self.capacity,
            bytes_accepted: self.bytes_accepted.load(Ordering::Relaxed),
            bytes_dropped: self.bytes_dropped.load(Ordering::Relaxed),
        }
    }

    /// Blocking iterator over successive reads.
    ///
    /// The buffer is stopped when the iterator is dropped.
    pub fn stream(self: &Arc<Self>) -> RelayStream {
        RelayStream {
            buffer: Arc::clone(self),
        }
    }
}

impl Default for RelayBuffer {
    fn default() -> Self {
        Self::unbounded()
    }
}

impl ByteSink for RelayBuffer {
    fn write(&self, chunk: &[u8]) -> usize {
        RelayBuffer::write(self, chunk)
    }
}

impl std::fmt::Debug for RelayBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayBuffer")
            .field("stats", &self.stats())
            .finish()
    }
}

fn take_front(data: &mut BytesMut, max_size: Option<usize>) -> Bytes {
    let len = max_size.map_or(data.len(), |max| max.min(data.len()));
    data.split_to(len).freeze()
}

/// Iterator returned by [`RelayBuffer::stream`].
pub struct RelayStream {
    buffer: Arc<RelayBuffer>,
}

impl Iterator for RelayStream {
    type Item = Bytes;

    fn next(&mut self) -> Option<Bytes> {
        Some(self.buffer.read(None))
    }
}

impl Drop for RelayStream {
    fn drop(&mut self) {
        self.buffer.stop();
    }
}
