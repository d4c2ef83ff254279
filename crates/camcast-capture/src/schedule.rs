//! Cancellable background timers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{after, select, tick, Sender};
use tracing::{debug, warn};

/// A delayed or periodic job on its own thread.
///
/// Dropping the handle cancels the job but does not wait for it, so a job
/// may safely drop its own handle.
pub struct ScheduledTask {
    cancel_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
    fired: Arc<AtomicBool>,
}

impl ScheduledTask {
    /// Run `job` once after `delay` unless cancelled first.
    pub fn once<F>(name: &'static str, delay: Duration, job: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let (cancel_tx, cancel_rx) = crossbeam_channel::bounded::<()>(0);
        let fired = Arc::new(AtomicBool::new(false));
        let fired_flag = Arc::clone(&fired);

        let handle = spawn_named(name, move || {
            let deadline = after(delay);
            select! {
                recv(cancel_rx) -> _ => debug!(task = name, "Scheduled task cancelled"),
                recv(deadline) -> _ => {
                    fired_flag.store(true, Ordering::SeqCst);
                    job();
                }
            }
        });

        Self {
            cancel_tx: Some(cancel_tx),
            handle,
            fired,
        }
    }

    /// Run `job` every `interval` until it returns `false` or the task is
    /// cancelled.
    pub fn every<F>(name: &'static str, interval: Duration, mut job: F) -> Self
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let (cancel_tx, cancel_rx) = crossbeam_channel::bounded::<()>(0);
        let fired = Arc::new(AtomicBool::new(false));
        let fired_flag = Arc::clone(&fired);

        let handle = spawn_named(name, move || {
            let ticker = tick(interval);
            loop {
                select! {
                    recv(cancel_rx) -> _ => {
                        debug!(task = name, "Periodic task cancelled");
                        break;
                    }
                    recv(ticker) -> _ => {
                        fired_flag.store(true, Ordering::SeqCst);
                        if !job() {
                            debug!(task = name, "Periodic task finished");
                            break;
                        }
                    }
                }
            }
        });

        Self {
            cancel_tx: Some(cancel_tx),
            handle,
            fired,
        }
    }

    /// Cancel the job and wait for its thread.
    ///
    /// Returns `true` if the job never ran.
    pub fn cancel(mut self) -> bool {
        self.cancel_tx.take();
        if let Some(handle) = self.handle.take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
        !self.fired.load(Ordering::SeqCst)
    }

    /// Whether the job thread has exited.
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        // Disconnecting the channel wakes the job's `select!`.
        self.cancel_tx.take();
    }
}

fn spawn_named<F>(name: &'static str, body: F) -> Option<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    match thread::Builder::new().name(name.to_string()).spawn(body) {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!(task = name, error = %e, "Failed to spawn scheduled task");
            None
        }
    }
}
