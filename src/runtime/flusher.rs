//! Background flush worker.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::error::Result;

/// Initial backoff after a failed flush cycle.
const BACKOFF_BASE: Duration = Duration::from_secs(1);
/// Backoff ceiling; the worker never waits longer than this after errors.
const BACKOFF_CAP: Duration = Duration::from_secs(60);

/// Result of one flush cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// A batch of this many records was committed.
    Flushed(usize),
    /// Nothing was pending.
    Idle,
    /// The owning storage instance is gone; the worker should exit.
    Detached,
}

/// Wakeup channel between writers and the worker.
#[derive(Debug, Default)]
pub struct FlushSignal {
    notified: Mutex<bool>,
    condvar: Condvar,
    shutdown: AtomicBool,
}

impl FlushSignal {
    /// Wakes the worker for an early cycle.
    pub fn notify(&self) {
        let mut notified = self.notified.lock();
        *notified = true;
        self.condvar.notify_one();
    }

    /// Asks the worker to finish its current cycle and exit.
    fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.notify();
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Blocks up to `timeout` for a notification, consuming it.
    fn wait(&self, timeout: Duration) {
        let mut notified = self.notified.lock();
        if !*notified && !self.is_shutdown() {
            self.condvar.wait_for(&mut notified, timeout);
        }
        *notified = false;
    }
}

/// One background thread driving periodic and demand flushes.
///
/// The cycle closure is expected to hold a `Weak` back-reference to its
/// storage and return [`CycleOutcome::Detached`] once the upgrade fails,
/// so a leaked worker cannot keep an instance alive.
#[derive(Debug)]
pub struct FlushWorker {
    signal: Arc<FlushSignal>,
    handle: Option<JoinHandle<()>>,
}

impl FlushWorker {
    /// Spawns the worker loop with the given periodic interval.
    pub fn spawn<F>(interval: Duration, mut cycle: F) -> Self
    where
        F: FnMut() -> Result<CycleOutcome> + Send + 'static,
    {
        let signal = Arc::new(FlushSignal::default());
        let loop_signal = Arc::clone(&signal);

        let handle = thread::spawn(move || {
            let mut wait_for = interval;
            let mut backoff = BACKOFF_BASE;
            loop {
                loop_signal.wait(wait_for);
                if loop_signal.is_shutdown() {
                    break;
                }
                match cycle() {
                    Ok(CycleOutcome::Detached) => break,
                    Ok(outcome) => {
                        debug!(?outcome, "flush cycle completed");
                        backoff = BACKOFF_BASE;
                        wait_for = interval;
                    }
                    Err(err) => {
                        // Batch and segments stay pending; retry later.
                        warn!(%err, retry_in = ?backoff, "flush cycle failed; backing off");
                        wait_for = backoff;
                        backoff = (backoff * 2).min(BACKOFF_CAP);
                    }
                }
            }
        });

        Self {
            signal,
            handle: Some(handle),
        }
    }

    /// Shared wakeup handle for writers.
    pub fn signal(&self) -> Arc<FlushSignal> {
        Arc::clone(&self.signal)
    }

    /// Requests shutdown and waits for the worker to exit.
    pub fn shutdown(&mut self) {
        self.signal.request_shutdown();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("flush worker panicked before shutdown");
            }
        }
    }
}

impl Drop for FlushWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}
