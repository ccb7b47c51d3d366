//! Timer-driven pass scheduling.
//!
//! Passes are modelled as one-shot tasks. A recurring pass requests its own
//! next run when it finishes (see [`schedule_recurring`]), so a pass never
//! overlaps with the next run of itself, while passes for different sinks run
//! on independent timers.

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, warn};

/// A task run by a [`Scheduler`].
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Runs tasks after a delay.
pub trait Scheduler: Send + Sync {
    /// Run `task` no earlier than `delay` from now, unless cancelled first.
    fn schedule_after(&self, delay: Duration, task: Task);
}

/// What a recurring pass wants after it ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassControl {
    /// Run again after the interval.
    Continue,
    /// Do not run again.
    Stop,
}

struct SchedulerState {
    cancel_tx: Mutex<Option<Sender<()>>>,
    cancel_rx: Receiver<()>,
    cancelled: AtomicBool,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

/// Scheduler running each task on its own timer thread.
///
/// [`cancel`](Self::cancel) wakes every waiting timer and drops its task.
/// Tasks already running finish normally.
#[derive(Clone)]
pub struct ThreadScheduler {
    state: Arc<SchedulerState>,
}

impl ThreadScheduler {
    /// Create a scheduler.
    pub fn new() -> Self {
        let (cancel_tx, cancel_rx) = crossbeam_channel::bounded(0);
        Self {
            state: Arc::new(SchedulerState {
                cancel_tx: Mutex::new(Some(cancel_tx)),
                cancel_rx,
                cancelled: AtomicBool::new(false),
                threads: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Cancel every pending task and refuse new ones.
    pub fn cancel(&self) {
        self.state.cancelled.store(true, Ordering::SeqCst);
        // Dropping the only sender disconnects every waiting timer.
        self.state.cancel_tx.lock().take();
    }

    /// Whether [`cancel`](Self::cancel) was called.
    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }

    /// Wait for every timer thread, including ones started while waiting.
    pub fn join(&self) {
        loop {
            let threads = std::mem::take(&mut *self.state.threads.lock());
            if threads.is_empty() {
                return;
            }
            for handle in threads {
                if handle.join().is_err() {
                    warn!("Scheduled task panicked");
                }
            }
        }
    }
}

impl Default for ThreadScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for ThreadScheduler {
    fn schedule_after(&self, delay: Duration, task: Task) {
        if self.is_cancelled() {
            debug!("Scheduler cancelled; dropping task");
            return;
        }

        let cancel_rx = self.state.cancel_rx.clone();
        let handle = std::thread::spawn(move || match cancel_rx.recv_timeout(delay) {
            Err(RecvTimeoutError::Timeout) => task(),
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                debug!("Scheduled task cancelled");
            }
        });

        let mut threads = self.state.threads.lock();
        threads.retain(|t| !t.is_finished());
        threads.push(handle);
    }
}

/// Run `pass` after `initial_delay`, then again `interval` after each run
/// until it returns [`PassControl::Stop`] or the scheduler drops it.
pub fn schedule_recurring<F>(
    scheduler: Arc<dyn Scheduler>,
    initial_delay: Duration,
    interval: Duration,
    pass: F,
) where
    F: FnMut() -> PassControl + Send + 'static,
{
    arm(scheduler, initial_delay, interval, pass);
}

fn arm<F>(scheduler: Arc<dyn Scheduler>, delay: Duration, interval: Duration, mut pass: F)
where
    F: FnMut() -> PassControl + Send + 'static,
{
    let next = Arc::clone(&scheduler);
    scheduler.schedule_after(
        delay,
        Box::new(move || {
            if pass() == PassControl::Continue {
                arm(next, interval, interval, pass);
            }
        }),
    );
}
