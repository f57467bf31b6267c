//! Per-job time limits enforced through isolate termination

use crossbeam_channel::{Receiver, RecvTimeoutError};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tern_core::Isolate;
use tracing::{debug, warn};

const TICK: Duration = Duration::from_millis(5);

/// What the watchdog knows about one worker
pub(crate) struct WorkerSlot {
    isolate: Isolate,
    timeout_ms: u64,
    deadline: Mutex<Option<Instant>>,
    timed_out: AtomicBool,
}

impl WorkerSlot {
    pub fn new(isolate: Isolate, timeout_ms: u64) -> Self {
        Self {
            isolate,
            timeout_ms,
            deadline: Mutex::new(None),
            timed_out: AtomicBool::new(false),
        }
    }

    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }

    /// Arm the deadline for a job starting now
    pub fn begin(&self) {
        if self.timeout_ms > 0 {
            *self.deadline.lock() = Some(Instant::now() + Duration::from_millis(self.timeout_ms));
        }
    }

    /// Disarm the deadline. Returns whether the job was terminated for
    /// running past it.
    pub fn finish(&self) -> bool {
        let mut deadline = self.deadline.lock();
        *deadline = None;
        let timed_out = self.timed_out.swap(false, Ordering::SeqCst);
        if timed_out {
            // The request may have landed after the script finished
            self.isolate.cancel_terminate_execution();
        }
        timed_out
    }

    fn check(&self, now: Instant) {
        let mut deadline = self.deadline.lock();
        if deadline.is_some_and(|deadline| now >= deadline) {
            *deadline = None;
            self.timed_out.store(true, Ordering::SeqCst);
            warn!(timeout_ms = self.timeout_ms, "Job exceeded its time limit, terminating");
            self.isolate.terminate_execution();
        }
    }
}

/// Poll every slot until `stop` is signalled or dropped
pub(crate) fn spawn(slots: Vec<Arc<WorkerSlot>>, stop: Receiver<()>) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("tern-watchdog".to_string())
        .spawn(move || {
            debug!(workers = slots.len(), "Watchdog starting");
            loop {
                match stop.recv_timeout(TICK) {
                    Err(RecvTimeoutError::Timeout) => {
                        let now = Instant::now();
                        for slot in &slots {
                            slot.check(now);
                        }
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            debug!("Watchdog stopped");
        })
}
