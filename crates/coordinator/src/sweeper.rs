//! Deadline sweeper thread
//!
//! Wakes every `sweep_interval` and runs one `CoordinatorInner::sweep` pass.
//! Holds only a `Weak` reference to the coordinator, so a coordinator that
//! is dropped without `shutdown` does not leak through its own sweeper.

use crate::coordinator::CoordinatorInner;
use parking_lot::{Condvar, Mutex};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info};
use xact_core::{Result, XactError};

struct SweeperSignal {
    stopped: Mutex<bool>,
    wake: Condvar,
}

/// Handle to the running sweeper thread
pub(crate) struct Sweeper {
    signal: Arc<SweeperSignal>,
    handle: Option<JoinHandle<()>>,
}

impl Sweeper {
    /// Spawn the `xact-sweeper` thread.
    ///
    /// # Errors
    /// `XactError::Internal` if the thread cannot be spawned.
    pub(crate) fn spawn(inner: Weak<CoordinatorInner>, interval: Duration) -> Result<Self> {
        let signal = Arc::new(SweeperSignal {
            stopped: Mutex::new(false),
            wake: Condvar::new(),
        });
        let thread_signal = Arc::clone(&signal);
        let handle = std::thread::Builder::new()
            .name("xact-sweeper".to_string())
            .spawn(move || sweep_loop(&thread_signal, &inner, interval))
            .map_err(|e| XactError::Internal(format!("failed to spawn sweeper thread: {}", e)))?;

        info!(target: "xact::sweeper", interval_ms = interval.as_millis() as u64, "Sweeper started");
        Ok(Self {
            signal,
            handle: Some(handle),
        })
    }

    /// Signal the thread to exit and join it.
    pub(crate) fn stop(mut self) {
        {
            let mut stopped = self.signal.stopped.lock();
            *stopped = true;
            self.signal.wake.notify_all();
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        info!(target: "xact::sweeper", "Sweeper stopped");
    }
}

fn sweep_loop(signal: &SweeperSignal, inner: &Weak<CoordinatorInner>, interval: Duration) {
    loop {
        {
            let mut stopped = signal.stopped.lock();
            if *stopped {
                return;
            }
            signal.wake.wait_for(&mut stopped, interval);
            if *stopped {
                return;
            }
        }

        let inner = match inner.upgrade() {
            Some(inner) => inner,
            None => return,
        };
        let stats = inner.sweep();
        if stats.expired > 0 || stats.reaped > 0 {
            debug!(
                target: "xact::sweeper",
                expired = stats.expired,
                reaped = stats.reaped,
                "Sweep pass"
            );
        }
    }
}
