//! Signal handling for interruptible trials.
//!
//! A SIGINT (Ctrl+C) sets a shared flag. Every bounded wait in a trial sleeps
//! through [`ShutdownSignal::sleep`], which returns early once the flag is set,
//! so an interrupted trial still reaches its teardown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{CpuwatchError, Result};

/// Granularity at which sleeps re-check the shutdown flag.
const SLEEP_SLICE: Duration = Duration::from_millis(50);

/// Shared shutdown flag, optionally wired to SIGINT.
///
/// # Thread Safety
///
/// `ShutdownSignal` can be cloned to share across threads. The underlying
/// flag uses atomic operations.
#[derive(Clone, Default)]
pub struct ShutdownSignal {
    shutdown_flag: Arc<AtomicBool>,
}

impl ShutdownSignal {
    /// Creates a signal and registers the SIGINT handler.
    ///
    /// # Errors
    ///
    /// Returns an error if the handler cannot be registered (ctrlc only
    /// allows one registration per process).
    pub fn install() -> Result<Self> {
        let signal = Self::default();
        let flag_clone = Arc::clone(&signal.shutdown_flag);

        ctrlc::set_handler(move || {
            flag_clone.store(true, Ordering::SeqCst);
        })
        .map_err(|e| CpuwatchError::SignalHandler(e.to_string()))?;

        Ok(signal)
    }

    /// A signal with no OS handler attached. Only [`request_shutdown`]
    /// can trip it.
    ///
    /// [`request_shutdown`]: ShutdownSignal::request_shutdown
    pub fn detached() -> Self {
        Self::default()
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_flag.load(Ordering::SeqCst)
    }

    pub fn request_shutdown(&self) {
        self.shutdown_flag.store(true, Ordering::SeqCst);
    }

    /// Sleeps for `duration` unless shutdown is requested first.
    ///
    /// Returns `true` if the full duration elapsed, `false` if interrupted.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_shutdown_requested() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep(SLEEP_SLICE.min(deadline - now));
        }
    }
}
