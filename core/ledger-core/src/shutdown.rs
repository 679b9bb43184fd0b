//! Cooperative cancellation for the polling loop.
//!
//! A `Shutdown` is a shared flag. The scheduler checks it only between
//! cycles, so a stop request never interrupts a reconciliation transaction.

use once_cell::sync::OnceCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{LedgerError, Result};

const SLEEP_SLICE: Duration = Duration::from_millis(200);

static SIGNAL_TARGET: OnceCell<Shutdown> = OnceCell::new();

#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    requested: Arc<AtomicBool>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Sleeps up to `duration`, waking early on a stop request.
    ///
    /// Returns true if shutdown was requested.
    pub fn sleep(&self, duration: Duration) -> bool {
        // An unrepresentable deadline means wait for a stop request only.
        let deadline = Instant::now().checked_add(duration);
        loop {
            if self.is_requested() {
                return true;
            }
            let slice = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    SLEEP_SLICE.min(deadline - now)
                }
                None => SLEEP_SLICE,
            };
            thread::sleep(slice);
        }
    }
}

extern "C" fn handle_stop_signal(_signal: libc::c_int) {
    // Only an atomic store happens here, which is async-signal-safe.
    if let Some(shutdown) = SIGNAL_TARGET.get() {
        shutdown.request();
    }
}

/// Routes SIGINT and SIGTERM to `shutdown`.
///
/// Only the first token registered receives signals.
pub fn install_signal_handlers(shutdown: &Shutdown) -> Result<()> {
    let _ = SIGNAL_TARGET.set(shutdown.clone());

    for signal in [libc::SIGINT, libc::SIGTERM] {
        // SAFETY: the handler only performs an atomic store through a
        // pointer that lives for the rest of the process.
        let previous = unsafe {
            libc::signal(
                signal,
                handle_stop_signal as extern "C" fn(libc::c_int) as libc::sighandler_t,
            )
        };
        if previous == libc::SIG_ERR {
            return Err(LedgerError::Io {
                context: format!("Failed to install handler for signal {}", signal),
                source: std::io::Error::last_os_error(),
            });
        }
    }
    Ok(())
}
