use std::cell::Cell;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

use crate::error::Result;

/// Requests a stop. Cloneable; any clone can fire.
#[derive(Debug, Clone)]
pub struct StopHandle {
    tx: Sender<()>,
}

impl StopHandle {
    pub fn stop(&self) {
        let _ = self.tx.send(());
    }
}

/// Observed by the monitoring loop between actions and while idle.
///
/// Once seen, a stop stays requested. A command that is already running is
/// never interrupted.
#[derive(Debug)]
pub struct StopSignal {
    rx: Receiver<()>,
    requested: Cell<bool>,
}

impl StopSignal {
    pub fn channel() -> (StopHandle, StopSignal) {
        let (tx, rx) = mpsc::channel();
        (
            StopHandle { tx },
            StopSignal {
                rx,
                requested: Cell::new(false),
            },
        )
    }

    /// Route SIGINT and SIGTERM to a stop request.
    ///
    /// Once installed, an interrupt no longer kills the process: the running
    /// command finishes, the rest of the pass is left pending and the loop
    /// stops.
    pub fn install_interrupt_handler() -> Result<StopSignal> {
        let (handle, signal) = Self::channel();
        ctrlc::set_handler(move || {
            tracing::info!("received interrupt, stopping after the current action");
            handle.stop();
        })?;
        Ok(signal)
    }

    /// Non-blocking check for a stop request.
    pub fn is_requested(&self) -> bool {
        if !self.requested.get() && self.rx.try_recv().is_ok() {
            self.requested.set(true);
        }
        self.requested.get()
    }

    /// Sleep for up to `timeout`. Returns `true` as soon as a stop is
    /// requested, including one requested before the call.
    pub fn wait(&self, timeout: Duration) -> bool {
        if self.requested.get() {
            return true;
        }
        match self.rx.recv_timeout(timeout) {
            Ok(()) => {
                self.requested.set(true);
                true
            }
            Err(RecvTimeoutError::Timeout) => false,
            // Every handle is gone, so no stop can arrive; still honour the sleep.
            Err(RecvTimeoutError::Disconnected) => {
                std::thread::sleep(timeout);
                false
            }
        }
    }
}
